//! One-producer to N-subscriber broadcast with bounded
//! per-subscriber queues.
//!
//! A [Hub] decouples a stream producer (log follower, stats sampler)
//! from the websocket write pumps consuming it. The producer is never
//! blocked: frames that do not fit a subscriber's queue are dropped
//! for that subscriber only.

use std::{
  collections::HashMap,
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
  },
};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Queue capacity used for log stream subscribers.
pub const LOG_QUEUE_CAPACITY: usize = 1024;
/// Queue capacity used for stats stream subscribers.
pub const STATS_QUEUE_CAPACITY: usize = 64;

type OnEmpty = Box<dyn FnMut() + Send + 'static>;

enum Command {
  Register(Subscriber),
  Unregister(Uuid),
  Broadcast(Bytes),
}

struct HubInner {
  capacity: usize,
  running: AtomicBool,
  subscriber_count: AtomicUsize,
  dropped_frames: AtomicU64,
  sender: mpsc::UnboundedSender<Command>,
  on_empty: Mutex<Option<OnEmpty>>,
}

/// Handle to a running fan-out loop. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
  inner: Arc<HubInner>,
}

impl Hub {
  /// Create a hub with the given per-subscriber queue capacity.
  /// The [HubRunner] must be driven ([HubRunner::run]) before
  /// subscribers can register.
  pub fn new(capacity: usize) -> (Hub, HubRunner) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let inner = Arc::new(HubInner {
      capacity,
      running: AtomicBool::new(false),
      subscriber_count: AtomicUsize::new(0),
      dropped_frames: AtomicU64::new(0),
      sender,
      on_empty: Mutex::new(None),
    });
    (
      Hub {
        inner: inner.clone(),
      },
      HubRunner { inner, receiver },
    )
  }

  /// Build a subscriber bound to this hub's queue capacity.
  /// The receiver half goes to the subscriber's write pump.
  pub fn subscriber(&self) -> (Subscriber, mpsc::Receiver<Bytes>) {
    let (sender, receiver) = mpsc::channel(self.inner.capacity);
    (
      Subscriber {
        id: Uuid::new_v4(),
        sender,
        closed: Arc::new(AtomicBool::new(false)),
      },
      receiver,
    )
  }

  /// Returns false if the hub is not running,
  /// in which case the subscriber is dropped.
  pub fn register(&self, subscriber: Subscriber) -> bool {
    if !self.inner.running.load(Ordering::Acquire) {
      return false;
    }
    self
      .inner
      .sender
      .send(Command::Register(subscriber))
      .is_ok()
  }

  /// Idempotent. Unknown ids are ignored.
  pub fn unregister(&self, id: Uuid) {
    let _ = self.inner.sender.send(Command::Unregister(id));
  }

  /// Enqueue a frame to every current subscriber. Never blocks:
  /// subscribers with a full queue have the frame dropped.
  /// With no subscribers the frame is discarded silently.
  pub fn broadcast(&self, frame: Bytes) {
    let _ = self.inner.sender.send(Command::Broadcast(frame));
  }

  /// Install the callback fired when the subscriber count
  /// transitions from >= 1 to 0. Fires at most once until
  /// another subscriber registers.
  pub fn set_on_empty(
    &self,
    callback: impl FnMut() + Send + 'static,
  ) {
    *self.inner.on_empty.lock().unwrap() = Some(Box::new(callback));
  }

  pub fn running(&self) -> bool {
    self.inner.running.load(Ordering::Acquire)
  }

  pub fn subscriber_count(&self) -> usize {
    self.inner.subscriber_count.load(Ordering::Acquire)
  }

  /// Total frames dropped across all subscribers since creation.
  pub fn dropped_frames(&self) -> u64 {
    self.inner.dropped_frames.load(Ordering::Acquire)
  }
}

/// A hub subscriber: bounded outbound queue plus idempotent close.
pub struct Subscriber {
  id: Uuid,
  sender: mpsc::Sender<Bytes>,
  closed: Arc<AtomicBool>,
}

impl Subscriber {
  pub fn id(&self) -> Uuid {
    self.id
  }

  fn close(&self) -> bool {
    !self.closed.swap(true, Ordering::AcqRel)
  }
}

/// The exclusive half of a [Hub]: owns the subscriber set and
/// services the command channel.
pub struct HubRunner {
  inner: Arc<HubInner>,
  receiver: mpsc::UnboundedReceiver<Command>,
}

impl HubRunner {
  /// Mark the hub running and drive the loop on a fresh task.
  /// Marking happens before the spawn so a register racing the
  /// task startup is not rejected.
  pub fn spawn(
    self,
    cancel: CancellationToken,
  ) -> tokio::task::JoinHandle<()> {
    self.inner.running.store(true, Ordering::Release);
    tokio::spawn(self.run(cancel))
  }

  /// Single loop servicing register / unregister / broadcast.
  /// Exits when `cancel` fires or every [Hub] handle is dropped.
  pub async fn run(mut self, cancel: CancellationToken) {
    self.inner.running.store(true, Ordering::Release);
    // Re-armed by each register, disarmed after firing.
    let mut on_empty_armed = false;
    let mut subscribers: HashMap<Uuid, Subscriber> = HashMap::new();

    loop {
      let command = tokio::select! {
        _ = cancel.cancelled() => break,
        command = self.receiver.recv() => match command {
          Some(command) => command,
          None => break,
        },
      };
      match command {
        Command::Register(subscriber) => {
          on_empty_armed = true;
          subscribers.insert(subscriber.id, subscriber);
          self
            .inner
            .subscriber_count
            .store(subscribers.len(), Ordering::Release);
        }
        Command::Unregister(id) => {
          let Some(subscriber) = subscribers.remove(&id) else {
            continue;
          };
          subscriber.close();
          self
            .inner
            .subscriber_count
            .store(subscribers.len(), Ordering::Release);
          maybe_fire_on_empty(
            &self.inner,
            &subscribers,
            &mut on_empty_armed,
          );
        }
        Command::Broadcast(frame) => {
          let mut closed = Vec::new();
          for subscriber in subscribers.values() {
            match subscriber.sender.try_send(frame.clone()) {
              Ok(()) => {}
              Err(mpsc::error::TrySendError::Full(_)) => {
                self
                  .inner
                  .dropped_frames
                  .fetch_add(1, Ordering::AcqRel);
                debug!(
                  subscriber = %subscriber.id,
                  "subscriber queue full, dropping frame"
                );
              }
              Err(mpsc::error::TrySendError::Closed(_)) => {
                closed.push(subscriber.id);
              }
            }
          }
          for id in closed {
            if let Some(subscriber) = subscribers.remove(&id) {
              subscriber.close();
            }
          }
          self
            .inner
            .subscriber_count
            .store(subscribers.len(), Ordering::Release);
          maybe_fire_on_empty(
            &self.inner,
            &subscribers,
            &mut on_empty_armed,
          );
        }
      }
    }

    self.inner.running.store(false, Ordering::Release);
    self.inner.subscriber_count.store(0, Ordering::Release);
  }
}

fn maybe_fire_on_empty(
  inner: &HubInner,
  subscribers: &HashMap<Uuid, Subscriber>,
  armed: &mut bool,
) {
  if !subscribers.is_empty() || !*armed {
    return;
  }
  *armed = false;
  if let Some(callback) = inner.on_empty.lock().unwrap().as_mut() {
    callback();
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
  };

  use super::*;

  fn spawn_hub(capacity: usize) -> (Hub, CancellationToken) {
    let (hub, runner) = Hub::new(capacity);
    let cancel = CancellationToken::new();
    tokio::spawn(runner.run(cancel.clone()));
    (hub, cancel)
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
  }

  #[tokio::test]
  async fn register_fails_when_not_running() {
    let (hub, _runner) = Hub::new(8);
    let (subscriber, _receiver) = hub.subscriber();
    assert!(!hub.register(subscriber));
  }

  #[tokio::test]
  async fn broadcast_fans_out_in_order() {
    let (hub, _cancel) = spawn_hub(8);
    settle().await;

    let (sub_a, mut rx_a) = hub.subscriber();
    let (sub_b, mut rx_b) = hub.subscriber();
    assert!(hub.register(sub_a));
    assert!(hub.register(sub_b));
    settle().await;
    assert_eq!(hub.subscriber_count(), 2);

    for frame in ["A", "B", "C"] {
      hub.broadcast(Bytes::from_static(frame.as_bytes()));
    }

    for rx in [&mut rx_a, &mut rx_b] {
      for expected in ["A", "B", "C"] {
        let frame = tokio::time::timeout(
          Duration::from_millis(500),
          rx.recv(),
        )
        .await
        .expect("timed out waiting for frame")
        .expect("channel closed early");
        assert_eq!(frame, Bytes::from_static(expected.as_bytes()));
      }
    }
  }

  #[tokio::test]
  async fn full_queue_drops_frames_without_blocking() {
    let (hub, _cancel) = spawn_hub(2);
    settle().await;

    let (subscriber, mut receiver) = hub.subscriber();
    assert!(hub.register(subscriber));
    settle().await;

    let start = std::time::Instant::now();
    for i in 0..100u8 {
      hub.broadcast(Bytes::copy_from_slice(&[i]));
    }
    // Producer side returns immediately regardless of the
    // reader never draining.
    assert!(start.elapsed() < Duration::from_millis(150));
    settle().await;

    assert!(hub.dropped_frames() >= 1);
    let mut received = 0;
    while receiver.try_recv().is_ok() {
      received += 1;
    }
    assert!((1..=100).contains(&received));
  }

  #[tokio::test]
  async fn slow_subscriber_receives_strict_subsequence() {
    let (hub, _cancel) = spawn_hub(2);
    settle().await;

    let (subscriber, mut receiver) = hub.subscriber();
    assert!(hub.register(subscriber));
    settle().await;

    let producer = {
      let hub = hub.clone();
      tokio::spawn(async move {
        for i in 0..100u8 {
          hub.broadcast(Bytes::copy_from_slice(&[i]));
          tokio::time::sleep(Duration::from_millis(1)).await;
        }
      })
    };

    let mut frames = Vec::new();
    loop {
      match tokio::time::timeout(
        Duration::from_millis(300),
        receiver.recv(),
      )
      .await
      {
        Ok(Some(frame)) => {
          frames.push(frame[0]);
          tokio::time::sleep(Duration::from_millis(10)).await;
        }
        _ => break,
      }
    }
    producer.await.unwrap();

    assert!(frames.len() >= 2);
    assert!(frames.len() <= 100);
    // Strict subsequence of the produced sequence.
    assert!(frames.windows(2).all(|pair| pair[0] < pair[1]));
  }

  #[tokio::test]
  async fn on_empty_fires_once_per_transition() {
    let (hub, _cancel) = spawn_hub(8);
    settle().await;

    static FIRED: AtomicUsize = AtomicUsize::new(0);
    FIRED.store(0, Ordering::SeqCst);
    hub.set_on_empty(|| {
      FIRED.fetch_add(1, Ordering::SeqCst);
    });

    let (sub_a, _rx_a) = hub.subscriber();
    let id_a = sub_a.id();
    assert!(hub.register(sub_a));
    settle().await;

    hub.unregister(id_a);
    // Double unregister is a no-op.
    hub.unregister(id_a);
    settle().await;
    assert_eq!(FIRED.load(Ordering::SeqCst), 1);

    // A new subscriber re-arms the callback.
    let (sub_b, _rx_b) = hub.subscriber();
    let id_b = sub_b.id();
    assert!(hub.register(sub_b));
    settle().await;
    hub.unregister(id_b);
    settle().await;
    assert_eq!(FIRED.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn cancel_stops_the_runner() {
    let (hub, cancel) = spawn_hub(8);
    settle().await;
    assert!(hub.running());

    cancel.cancel();
    settle().await;
    assert!(!hub.running());

    let (subscriber, _receiver) = hub.subscriber();
    assert!(!hub.register(subscriber));
  }
}
