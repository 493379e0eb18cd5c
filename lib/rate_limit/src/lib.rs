use std::{
  net::IpAddr,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use anyhow::anyhow;
use axum::http::{HeaderMap, StatusCode};
use dashmap::DashMap;
use serror::{AddStatusCode, AddStatusCodeError};

/// Caps the number of simultaneously live subscriptions per
/// client IP. The counter for an IP always equals its live
/// permits, and the entry is removed when the count drops to
/// zero to bound the map.
pub struct ConnectionLimiter {
  connections: DashMap<IpAddr, AtomicUsize>,
  max_per_ip: usize,
}

impl ConnectionLimiter {
  pub fn new(max_per_ip: usize) -> Arc<ConnectionLimiter> {
    Arc::new(ConnectionLimiter {
      connections: DashMap::new(),
      max_per_ip,
    })
  }

  /// Admit one more subscription for `ip`, or return
  /// `429 Too Many Requests` when the IP is already at the cap.
  /// The permit releases the slot on drop.
  pub fn acquire(
    self: &Arc<Self>,
    ip: IpAddr,
  ) -> serror::Result<ConnectionPermit> {
    let count = {
      let entry = self
        .connections
        .entry(ip)
        .or_insert_with(|| AtomicUsize::new(0));
      entry.fetch_add(1, Ordering::AcqRel) + 1
    };
    if count > self.max_per_ip {
      self.release(&ip);
      return Err(
        anyhow!(
          "Too many concurrent connections from {ip} (max {})",
          self.max_per_ip
        )
        .status_code(StatusCode::TOO_MANY_REQUESTS),
      );
    }
    Ok(ConnectionPermit {
      limiter: self.clone(),
      ip,
    })
  }

  fn release(&self, ip: &IpAddr) {
    if let Some(entry) = self.connections.get(ip) {
      entry.fetch_sub(1, Ordering::AcqRel);
    }
    self
      .connections
      .remove_if(ip, |_, count| count.load(Ordering::Acquire) == 0);
  }

  /// Live subscriptions for `ip`.
  pub fn active(&self, ip: &IpAddr) -> usize {
    self
      .connections
      .get(ip)
      .map(|entry| entry.load(Ordering::Acquire))
      .unwrap_or(0)
  }

  /// Number of IPs currently tracked.
  pub fn tracked_ips(&self) -> usize {
    self.connections.len()
  }
}

/// RAII admission slot. Dropping it decrements the IP's counter
/// and clears the map entry at zero.
pub struct ConnectionPermit {
  limiter: Arc<ConnectionLimiter>,
  ip: IpAddr,
}

impl Drop for ConnectionPermit {
  fn drop(&mut self) {
    self.limiter.release(&self.ip);
  }
}

/// Client IP as reported by the reverse proxy headers.
pub fn get_ip_from_headers(
  headers: &HeaderMap,
) -> serror::Result<IpAddr> {
  // Check X-Forwarded-For header (first IP in chain)
  if let Some(forwarded) = headers.get("x-forwarded-for")
    && let Ok(forwarded_str) = forwarded.to_str()
    && let Some(ip) = forwarded_str.split(',').next()
  {
    return ip
      .trim()
      .parse()
      .status_code(StatusCode::BAD_REQUEST);
  }

  // Check X-Real-IP header
  if let Some(real_ip) = headers.get("x-real-ip")
    && let Ok(ip) = real_ip.to_str()
  {
    return ip.trim().parse().status_code(StatusCode::BAD_REQUEST);
  }

  Err(
    anyhow!("'x-forwarded-for' and 'x-real-ip' are both missing")
      .status_code(StatusCode::BAD_REQUEST),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ip(last: u8) -> IpAddr {
    IpAddr::from([127, 0, 0, last])
  }

  #[test]
  fn admits_up_to_the_cap() {
    let limiter = ConnectionLimiter::new(5);
    let mut permits = (0..5)
      .map(|_| limiter.acquire(ip(1)).unwrap())
      .collect::<Vec<_>>();
    assert_eq!(limiter.active(&ip(1)), 5);

    // The sixth connection from the same ip is rejected.
    assert!(limiter.acquire(ip(1)).is_err());
    assert_eq!(limiter.active(&ip(1)), 5);

    // Closing any one permits a new connection.
    drop(permits.pop());
    assert_eq!(limiter.active(&ip(1)), 4);
    let _readmitted = limiter.acquire(ip(1)).unwrap();
    assert_eq!(limiter.active(&ip(1)), 5);
  }

  #[test]
  fn released_slot_can_be_reacquired() {
    let limiter = ConnectionLimiter::new(1);
    let permit = limiter.acquire(ip(2)).unwrap();
    assert!(limiter.acquire(ip(2)).is_err());
    drop(permit);
    let _permit = limiter.acquire(ip(2)).unwrap();
  }

  #[test]
  fn other_ips_are_unaffected() {
    let limiter = ConnectionLimiter::new(1);
    let _a = limiter.acquire(ip(3)).unwrap();
    let _b = limiter.acquire(ip(4)).unwrap();
    assert!(limiter.acquire(ip(3)).is_err());
  }

  #[test]
  fn entry_is_removed_at_zero() {
    let limiter = ConnectionLimiter::new(5);
    let first = limiter.acquire(ip(5)).unwrap();
    let second = limiter.acquire(ip(5)).unwrap();
    assert_eq!(limiter.tracked_ips(), 1);
    drop(first);
    assert_eq!(limiter.tracked_ips(), 1);
    drop(second);
    assert_eq!(limiter.tracked_ips(), 0);
  }

  #[test]
  fn rejected_acquire_leaves_no_stale_entry() {
    let limiter = ConnectionLimiter::new(0);
    assert!(limiter.acquire(ip(6)).is_err());
    assert_eq!(limiter.tracked_ips(), 0);
  }

  #[test]
  fn ip_extraction_prefers_forwarded_for() {
    let mut headers = HeaderMap::new();
    headers.insert(
      "x-forwarded-for",
      "10.0.0.1, 172.16.0.1".parse().unwrap(),
    );
    headers.insert("x-real-ip", "10.0.0.9".parse().unwrap());
    assert_eq!(
      get_ip_from_headers(&headers).unwrap(),
      ip_addr("10.0.0.1")
    );
  }

  #[test]
  fn ip_extraction_falls_back_to_real_ip() {
    let mut headers = HeaderMap::new();
    headers.insert("x-real-ip", "10.0.0.9".parse().unwrap());
    assert_eq!(
      get_ip_from_headers(&headers).unwrap(),
      ip_addr("10.0.0.9")
    );
  }

  #[test]
  fn missing_headers_error() {
    assert!(get_ip_from_headers(&HeaderMap::new()).is_err());
  }

  fn ip_addr(s: &str) -> IpAddr {
    s.parse().unwrap()
  }
}
