use std::{collections::HashMap, hash::Hash};

use tokio::sync::RwLock;

/// Async keyed cache over cheaply clonable values
/// (usually `Arc<T>`).
#[derive(Debug)]
pub struct CloneCache<K: PartialEq + Eq + Hash, T: Clone>(
  RwLock<HashMap<K, T>>,
);

impl<K: PartialEq + Eq + Hash, T: Clone> Default
  for CloneCache<K, T>
{
  fn default() -> Self {
    Self(RwLock::new(HashMap::new()))
  }
}

impl<K: PartialEq + Eq + Hash + Clone, T: Clone> CloneCache<K, T> {
  pub async fn remove(&self, key: &K) -> Option<T> {
    self.0.write().await.remove(key)
  }

  /// Get the value at `key`, inserting the result of `init`
  /// under a single write lock when absent.
  pub async fn get_or_insert_with(
    &self,
    key: &K,
    init: impl FnOnce() -> T,
  ) -> T {
    let mut lock = self.0.write().await;
    match lock.get(key).cloned() {
      Some(item) => item,
      None => {
        let item = init();
        lock.insert(key.clone(), item.clone());
        item
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn init_runs_only_for_absent_keys() {
    let cache = CloneCache::<&str, u32>::default();
    assert_eq!(cache.get_or_insert_with(&"a", || 1).await, 1);
    // Present key keeps its value, init is not consulted.
    assert_eq!(cache.get_or_insert_with(&"a", || 2).await, 1);
  }

  #[tokio::test]
  async fn removed_keys_are_reinitialized() {
    let cache = CloneCache::<&str, u32>::default();
    cache.get_or_insert_with(&"a", || 1).await;
    assert_eq!(cache.remove(&"a").await, Some(1));
    assert_eq!(cache.remove(&"a").await, None);
    assert_eq!(cache.get_or_insert_with(&"a", || 2).await, 2);
  }
}
