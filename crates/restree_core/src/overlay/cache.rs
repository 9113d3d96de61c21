//! Bounded path → handle cache.

use super::handle::NodeHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Keeps one [`NodeHandle`] per path.
///
/// Once the cache grows past its capacity, entries that nothing outside the
/// cache holds are dropped. A child handle holds its parent, so a parent is
/// never evicted while a child handle is alive.
#[derive(Debug)]
pub struct NodeCache {
    entries: Mutex<HashMap<String, Arc<NodeHandle>>>,
    capacity: usize,
}

impl NodeCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Cached handle for `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Arc<NodeHandle>> {
        self.entries.lock().get(path).cloned()
    }

    /// Returns the cached handle for `path`, or caches the one `make`
    /// builds.
    pub fn get_or_insert_with(
        &self,
        path: &str,
        make: impl FnOnce() -> NodeHandle,
    ) -> Arc<NodeHandle> {
        let mut entries = self.entries.lock();
        if let Some(handle) = entries.get(path) {
            return Arc::clone(handle);
        }
        if entries.len() >= self.capacity {
            Self::evict(&mut entries);
        }
        let handle = Arc::new(make());
        entries.insert(path.to_string(), Arc::clone(&handle));
        handle
    }

    fn evict(entries: &mut HashMap<String, Arc<NodeHandle>>) {
        let before = entries.len();
        loop {
            let len = entries.len();
            entries.retain(|_, h| Arc::strong_count(h) > 1);
            if entries.len() == len {
                break;
            }
        }
        if entries.len() < before {
            tracing::debug!(
                evicted = before - entries.len(),
                remaining = entries.len(),
                "evicted unreferenced node handles"
            );
        }
    }

    /// Every cached handle.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<NodeHandle>> {
        self.entries.lock().values().cloned().collect()
    }

    /// Number of cached handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::handle::Binding;

    fn make(path: &str, parent: Option<Arc<NodeHandle>>) -> NodeHandle {
        NodeHandle::new(
            path.to_string(),
            path.rsplit('/').next().unwrap_or(path),
            parent,
            "Resource",
            false,
            Binding::fresh_virtual(),
        )
    }

    #[test]
    fn same_path_same_handle() {
        let cache = NodeCache::new(16);
        let a = cache.get_or_insert_with("a", || make("a", None));
        let b = cache.get_or_insert_with("a", || make("a", None));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn eviction_spares_held_handles() {
        let cache = NodeCache::new(2);
        let held = cache.get_or_insert_with("held", || make("held", None));
        let child = cache.get_or_insert_with("held/c", || make("held/c", Some(Arc::clone(&held))));
        drop(cache.get_or_insert_with("loose", || make("loose", None)));
        assert_eq!(cache.len(), 3);

        let _next = cache.get_or_insert_with("next", || make("next", None));
        assert!(cache.get("loose").is_none());
        assert_eq!(cache.len(), 3);
        assert!(Arc::ptr_eq(&cache.get("held").unwrap(), &held));
        assert!(Arc::ptr_eq(&cache.get("held/c").unwrap(), &child));
    }

    #[test]
    fn parent_survives_while_child_is_held() {
        let cache = NodeCache::new(1);
        let child = {
            let parent = cache.get_or_insert_with("p", || make("p", None));
            cache.get_or_insert_with("p/c", || make("p/c", Some(parent)))
        };
        drop(cache.get_or_insert_with("x", || make("x", None)));
        assert!(cache.get("p").is_some());
        assert!(Arc::ptr_eq(cache.get("p/c").as_ref().unwrap(), &child));
    }
}
