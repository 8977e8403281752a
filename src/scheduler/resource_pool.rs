//! Named resource pools
//!
//! Each pool is a counting semaphore registered once at startup. Acquisition
//! is strictly non-blocking: the scheduler skips a task whose requirements do
//! not fit and retries on a later tick.

use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Live availability counters over a fixed capacity map.
pub struct ResourcePool {
    capacity: BTreeMap<String, u32>,
    available: Mutex<BTreeMap<String, u32>>,
}

impl ResourcePool {
    pub fn new(capacity: BTreeMap<String, u32>) -> Self {
        Self {
            available: Mutex::new(capacity.clone()),
            capacity,
        }
    }

    pub fn capacity(&self) -> &BTreeMap<String, u32> {
        &self.capacity
    }

    pub fn available(&self) -> BTreeMap<String, u32> {
        self.available.lock().expect("resource pool poisoned").clone()
    }

    /// Takes every requirement or nothing. Resources the pools do not define
    /// are unconstrained and ignored.
    pub fn try_acquire(&self, requirements: &BTreeMap<String, u32>) -> bool {
        if requirements.is_empty() {
            return true;
        }
        let mut available = self.available.lock().expect("resource pool poisoned");

        let fits = requirements.iter().all(|(name, need)| {
            match available.get(name) {
                Some(have) => have >= need,
                None => !self.capacity.contains_key(name),
            }
        });
        if !fits {
            return false;
        }

        for (name, need) in requirements {
            if let Some(have) = available.get_mut(name) {
                *have -= need;
            }
        }
        debug!("Acquired resources: {:?}", requirements);
        true
    }

    /// Returns previously acquired units, clamped to capacity.
    pub fn release(&self, requirements: &BTreeMap<String, u32>) {
        if requirements.is_empty() {
            return;
        }
        let mut available = self.available.lock().expect("resource pool poisoned");
        for (name, need) in requirements {
            if let Some(cap) = self.capacity.get(name) {
                let have = available.entry(name.clone()).or_insert(0);
                let restored = (*have + need).min(*cap);
                if *have + need > *cap {
                    warn!("Resource {} over-released, clamping to capacity", name);
                }
                *have = restored;
            }
        }
        debug!("Released resources: {:?}", requirements);
    }

    /// True when every counter sits at its configured capacity.
    pub fn is_balanced(&self) -> bool {
        let available = self.available.lock().expect("resource pool poisoned");
        self.capacity
            .iter()
            .all(|(name, cap)| available.get(name) == Some(cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reqs(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_acquire_all_or_nothing() {
        let pool = ResourcePool::new(reqs(&[("cpu", 4), ("memory", 8)]));

        assert!(pool.try_acquire(&reqs(&[("cpu", 2), ("memory", 4)])));
        // cpu would fit, memory would not; nothing must be taken.
        assert!(!pool.try_acquire(&reqs(&[("cpu", 2), ("memory", 6)])));
        assert_eq!(pool.available()["cpu"], 2);
        assert_eq!(pool.available()["memory"], 4);

        pool.release(&reqs(&[("cpu", 2), ("memory", 4)]));
        assert!(pool.is_balanced());
    }

    #[test]
    fn test_unknown_resources_are_unconstrained() {
        let pool = ResourcePool::new(reqs(&[("cpu", 1)]));
        assert!(pool.try_acquire(&reqs(&[("gpu", 64)])));
        pool.release(&reqs(&[("gpu", 64)]));
        assert!(pool.is_balanced());
    }

    #[test]
    fn test_release_clamps_to_capacity() {
        let pool = ResourcePool::new(reqs(&[("cpu", 2)]));
        pool.release(&reqs(&[("cpu", 5)]));
        assert_eq!(pool.available()["cpu"], 2);
    }
}
