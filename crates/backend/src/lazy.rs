//! Compute-on-read caches with explicit invalidation
//!
//! Readers hit the cached value under a shared lock; writers invalidate
//! with `clear()`; a miss recomputes under the exclusive lock with a
//! caller-supplied function (double-checked, so racing readers compute
//! once).

use parking_lot::RwLock;

/// An invalidatable lazily computed value
pub struct Lazy<T> {
    slot: RwLock<Option<T>>,
}

impl<T: Clone> Lazy<T> {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// Cached value, or recompute and cache
    pub fn get(&self, compute: impl FnOnce() -> T) -> T {
        if let Some(v) = self.slot.read().as_ref() {
            return v.clone();
        }
        let mut slot = self.slot.write();
        if let Some(v) = slot.as_ref() {
            return v.clone();
        }
        let v = compute();
        *slot = Some(v.clone());
        v
    }

    /// Cached value without recomputation
    pub fn cached(&self) -> Option<T> {
        self.slot.read().clone()
    }

    /// Pin a known-good value
    pub fn assign(&self, v: T) {
        *self.slot.write() = Some(v);
    }

    /// Invalidate; the next `get` recomputes
    pub fn clear(&self) {
        *self.slot.write() = None;
    }
}

impl<T: Clone> Default for Lazy<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_once_until_cleared() {
        let lazy = Lazy::new();
        let mut calls = 0;
        assert_eq!(
            lazy.get(|| {
                calls += 1;
                42
            }),
            42
        );
        assert_eq!(lazy.get(|| unreachable!("cached")), 42);
        assert_eq!(calls, 1);

        lazy.clear();
        assert_eq!(lazy.cached(), None);
        assert_eq!(lazy.get(|| 7), 7);
    }

    #[test]
    fn assign_overrides() {
        let lazy = Lazy::new();
        lazy.assign(1);
        assert_eq!(lazy.get(|| unreachable!("assigned")), 1);
    }
}
