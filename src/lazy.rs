//! Materialise-once slots for derived wrappers
//!
//! A slot stays empty while the native link it mirrors is null, so a link
//! that appears later is still picked up; once a wrapper is built every later
//! access returns that same instance.

use crate::error::BridgeResult;
use parking_lot::Mutex;

pub(crate) struct LazySlot<T> {
    slot: Mutex<Option<T>>,
}

impl<T: Clone> LazySlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Cached value, or the result of `materialize` (cached when present)
    pub(crate) fn get_or_try_init<F>(&self, materialize: F) -> BridgeResult<Option<T>>
    where
        F: FnOnce() -> BridgeResult<Option<T>>,
    {
        let mut slot = self.slot.lock();
        if let Some(cached) = slot.as_ref() {
            return Ok(Some(cached.clone()));
        }
        let made = materialize()?;
        if let Some(value) = &made {
            *slot = Some(value.clone());
        }
        Ok(made)
    }

    pub(crate) fn is_cached(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Drop the cached value, returning it
    pub(crate) fn clear(&self) -> Option<T> {
        self.slot.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_materializes_once() {
        let slot: LazySlot<Arc<u32>> = LazySlot::new();
        let first = slot.get_or_try_init(|| Ok(Some(Arc::new(1)))).unwrap().unwrap();
        let second = slot
            .get_or_try_init(|| panic!("must not materialize twice"))
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_absent_is_not_cached() {
        let slot: LazySlot<u32> = LazySlot::new();
        assert_eq!(slot.get_or_try_init(|| Ok(None)).unwrap(), None);
        assert!(!slot.is_cached());
        assert_eq!(slot.get_or_try_init(|| Ok(Some(5))).unwrap(), Some(5));
        assert_eq!(slot.clear(), Some(5));
    }
}
