//! Per-queue associated storage
//!
//! Values are stored type-erased behind a typed [`SpecificKey`]. A cleanup
//! closure, if given, runs exactly once: when the value is replaced, cleared
//! or the owning queue is destroyed. Cleanups never run under the queue's
//! storage lock.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;
type Cleanup = Box<dyn FnOnce(AnyValue) + Send>;

/// Typed key for [`Queue::set_specific`](crate::Queue::set_specific)
///
/// Every call to [`SpecificKey::new`] yields a distinct key.
pub struct SpecificKey<T> {
    id: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> SpecificKey<T> {
    pub fn new() -> Self {
        static NEXT_KEY: AtomicUsize = AtomicUsize::new(1);
        Self {
            id: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Default for SpecificKey<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SpecificKey<T> {
    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.id
    }
}

impl<T> Clone for SpecificKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SpecificKey<T> {}

impl<T> fmt::Debug for SpecificKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpecificKey({})", self.id)
    }
}

/// A stored value and its optional cleanup
pub(crate) struct Slot {
    value: AnyValue,
    cleanup: Option<Cleanup>,
}

impl Slot {
    pub fn new<T, F>(value: T, cleanup: Option<F>) -> Self
    where
        T: Send + Sync + 'static,
        F: FnOnce(Arc<T>) + Send + 'static,
    {
        let cleanup = cleanup.map(|f| {
            Box::new(move |any: AnyValue| {
                if let Ok(value) = any.downcast::<T>() {
                    f(value)
                }
            }) as Cleanup
        });
        Self {
            value: Arc::new(value),
            cleanup,
        }
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }

    /// Consume the slot, running its cleanup
    pub fn finish(self) {
        if let Some(cleanup) = self.cleanup {
            cleanup(self.value);
        }
    }
}

#[derive(Default)]
pub(crate) struct SpecificMap {
    slots: HashMap<usize, Slot>,
}

impl SpecificMap {
    /// Returns the displaced slot, to be finished outside the lock
    pub fn insert(&mut self, key: usize, slot: Slot) -> Option<Slot> {
        self.slots.insert(key, slot)
    }

    pub fn remove(&mut self, key: usize) -> Option<Slot> {
        self.slots.remove(&key)
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: usize) -> Option<Arc<T>> {
        self.slots.get(&key).and_then(|slot| slot.get::<T>())
    }

    pub fn drain(&mut self) -> Vec<Slot> {
        self.slots.drain().map(|(_, slot)| slot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_keys_are_distinct() {
        let a: SpecificKey<u32> = SpecificKey::new();
        let b: SpecificKey<u32> = SpecificKey::new();
        assert_ne!(a.id(), b.id());
        let c = a;
        assert_eq!(a.id(), c.id());
    }

    #[test]
    fn test_slot_cleanup_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let mut map = SpecificMap::default();
        let old = map.insert(1, Slot::new(7u32, Some(move |v: Arc<u32>| s.lock().unwrap().push(*v))));
        assert!(old.is_none());
        assert_eq!(map.get::<u32>(1).as_deref(), Some(&7));
        assert!(map.get::<String>(1).is_none());

        let displaced = map.insert(1, Slot::new(8u32, None::<fn(Arc<u32>)>));
        displaced.unwrap().finish();
        assert_eq!(*seen.lock().unwrap(), vec![7]);

        for slot in map.drain() {
            slot.finish();
        }
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }
}
