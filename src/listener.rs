//! Listener sets with explicit registration handles.
//!
//! Registration returns an opaque [`ListenerHandle`]; removal takes that handle back.
//! The set is replaced wholesale on every mutation (`ArcSwap`), so dispatch iterates a
//! stable snapshot and never blocks concurrent add/remove.

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque token identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Copy-on-write listener set.
pub struct ListenerContainer<L: ?Sized> {
    entries: ArcSwap<Vec<(ListenerHandle, Arc<L>)>>,
    next_id: AtomicU64,
}

impl<L: ?Sized> Default for ListenerContainer<L> {
    fn default() -> Self {
        Self { entries: ArcSwap::from_pointee(Vec::new()), next_id: AtomicU64::new(1) }
    }
}

impl<L: ?Sized> fmt::Debug for ListenerContainer<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerContainer").field("len", &self.len()).finish()
    }
}

impl<L: ?Sized> ListenerContainer<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`; listeners are visited in registration order.
    pub fn add(&self, listener: Arc<L>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push((handle, listener.clone()));
            next
        });
        handle
    }

    /// Remove a registration; returns `false` if the handle was unknown.
    pub fn remove(&self, handle: ListenerHandle) -> bool {
        let mut removed = false;
        self.entries.rcu(|current| {
            removed = current.iter().any(|(h, _)| *h == handle);
            current.iter().filter(|(h, _)| *h != handle).cloned().collect::<Vec<_>>()
        });
        removed
    }

    pub fn clear(&self) {
        self.entries.store(Arc::new(Vec::new()));
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Visit every listener registered at the time of the call.
    pub fn for_each(&self, mut f: impl FnMut(&L)) {
        let entries = self.entries.load_full();
        for (_, listener) in entries.iter() {
            f(listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct Fixed(&'static str);

    impl Named for Fixed {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn visits_in_registration_order() {
        let container: ListenerContainer<dyn Named> = ListenerContainer::new();
        container.add(Arc::new(Fixed("a")));
        container.add(Arc::new(Fixed("b")));
        container.add(Arc::new(Fixed("c")));

        let seen = Mutex::new(Vec::new());
        container.for_each(|l| seen.lock().unwrap().push(l.name().to_string()));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn remove_by_handle_not_identity() {
        let container: ListenerContainer<dyn Named> = ListenerContainer::new();
        let shared: Arc<dyn Named> = Arc::new(Fixed("same"));
        let first = container.add(shared.clone());
        let second = container.add(shared);
        assert_ne!(first, second);

        assert!(container.remove(first));
        assert!(!container.remove(first));
        assert_eq!(container.len(), 1);
        assert!(container.remove(second));
        assert!(container.is_empty());
    }

    #[test]
    fn mutation_during_iteration_is_not_visited() {
        let container: Arc<ListenerContainer<dyn Named>> = Arc::new(ListenerContainer::new());
        container.add(Arc::new(Fixed("a")));
        let mut visited = 0;
        container.for_each(|_| {
            container.add(Arc::new(Fixed("late")));
            visited += 1;
        });
        assert_eq!(visited, 1);
        assert_eq!(container.len(), 2);
    }
}
