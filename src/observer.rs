// src/observer.rs

//! Typed observer registry.
//!
//! An [`Observable`] owns a list of `(EventSpec, handler)` pairs. `notify`
//! snapshots the matching handlers before invoking any of them, so a handler
//! that attaches or clears subscriptions mid-dispatch affects only later
//! notifications.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Which events a subscriber wants to see.
pub enum EventSpec<E> {
    /// Every event.
    All,
    /// A single event, compared by equality.
    Only(E),
    /// Any of the listed events.
    AnyOf(Vec<E>),
    /// Events accepted by a predicate (e.g. one enum variant regardless of
    /// payload).
    Matching(fn(&E) -> bool),
}

impl<E: PartialEq> EventSpec<E> {
    pub fn matches(&self, event: &E) -> bool {
        match self {
            EventSpec::All => true,
            EventSpec::Only(expected) => expected == event,
            EventSpec::AnyOf(events) => events.contains(event),
            EventSpec::Matching(pred) => pred(event),
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for EventSpec<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSpec::All => f.write_str("All"),
            EventSpec::Only(e) => f.debug_tuple("Only").field(e).finish(),
            EventSpec::AnyOf(es) => f.debug_tuple("AnyOf").field(es).finish(),
            EventSpec::Matching(_) => f.write_str("Matching(..)"),
        }
    }
}

pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscription<E> {
    spec: EventSpec<E>,
    handler: Handler<E>,
}

/// A cheaply clonable handle to a shared subscriber list.
pub struct Observable<E> {
    subscriptions: Arc<Mutex<Vec<Subscription<E>>>>,
}

impl<E> Clone for Observable<E> {
    fn clone(&self) -> Self {
        Self {
            subscriptions: Arc::clone(&self.subscriptions),
        }
    }
}

impl<E> Default for Observable<E> {
    fn default() -> Self {
        Self {
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E> fmt::Debug for Observable<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<E> Observable<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscription<E>>> {
        // A panicking handler never runs under the lock, so a poisoned list
        // is still consistent.
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn attach<F>(&self, spec: EventSpec<E>, handler: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.lock().push(Subscription {
            spec,
            handler: Arc::new(handler),
        });
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: PartialEq> Observable<E> {
    /// Dispatch `event` to every matching subscriber. Returns how many
    /// handlers were invoked.
    pub fn notify(&self, event: &E) -> usize {
        let snapshot: Vec<Handler<E>> = self
            .lock()
            .iter()
            .filter(|sub| sub.spec.matches(event))
            .map(|sub| Arc::clone(&sub.handler))
            .collect();

        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum Ping {
        A,
        B(u32),
    }

    #[test]
    fn specs_filter_events() {
        let obs = Observable::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        obs.attach(EventSpec::Only(Ping::A), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let h = Arc::clone(&hits);
        obs.attach(EventSpec::Matching(|e| matches!(e, Ping::B(_))), move |_| {
            h.fetch_add(10, Ordering::SeqCst);
        });

        assert_eq!(obs.notify(&Ping::A), 1);
        assert_eq!(obs.notify(&Ping::B(7)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn subscriptions_added_during_dispatch_wait_for_next_event() {
        let obs: Observable<Ping> = Observable::new();
        let late_hits = Arc::new(AtomicUsize::new(0));

        let inner = obs.clone();
        let late = Arc::clone(&late_hits);
        obs.attach(EventSpec::All, move |_| {
            let late = Arc::clone(&late);
            inner.attach(EventSpec::All, move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(obs.notify(&Ping::A), 1);
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);

        // Second dispatch sees the original handler and the one it added.
        assert_eq!(obs.notify(&Ping::A), 2);
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clearing_during_dispatch_does_not_skip_siblings() {
        let obs: Observable<Ping> = Observable::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let inner = obs.clone();
        obs.attach(EventSpec::All, move |_| inner.clear());
        let h = Arc::clone(&hits);
        obs.attach(EventSpec::All, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(obs.notify(&Ping::A), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(obs.is_empty());
    }
}
