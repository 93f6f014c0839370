//! Listener sets with explicit unsubscribe handles.
//!
//! Components that fan out notifications (protocol adapters, the bridge
//! manager) keep a [`Subscribers`] set instead of publishing on a shared bus.
//! Listeners run in registration order on the emitting task. A listener that
//! panics is logged and skipped; the remaining listeners still receive the
//! value and the emitter keeps running.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

/// A registered callback.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: BTreeMap<u64, Listener<T>>,
}

/// A set of listeners for values of type `T`.
pub struct Subscribers<T> {
    inner: Arc<Mutex<Registry<T>>>,
    label: Arc<str>,
}

impl<T: 'static> Subscribers<T> {
    /// Create an empty set. The label only shows up in logs.
    pub fn new(label: impl Into<String>) -> Self {
        let label: String = label.into();
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: BTreeMap::new(),
            })),
            label: Arc::from(label),
        }
    }

    /// Register a listener. Dropping the returned handle keeps the listener
    /// registered; call [`Unsubscribe::unsubscribe`] to remove it.
    pub fn register<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register_listener(Arc::new(listener))
    }

    /// Register an already shared listener.
    pub fn register_listener(&self, listener: Listener<T>) -> Unsubscribe {
        let id = {
            let mut registry = self.inner.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.insert(id, listener);
            id
        };

        let registry = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.lock().listeners.remove(&id);
            }
        })
    }

    /// Deliver `value` to every listener. Returns how many listeners
    /// completed without panicking.
    pub fn emit(&self, value: &T) -> usize {
        // Snapshot so listeners may (un)subscribe while being called.
        let snapshot: Vec<Listener<T>> = self.inner.lock().listeners.values().cloned().collect();

        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(value))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    error!(
                        subscribers = %self.label,
                        reason = %panic_message(payload.as_ref()),
                        "Listener panicked during fan-out"
                    );
                }
            }
        }
        delivered
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.inner.lock().listeners.clear();
    }
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            label: self.label.clone(),
        }
    }
}

impl<T> fmt::Debug for Subscribers<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("label", &self.label)
            .field("listeners", &self.inner.lock().listeners.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle returned by every `subscribe`-style call.
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Some(Box::new(f)))
    }

    /// A handle that does nothing.
    pub fn noop() -> Self {
        Self(None)
    }

    /// Combine several handles into one.
    pub fn all(handles: Vec<Unsubscribe>) -> Self {
        Self::new(move || {
            for handle in handles {
                handle.unsubscribe();
            }
        })
    }

    /// Remove the listener this handle was created for.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Unsubscribe")
            .field(&self.0.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_all_listeners() {
        let subs = Subscribers::<u32>::new("test");
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let total = total.clone();
            let _ = subs.register(move |v| {
                total.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }

        assert_eq!(subs.emit(&2), 3);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_unsubscribe_removes_listener() {
        let subs = Subscribers::<u32>::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = subs.register(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        subs.emit(&1);
        handle.unsubscribe();
        subs.emit(&1);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(subs.is_empty());
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let subs = Subscribers::<u32>::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let _ = subs.register(|_| panic!("listener failure"));
        let h = hits.clone();
        let _ = subs.register(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(subs.emit(&7), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_after_set_dropped() {
        let subs = Subscribers::<u32>::new("test");
        let handle = subs.register(|_| {});
        drop(subs);
        handle.unsubscribe();
    }

    #[test]
    fn test_combined_handles() {
        let subs = Subscribers::<u32>::new("test");
        let a = subs.register(|_| {});
        let b = subs.register(|_| {});
        assert_eq!(subs.len(), 2);

        Unsubscribe::all(vec![a, b, Unsubscribe::noop()]).unsubscribe();
        assert!(subs.is_empty());
    }
}
