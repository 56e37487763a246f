//! Trailing-edge throttle
//!
//! At most one flush per key per window. The first submit in a quiet period
//! flushes immediately and opens a window; later submits overwrite a single
//! pending slot, flushed when the window closes. A flush at the window edge
//! opens the next window, so the rate bound holds under sustained load.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

/// What a submit did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submitted {
    /// Flushed synchronously
    Immediate,
    /// Parked in the empty pending slot
    Deferred,
    /// Overwrote an already pending item
    Replaced,
}

type Sink<T> = Arc<dyn Fn(&str, T) + Send + Sync>;

struct ThrottleInner<T> {
    pending: Mutex<HashMap<String, Option<T>>>,
    sink: Sink<T>,
}

/// Keyed trailing-edge coalescer
pub struct Throttle<T> {
    inner: Arc<ThrottleInner<T>>,
}

impl<T: Send + 'static> Throttle<T> {
    /// `sink` receives every flushed item; it runs without internal locks held
    pub fn new(sink: impl Fn(&str, T) + Send + Sync + 'static) -> Self {
        Throttle {
            inner: Arc::new(ThrottleInner {
                pending: Mutex::new(HashMap::new()),
                sink: Arc::new(sink),
            }),
        }
    }

    pub fn submit(&self, key: &str, window: Duration, item: T) -> Submitted {
        if window.is_zero() {
            (self.inner.sink)(key, item);
            return Submitted::Immediate;
        }

        {
            let mut pending = self.inner.pending.lock();
            if let Some(slot) = pending.get_mut(key) {
                return match slot.replace(item) {
                    Some(_) => Submitted::Replaced,
                    None => Submitted::Deferred,
                };
            }

            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    pending.insert(key.to_string(), None);
                    handle.spawn(run_window(
                        Arc::downgrade(&self.inner),
                        key.to_string(),
                        window,
                    ));
                }
                Err(_) => {
                    tracing::debug!(key, "no async runtime, throttle bypassed");
                }
            }
        }

        (self.inner.sink)(key, item);
        Submitted::Immediate
    }

    /// Flush every pending item now, closing all windows
    pub fn flush_all(&self) {
        let drained: Vec<(String, T)> = {
            let mut pending = self.inner.pending.lock();
            pending
                .drain()
                .filter_map(|(key, item)| item.map(|item| (key, item)))
                .collect()
        };
        for (key, item) in drained {
            (self.inner.sink)(&key, item);
        }
    }

    /// Keys with an open window
    pub fn active_windows(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Items waiting for their window to close
    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .values()
            .filter(|slot| slot.is_some())
            .count()
    }
}

async fn run_window<T>(inner: Weak<ThrottleInner<T>>, key: String, window: Duration) {
    loop {
        tokio::time::sleep(window).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let item = {
            let mut pending = inner.pending.lock();
            let item = pending.get_mut(&key).and_then(Option::take);
            if item.is_none() {
                pending.remove(&key);
            }
            item
        };
        match item {
            Some(item) => (inner.sink)(&key, item),
            None => return,
        }
    }
}

impl<T> std::fmt::Debug for Throttle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("active_windows", &self.inner.pending.lock().len())
            .finish()
    }
}
