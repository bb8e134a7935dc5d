//! Weak-reference listener lists for the two events the cache emits
//! (spec.md §6): `low_disk_space(free_bytes, limit_bytes)` and
//! `background_exception(error)`. Holding `Weak<dyn Listener>` rather than
//! `Arc<dyn Listener>` means a dead listener never keeps its owner alive
//! and never needs explicit unsubscription; cleared references are pruned
//! whenever a delivery sweeps the list, rather than on a separate GC pass.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

pub trait LowDiskSpaceListener: Send + Sync {
    fn on_low_disk_space(&self, free_bytes: u64, limit_bytes: u64);
}

pub trait BackgroundExceptionListener: Send + Sync {
    fn on_background_exception(&self, message: &str);
}

struct WeakList<T: ?Sized> {
    listeners: Mutex<Vec<Weak<T>>>,
}

impl<T: ?Sized> WeakList<T> {
    fn new() -> Self {
        Self { listeners: Mutex::new(Vec::new()) }
    }

    fn subscribe(&self, listener: &Arc<T>) {
        self.listeners.lock().push(Arc::downgrade(listener));
    }

    /// Upgrade every live listener, pruning dead ones in the same pass.
    fn live_listeners(&self) -> Vec<Arc<T>> {
        let mut listeners = self.listeners.lock();
        let mut live = Vec::with_capacity(listeners.len());
        listeners.retain(|weak| {
            if let Some(strong) = weak.upgrade() {
                live.push(strong);
                true
            } else {
                false
            }
        });
        live
    }

    fn len(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Fan-out point for both cache-level events.
pub struct EventHub {
    low_disk_space: WeakList<dyn LowDiskSpaceListener>,
    background_exception: WeakList<dyn BackgroundExceptionListener>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            low_disk_space: WeakList::new(),
            background_exception: WeakList::new(),
        }
    }

    pub fn subscribe_low_disk_space(&self, listener: &Arc<dyn LowDiskSpaceListener>) {
        self.low_disk_space.subscribe(listener);
    }

    pub fn subscribe_background_exception(&self, listener: &Arc<dyn BackgroundExceptionListener>) {
        self.background_exception.subscribe(listener);
    }

    pub fn emit_low_disk_space(&self, free_bytes: u64, limit_bytes: u64) {
        for listener in self.low_disk_space.live_listeners() {
            listener.on_low_disk_space(free_bytes, limit_bytes);
        }
    }

    /// Background errors are logged unconditionally and then handed to
    /// listeners — a listener panicking or being absent must never stop the
    /// flusher loop (spec.md §7 policy).
    pub fn emit_background_exception(&self, message: &str) {
        warn!(error = message, "background exception");
        for listener in self.background_exception.live_listeners() {
            listener.on_background_exception(message);
        }
    }

    pub fn low_disk_space_listener_count(&self) -> usize {
        self.low_disk_space.len()
    }

    pub fn background_exception_listener_count(&self) -> usize {
        self.background_exception.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingListener(AtomicU32);

    impl LowDiskSpaceListener for CountingListener {
        fn on_low_disk_space(&self, _free_bytes: u64, _limit_bytes: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl BackgroundExceptionListener for CountingListener {
        fn on_background_exception(&self, _message: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn delivers_to_live_listeners() {
        let hub = EventHub::new();
        let listener: Arc<dyn LowDiskSpaceListener> = Arc::new(CountingListener(AtomicU32::new(0)));
        hub.subscribe_low_disk_space(&listener);
        hub.emit_low_disk_space(100, 200);
        assert_eq!(hub.low_disk_space_listener_count(), 1);
    }

    #[test]
    fn prunes_dropped_listeners_on_delivery() {
        let hub = EventHub::new();
        {
            let listener: Arc<dyn BackgroundExceptionListener> =
                Arc::new(CountingListener(AtomicU32::new(0)));
            hub.subscribe_background_exception(&listener);
        }
        assert_eq!(hub.background_exception_listener_count(), 1);
        hub.emit_background_exception("boom");
        assert_eq!(hub.background_exception_listener_count(), 0);
    }
}
