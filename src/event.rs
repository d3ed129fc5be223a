//! Multi-subscriber events
//!
//! An `Event<T>` fans a value out to every registered listener and every
//! channel subscriber. Emitting never fails: a panicking listener is logged
//! and skipped, closed channels are dropped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

/// Handle returned by [`Event::on`], used to remove the listener again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Event<T> {
    name: &'static str,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
    channels: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone + Send + 'static> Event<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Register a synchronous listener.
    pub fn on(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Subscribe with an unbounded channel. Every value emitted after this
    /// call is delivered, in order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn emit(&self, value: &T) {
        // Listeners run outside the lock so they may (un)register.
        let listeners: Vec<Listener<T>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                log::error!("Listener for event '{}' panicked", self.name);
            }
        }

        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(value.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listeners_receive_values() {
        let event = Event::<u32>::new("test");
        let total = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&total);
        event.on(move |v| {
            t.fetch_add(*v as usize, Ordering::SeqCst);
        });
        event.emit(&3);
        event.emit(&4);
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let event = Event::<u32>::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        event.on(|_| panic!("boom"));
        let h = Arc::clone(&hits);
        event.on(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        event.emit(&1);
        event.emit(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_off_removes_listener() {
        let event = Event::<u32>::new("test");
        let id = event.on(|_| {});
        assert_eq!(event.listener_count(), 1);
        assert!(event.off(id));
        assert!(!event.off(id));
        assert_eq!(event.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_subscribers_get_every_value() {
        let event = Event::<u32>::new("test");
        let mut rx = event.subscribe();
        for i in 0..5 {
            event.emit(&i);
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await, Some(i));
        }
        drop(rx);
        // Closed subscribers are pruned on the next emit.
        event.emit(&9);
    }
}
