//! Typed observer interface shared by the lifecycle manager, the clients and
//! the pipelined connection.
//!
//! Listeners are invoked synchronously, in registration order, with no
//! internal locks held. A listener is therefore free to call back into the
//! component that is emitting (for example calling `reconnect()` from a
//! `Disconnected` handler); emitting code must re-check any state it depends
//! on after an emission.

use std::sync::{Arc, Mutex};

/// A registered event callback.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Lifecycle notifications exposed by the connection manager and both
/// clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A connection completed setup and is usable. Emitted on every
    /// successful connect, first or otherwise.
    Connected,
    /// Emitted after `Connected` when the preceding connect recovered from at
    /// least one failure.
    Reconnected,
    /// An established session was lost.
    Disconnected,
    /// A reconnect attempt failed; carries the failure count so far (1,2,...).
    ReconnectFailed(u32),
    /// The attempt budget is exhausted; the client stays down until
    /// `reconnect()` is called.
    Failed,
}

pub struct EventEmitter<E> {
    listeners: Mutex<Vec<Listener<E>>>,
}

impl<E> EventEmitter<E> {
    pub fn new() -> EventEmitter<E> {
        EventEmitter {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn on(&self, listener: Listener<E>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Dispatches `event` to every listener in registration order. The
    /// listener list is snapshotted first so handlers can register further
    /// listeners without deadlocking.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self.listeners.lock().unwrap().clone();
        for listener in snapshot {
            listener(event);
        }
    }
}

impl<E> Default for EventEmitter<E> {
    fn default() -> EventEmitter<E> {
        EventEmitter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_registration_order() {
        let emitter: EventEmitter<&str> = EventEmitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            emitter.on(Arc::new(move |event: &&str| {
                seen.lock().unwrap().push(format!("{}:{}", tag, event));
            }));
        }

        emitter.emit(&"ping");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:ping", "second:ping", "third:ping"]
        );
    }

    #[test]
    fn listener_may_register_listeners() {
        let emitter: Arc<EventEmitter<u32>> = Arc::new(EventEmitter::new());
        let hits = Arc::new(Mutex::new(0u32));

        let inner_hits = hits.clone();
        let nested = emitter.clone();
        emitter.on(Arc::new(move |_| {
            let inner_hits = inner_hits.clone();
            nested.on(Arc::new(move |_| {
                *inner_hits.lock().unwrap() += 1;
            }));
        }));

        emitter.emit(&1);
        // The listener added during the first emission only sees later events.
        assert_eq!(*hits.lock().unwrap(), 0);
        emitter.emit(&2);
        assert_eq!(*hits.lock().unwrap(), 1);
    }
}
