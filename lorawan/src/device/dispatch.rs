//! Application downlink delivery
//!
//! One handler slot. The handler runs synchronously inside
//! [`Device::transmit_message`](crate::device::Device::transmit_message),
//! so its execution time extends the blocking time of that call. The
//! payload slice is only valid for the duration of the call.

use parking_lot::Mutex;

/// Application callback: payload and port
pub type MessageHandler = Box<dyn FnMut(&[u8], u8) + Send>;

#[derive(Default)]
struct Slot {
    handler: Option<MessageHandler>,
    /// Bumped on every registration so a handler replaced mid-dispatch is not restored
    generation: u64,
}

/// Holds at most one registered handler
#[derive(Default)]
pub struct ReceptionDispatcher {
    slot: Mutex<Slot>,
}

impl ReceptionDispatcher {
    /// Dispatcher with no handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`, replacing any previous one
    pub fn register(&self, handler: MessageHandler) {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        slot.handler = Some(handler);
    }

    /// Whether a handler is registered
    pub fn has_handler(&self) -> bool {
        self.slot.lock().handler.is_some()
    }

    /// Hand a downlink to the handler; returns whether one ran
    ///
    /// The slot is not locked while the handler runs, so it may register a
    /// replacement for itself.
    pub fn dispatch(&self, payload: &[u8], port: u8) -> bool {
        let (mut handler, taken_at) = {
            let mut slot = self.slot.lock();
            match slot.handler.take() {
                Some(handler) => (handler, slot.generation),
                None => {
                    tracing::debug!(port, len = payload.len(), "downlink without handler");
                    return false;
                }
            }
        };

        handler(payload, port);

        let mut slot = self.slot.lock();
        if slot.generation == taken_at {
            slot.handler = Some(handler);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn only_latest_handler_fires() {
        let dispatcher = ReceptionDispatcher::new();
        let hits = Arc::new(Mutex::new(std::vec::Vec::new()));

        let first = Arc::clone(&hits);
        dispatcher.register(Box::new(move |_, _| first.lock().push("first")));
        let second = Arc::clone(&hits);
        dispatcher.register(Box::new(move |payload, port| {
            assert_eq!((payload, port), (&b"abc"[..], 7));
            second.lock().push("second");
        }));

        assert!(dispatcher.dispatch(b"abc", 7));
        assert_eq!(*hits.lock(), ["second"]);
    }

    #[test]
    fn no_handler_is_not_an_error() {
        assert!(!ReceptionDispatcher::new().dispatch(b"x", 1));
    }

    #[test]
    fn handler_survives_dispatch() {
        let dispatcher = ReceptionDispatcher::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        dispatcher.register(Box::new(move |_, _| *c.lock() += 1));
        dispatcher.dispatch(b"a", 1);
        dispatcher.dispatch(b"b", 1);
        assert_eq!(*count.lock(), 2);
        assert!(dispatcher.has_handler());
    }
}
