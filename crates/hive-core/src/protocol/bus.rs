//! Typed event bus for decoded protocol frames.
//!
//! Handlers are registered per message type and run in registration order.
//! Each handler is isolated: an error or a panic is logged and the remaining
//! handlers (and the reader feeding the bus) keep going.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use super::types::Envelope;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type MessageHandler = Arc<dyn Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync>;
type RawHandler = Arc<dyn Fn(&str) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    by_type: HashMap<String, Vec<MessageHandler>>,
    raw: Vec<RawHandler>,
}

/// Registry of message and raw-output handlers.
///
/// Cheap to clone; clones share the same handler table.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Handlers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one message type.
    pub fn on<F>(&self, msg_type: &str, handler: F)
    where
        F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .by_type
            .entry(msg_type.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler for lines that are not protocol frames.
    pub fn on_raw<F>(&self, handler: F)
    where
        F: Fn(&str) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .raw
            .push(Arc::new(handler));
    }

    /// Number of handlers registered for a message type.
    pub fn handler_count(&self, msg_type: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_type
            .get(msg_type)
            .map_or(0, Vec::len)
    }

    /// Dispatch a frame to every handler registered for its type.
    ///
    /// Returns how many handlers ran successfully.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        // Snapshot so handlers may register further handlers without deadlocking.
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_type
            .get(&envelope.msg_type)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(msg_type = %envelope.msg_type, "No handler registered, dropping message");
            return 0;
        }

        handlers
            .iter()
            .filter(|handler| isolate(&envelope.msg_type, || handler(envelope)))
            .count()
    }

    /// Dispatch a raw output line to every raw handler.
    pub fn dispatch_raw(&self, line: &str) -> usize {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .raw
            .clone();

        handlers
            .iter()
            .filter(|handler| isolate("raw", || handler(line)))
            .count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventBus")
            .field("types", &handlers.by_type.keys().collect::<Vec<_>>())
            .field("raw_handlers", &handlers.raw.len())
            .finish()
    }
}

/// Run one handler, logging (not propagating) errors and panics.
fn isolate(kind: &str, f: impl FnOnce() -> Result<(), HandlerError>) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(msg_type = kind, error = %e, "Handler failed");
            false
        }
        Err(_) => {
            warn!(msg_type = kind, "Handler panicked");
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn envelope(msg_type: &str) -> Envelope {
        Envelope {
            msg_type: msg_type.to_string(),
            payload: json!({}),
            timestamp: None,
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            bus.on("pong", move |_| {
                seen.lock().unwrap().push(i);
                Ok(())
            });
        }

        assert_eq!(bus.dispatch(&envelope("pong")), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_handler_does_not_stop_the_rest() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        bus.on("step_update", |_| Err("boom".into()));
        bus.on("step_update", |_| panic!("handler bug"));
        let h = Arc::clone(&hits);
        bus.on("step_update", move |_| {
            *h.lock().unwrap() += 1;
            Ok(())
        });

        assert_eq!(bus.dispatch(&envelope("step_update")), 1);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn unregistered_type_is_dropped() {
        let bus = EventBus::new();
        bus.on("ping", |_| Ok(()));
        assert_eq!(bus.dispatch(&envelope("something_new")), 0);
        assert_eq!(bus.handler_count("ping"), 1);
        assert_eq!(bus.handler_count("something_new"), 0);
    }

    #[test]
    fn raw_handlers_receive_lines() {
        let bus = EventBus::new();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&lines);
        bus.on_raw(move |line| {
            l.lock().unwrap().push(line.to_string());
            Ok(())
        });

        bus.dispatch_raw("hello");
        assert_eq!(*lines.lock().unwrap(), vec!["hello".to_string()]);
    }
}
