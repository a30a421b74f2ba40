//! Fan-out of inbound envelopes to registered handlers.
//!
//! Handlers run synchronously on the driver task, in global registration
//! order (type-specific and wildcard interleaved). A failing or panicking
//! handler is logged and skipped; the rest still run.

use std::error::Error;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tether_core::{Envelope, EventType};
use tracing::{debug, error, warn};

/// What a handler returns. `Err` is logged at `warn`.
pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

type Handler = Arc<dyn Fn(&Envelope) -> HandlerResult + Send + Sync>;

/// Which envelopes a handler receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Only envelopes of this type.
    Event(EventType),
    /// Every envelope.
    Wildcard,
}

impl Route {
    fn matches(&self, event_type: &EventType) -> bool {
        match self {
            Self::Event(expected) => expected == event_type,
            Self::Wildcard => true,
        }
    }
}

struct Registration {
    id: u64,
    route: Route,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    handlers: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

/// Handler registry and dispatch.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.inner.handlers.read().len())
            .finish()
    }
}

impl Dispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `route`.
    pub fn register<F>(&self, route: Route, handler: F) -> HandlerHandle
    where
        F: Fn(&Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().push(Registration {
            id,
            route,
            handler: Arc::new(handler),
        });
        HandlerHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }

    /// Stamp `envelope.local_seq` and run every matching handler.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, mut envelope: Envelope) -> usize {
        envelope.local_seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1;

        let (matching, has_specific) = {
            let handlers = self.inner.handlers.read();
            let has_specific = handlers
                .iter()
                .any(|r| matches!(&r.route, Route::Event(t) if *t == envelope.event_type));
            let matching: Vec<(u64, Handler)> = handlers
                .iter()
                .filter(|r| r.route.matches(&envelope.event_type))
                .map(|r| (r.id, Arc::clone(&r.handler)))
                .collect();
            (matching, has_specific)
        };

        if !has_specific {
            debug!(
                event_type = %envelope.event_type,
                seq = envelope.local_seq,
                "no handler registered for event type"
            );
        }

        for (id, handler) in &matching {
            match catch_unwind(AssertUnwindSafe(|| handler(&envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    handler_id = id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "event handler failed"
                ),
                Err(panic) => error!(
                    handler_id = id,
                    event_type = %envelope.event_type,
                    panic = panic_message(panic.as_ref()),
                    "event handler panicked"
                ),
            }
        }
        matching.len()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Registration token. Dropping it keeps the handler registered; call
/// [`HandlerHandle::unregister`] to remove it.
#[derive(Clone, Debug)]
pub struct HandlerHandle {
    id: u64,
    inner: Weak<Inner>,
}

impl HandlerHandle {
    /// Registration id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the handler. Returns `false` if it was already removed or the
    /// dispatcher is gone.
    pub fn unregister(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut handlers = inner.handlers.write();
        let before = handlers.len();
        handlers.retain(|r| r.id != self.id);
        handlers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use tether_core::logging::capture_logs;
    use tracing::Level;

    type Boxed = Box<dyn Fn(&Envelope) -> HandlerResult + Send + Sync>;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Boxed) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |name: &'static str| -> Boxed {
                let log = Arc::clone(&log);
                Box::new(move |env: &Envelope| {
                    log.lock().unwrap().push(format!("{name}:{}", env.event_type));
                    Ok(())
                })
            }
        };
        (log, make)
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();
        let _a = dispatcher.register(Route::Event(EventType::ChatMessage), make("a"));
        let _w = dispatcher.register(Route::Wildcard, make("w"));
        let _b = dispatcher.register(Route::Event(EventType::ChatMessage), make("b"));
        let _other = dispatcher.register(Route::Event(EventType::Presence), make("p"));

        assert_eq!(dispatcher.dispatch(Envelope::new(EventType::ChatMessage)), 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:chat_message", "w:chat_message", "b:chat_message"]
        );
    }

    #[test]
    fn local_seq_is_monotonic() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _h = dispatcher.register(Route::Wildcard, move |env| {
            sink.lock().unwrap().push(env.local_seq);
            Ok(())
        });
        for _ in 0..3 {
            let _ = dispatcher.dispatch(Envelope::new(EventType::Message));
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_stop_others() {
        let (logs, _guard) = capture_logs();
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();
        let _e = dispatcher.register(Route::Event(EventType::Lifecycle), |_| Err("boom".into()));
        let _p = dispatcher.register(Route::Event(EventType::Lifecycle), |_| panic!("kaboom"));
        let _ok = dispatcher.register(Route::Event(EventType::Lifecycle), make("ok"));

        assert_eq!(dispatcher.dispatch(Envelope::new(EventType::Lifecycle)), 3);
        assert_eq!(*log.lock().unwrap(), vec!["ok:lifecycle"]);

        let failed = logs.find(Level::WARN, "event handler failed").unwrap();
        assert_eq!(failed.field("error"), Some("boom"));
        let panicked = logs.find(Level::ERROR, "event handler panicked").unwrap();
        assert_eq!(panicked.field("panic"), Some("kaboom"));
    }

    #[test]
    fn unmatched_type_logs_at_debug_but_reaches_wildcards() {
        let (logs, _guard) = capture_logs();
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();
        let _w = dispatcher.register(Route::Wildcard, make("w"));

        assert_eq!(dispatcher.dispatch(Envelope::new(EventType::from_wire("surge_pricing"))), 1);
        assert_eq!(*log.lock().unwrap(), vec!["w:surge_pricing"]);
        assert!(logs.has_event(Level::DEBUG, "no handler registered for event type"));
    }

    #[test]
    fn unregister_removes_only_that_handler() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();
        let first = dispatcher.register(Route::Event(EventType::Presence), make("first"));
        let _second = dispatcher.register(Route::Event(EventType::Presence), make("second"));

        assert!(first.unregister());
        assert!(!first.unregister());
        let _ = dispatcher.dispatch(Envelope::new(EventType::Presence));
        assert_eq!(*log.lock().unwrap(), vec!["second:presence"]);
        assert_eq!(dispatcher.handler_count(), 1);
    }

    #[test]
    fn handler_may_register_during_dispatch() {
        let dispatcher = Dispatcher::new();
        let inner = dispatcher.clone();
        let _h = dispatcher.register(Route::Event(EventType::Message), move |_| {
            let _ = inner.register(Route::Wildcard, |_| Ok(()));
            Ok(())
        });
        assert_eq!(dispatcher.dispatch(Envelope::new(EventType::Message)), 1);
        assert_eq!(dispatcher.handler_count(), 2);
    }

    #[test]
    fn unregister_during_dispatch_leaves_current_pass_intact() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();
        let target: Arc<Mutex<Option<HandlerHandle>>> = Arc::new(Mutex::new(None));

        let record = make("a");
        let slot = Arc::clone(&target);
        let _a = dispatcher.register(Route::Event(EventType::Presence), move |env| {
            if let Some(handle) = slot.lock().unwrap().take() {
                assert!(handle.unregister());
            }
            record(env)
        });
        let b = dispatcher.register(Route::Event(EventType::Presence), make("b"));
        *target.lock().unwrap() = Some(b);

        assert_eq!(dispatcher.dispatch(Envelope::new(EventType::Presence)), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:presence", "b:presence"]);
        assert_eq!(dispatcher.handler_count(), 1);

        assert_eq!(dispatcher.dispatch(Envelope::new(EventType::Presence)), 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:presence", "b:presence", "a:presence"]
        );
    }

    #[test]
    fn handle_outliving_dispatcher() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.register(Route::Wildcard, |_| Ok(()));
        drop(dispatcher);
        assert!(!handle.unregister());
    }
}
