use crate::core::value::Value;
use crate::error::{CloseCode, ProtocolError, Result};
use crate::protocol::registry::PacketRegistry;
use crate::utils::metrics::global_metrics;
use std::collections::HashMap;
use tracing::{error, warn};

/// Packet listener. Errors go to the connection's error callback.
pub type Listener = Box<dyn FnMut(&[Value]) -> Result<()> + Send + 'static>;
type ReadyFn = Box<dyn FnOnce() + Send + 'static>;
type CloseFn = Box<dyn FnMut(CloseCode, &str) + Send + 'static>;
type ErrorFn = Box<dyn FnMut(&ProtocolError) + Send + 'static>;

/// Per-connection listener table with tag-based routing.
///
/// Listeners registered before the registry is known wait in a pending
/// queue that is drained once, in registration order, on the transition
/// into `Ready`.
pub struct Dispatcher {
    listeners: HashMap<String, Vec<Listener>>,
    pending: Vec<(String, Listener)>,
    ready: Vec<ReadyFn>,
    close: Vec<CloseFn>,
    on_error: Option<ErrorFn>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
            pending: Vec::new(),
            ready: Vec::new(),
            close: Vec::new(),
            on_error: None,
        }
    }

    /// Register against a known registry; unknown tags fail here.
    pub fn register<F>(&mut self, registry: &PacketRegistry, tag: &str, listener: F) -> Result<()>
    where
        F: FnMut(&[Value]) -> Result<()> + Send + 'static,
    {
        registry.get_key(tag)?;
        self.insert(tag.to_string(), Box::new(listener));
        Ok(())
    }

    /// Queue a listener until the registry arrives.
    pub fn defer<F>(&mut self, tag: &str, listener: F)
    where
        F: FnMut(&[Value]) -> Result<()> + Send + 'static,
    {
        self.pending.push((tag.to_string(), Box::new(listener)));
    }

    fn insert(&mut self, tag: String, listener: Listener) {
        self.listeners.entry(tag).or_default().push(listener);
    }

    /// Move every pending listener into the table. Listeners for tags the
    /// registry does not know are reported and dropped.
    pub fn drain_pending(&mut self, registry: &PacketRegistry) {
        for (tag, listener) in std::mem::take(&mut self.pending) {
            if registry.contains(&tag) {
                self.insert(tag, listener);
            } else {
                warn!(tag = %tag, "Dropping listener for unknown packet");
                self.report(&ProtocolError::UnknownTag(tag));
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn on_ready<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.ready.push(Box::new(callback));
    }

    /// Run every queued ready callback once, in registration order.
    pub fn fire_ready(&mut self) {
        for callback in std::mem::take(&mut self.ready) {
            callback();
        }
    }

    pub fn on_close<F>(&mut self, callback: F)
    where
        F: FnMut(CloseCode, &str) + Send + 'static,
    {
        self.close.push(Box::new(callback));
    }

    pub fn fire_close(&mut self, code: CloseCode, reason: &str) {
        for callback in self.close.iter_mut() {
            callback(code, reason);
        }
    }

    pub fn on_error<F>(&mut self, callback: F)
    where
        F: FnMut(&ProtocolError) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
    }

    /// Hand an error to the error callback, or log it.
    pub fn report(&mut self, err: &ProtocolError) {
        match self.on_error.as_mut() {
            Some(callback) => callback(err),
            None => error!(error = %err, "Unhandled connection error"),
        }
    }

    /// Invoke every listener for `tag`. Returns how many ran.
    pub fn dispatch(&mut self, tag: &str, args: &[Value]) -> usize {
        let Some(listeners) = self.listeners.get_mut(tag) else {
            return 0;
        };
        let mut failures = Vec::new();
        for listener in listeners.iter_mut() {
            if let Err(e) = listener(args) {
                failures.push(e);
            }
        }
        let invoked = listeners.len();
        for err in failures {
            global_metrics().listener_error();
            self.report(&ProtocolError::Listener(format!("{tag}: {err}")));
        }
        invoked
    }

    pub fn has_listeners(&self, tag: &str) -> bool {
        self.listeners.get(tag).is_some_and(|l| !l.is_empty())
    }

    /// Drop every callback; nothing fires after close.
    pub fn clear(&mut self) {
        self.listeners.clear();
        self.pending.clear();
        self.ready.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::Packet;
    use crate::core::schema::PacketSchema;
    use crate::core::types::PacketType;
    use std::sync::{Arc, Mutex};

    fn registry() -> PacketRegistry {
        PacketRegistry::register(vec![Packet::new(
            "chat",
            PacketSchema::single(PacketType::Strings, 1, 1).unwrap(),
        )
        .unwrap()])
        .unwrap()
    }

    #[test]
    fn test_register_unknown_tag_fails() {
        let mut dispatcher = Dispatcher::new();
        assert!(matches!(
            dispatcher.register(&registry(), "nope", |_| Ok(())),
            Err(ProtocolError::UnknownTag(_))
        ));
    }

    #[test]
    fn test_pending_drained_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(0));
        let mut dispatcher = Dispatcher::new();
        {
            let errors = errors.clone();
            dispatcher.on_error(move |_| *errors.lock().unwrap() += 1);
        }
        for n in 0..3 {
            let seen = seen.clone();
            dispatcher.defer("chat", move |_| {
                seen.lock().unwrap().push(n);
                Ok(())
            });
        }
        dispatcher.defer("ghost", |_| Ok(()));
        dispatcher.drain_pending(&registry());
        assert_eq!(dispatcher.pending_len(), 0);
        assert_eq!(*errors.lock().unwrap(), 1);

        assert_eq!(dispatcher.dispatch("chat", &[Value::from("hi")]), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_ready_fires_once_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        for n in 0..2 {
            let order = order.clone();
            dispatcher.on_ready(move || order.lock().unwrap().push(n));
        }
        dispatcher.fire_ready();
        dispatcher.fire_ready();
        assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_listener_error_does_not_stop_others() {
        let hits = Arc::new(Mutex::new(0));
        let reported = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        {
            let reported = reported.clone();
            dispatcher.on_error(move |e| reported.lock().unwrap().push(e.to_string()));
        }
        let registry = registry();
        dispatcher
            .register(&registry, "chat", |_| {
                Err(ProtocolError::Listener("boom".into()))
            })
            .unwrap();
        {
            let hits = hits.clone();
            dispatcher
                .register(&registry, "chat", move |_| {
                    *hits.lock().unwrap() += 1;
                    Ok(())
                })
                .unwrap();
        }
        dispatcher.dispatch("chat", &[]);
        assert_eq!(*hits.lock().unwrap(), 1);
        assert_eq!(reported.lock().unwrap().len(), 1);
        assert!(reported.lock().unwrap()[0].contains("boom"));
    }

    #[test]
    fn test_listeners_keyed_by_tag() {
        let mut dispatcher = Dispatcher::new();
        let registry = registry();
        dispatcher.register(&registry, "chat", |_| Ok(())).unwrap();
        dispatcher.defer("chat", |_| Ok(()));
        dispatcher.drain_pending(&registry);

        assert!(dispatcher.has_listeners("chat"));
        assert!(!dispatcher.has_listeners("other"));
        assert_eq!(dispatcher.dispatch(&String::from("chat"), &[]), 2);
        assert_eq!(dispatcher.dispatch("other", &[]), 0);

        dispatcher.clear();
        assert!(!dispatcher.has_listeners("chat"));
    }
}
