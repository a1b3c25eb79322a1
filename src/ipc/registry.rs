//! Per-scope handler registry and listener sets.

use std::any::type_name;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;

use futures_util::future::{FutureExt, LocalBoxFuture};
use serde_json::Value;

use super::event::{InvokeEvent, IpcEvent};
use crate::audit::{Audit, AuditRecord};
use crate::error::HostError;

pub type InvokeFuture = LocalBoxFuture<'static, anyhow::Result<Value>>;
pub type InvokeHandler = Rc<dyn Fn(InvokeEvent, Vec<Value>) -> InvokeFuture>;
pub type Listener = Rc<dyn Fn(&IpcEvent, &[Value])>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    once: bool,
    listener: Listener,
}

/// One registry scope (process-wide, per-surface or per-frame): at most one
/// invoke handler per channel, any number of fan-out listeners per channel.
#[derive(Default)]
pub struct IpcScope {
    handlers: RefCell<HashMap<String, InvokeHandler>>,
    listeners: RefCell<HashMap<String, Vec<ListenerEntry>>>,
    next_listener: Cell<u64>,
    label: String,
    audit: Audit,
}

impl IpcScope {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// A scope whose handler registrations are written to `audit` under
    /// `label`.
    pub fn audited(label: impl Into<String>, audit: Audit) -> Rc<Self> {
        Rc::new(Self {
            label: label.into(),
            audit,
            ..Self::default()
        })
    }

    /// Register the invoke handler for `channel`. A second registration on the
    /// same channel fails and leaves the first handler in place.
    pub fn handle<F, Fut>(&self, channel: impl Into<String>, handler: F) -> Result<(), HostError>
    where
        F: Fn(InvokeEvent, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + 'static,
    {
        let handler: InvokeHandler = Rc::new(move |event, args| handler(event, args).boxed_local());
        self.insert_handler(channel.into(), handler, type_name::<F>())
    }

    /// Like [`handle`](Self::handle), but the handler unregisters itself on its
    /// first invocation, before the wrapped body runs.
    pub fn handle_once<F, Fut>(
        self: &Rc<Self>,
        channel: impl Into<String>,
        handler: F,
    ) -> Result<(), HostError>
    where
        F: Fn(InvokeEvent, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + 'static,
    {
        let channel = channel.into();
        let scope = Rc::downgrade(self);
        let name = channel.clone();
        let wrapped: InvokeHandler = Rc::new(move |event, args| {
            if let Some(scope) = scope.upgrade() {
                scope.remove_handler(&name);
            }
            handler(event, args).boxed_local()
        });
        self.insert_handler(channel, wrapped, type_name::<F>())
    }

    fn insert_handler(
        &self,
        channel: String,
        handler: InvokeHandler,
        handler_name: &str,
    ) -> Result<(), HostError> {
        {
            let mut handlers = self.handlers.borrow_mut();
            if handlers.contains_key(&channel) {
                return Err(HostError::DuplicateHandler(channel));
            }
            handlers.insert(channel.clone(), handler);
        }
        self.audit.record(|| AuditRecord::HandlerRegistered {
            scope: self.label.clone(),
            channel,
            handler: handler_name.to_string(),
        });
        Ok(())
    }

    pub fn remove_handler(&self, channel: &str) {
        self.handlers.borrow_mut().remove(channel);
    }

    pub fn has_handler(&self, channel: &str) -> bool {
        self.handlers.borrow().contains_key(channel)
    }

    pub fn resolve(&self, channel: &str) -> Option<InvokeHandler> {
        self.handlers.borrow().get(channel).cloned()
    }

    pub fn on<F>(&self, channel: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&IpcEvent, &[Value]) + 'static,
    {
        self.add_listener(channel.into(), Rc::new(listener), false)
    }

    pub fn once<F>(&self, channel: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&IpcEvent, &[Value]) + 'static,
    {
        self.add_listener(channel.into(), Rc::new(listener), true)
    }

    fn add_listener(&self, channel: String, listener: Listener, once: bool) -> ListenerId {
        let id = ListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        self.listeners
            .borrow_mut()
            .entry(channel)
            .or_default()
            .push(ListenerEntry { id, once, listener });
        id
    }

    pub fn remove_listener(&self, channel: &str, id: ListenerId) {
        let mut listeners = self.listeners.borrow_mut();
        if let Some(entries) = listeners.get_mut(channel) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                listeners.remove(channel);
            }
        }
    }

    pub fn remove_all_listeners(&self, channel: &str) {
        self.listeners.borrow_mut().remove(channel);
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.listeners
            .borrow()
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Call every listener registered for `event.channel`, in registration
    /// order. Returns how many ran.
    pub fn emit(&self, event: &IpcEvent, args: &[Value]) -> usize {
        let snapshot: Vec<ListenerEntry> = {
            let mut listeners = self.listeners.borrow_mut();
            let Some(entries) = listeners.get_mut(&event.channel) else {
                return 0;
            };
            let snapshot = entries.clone();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                listeners.remove(&event.channel);
            }
            snapshot
        };
        for entry in &snapshot {
            (entry.listener)(event, args);
        }
        snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{FrameId, FrameRef, ProcessId, SurfaceId};
    use futures_util::future::ready;
    use serde_json::json;

    fn invoke_event(channel: &str) -> InvokeEvent {
        InvokeEvent {
            sender: SurfaceId(1),
            frame: FrameRef::new(ProcessId(1), FrameId(1)),
            channel: channel.into(),
            request_id: 1,
        }
    }

    #[test]
    fn second_handler_is_rejected_and_first_survives() {
        let scope = IpcScope::new();
        scope.handle("ping", |_, _| ready(Ok(json!("first")))).unwrap();
        let err = scope
            .handle("ping", |_, _| ready(Ok(json!("second"))))
            .unwrap_err();
        assert_eq!(err, HostError::DuplicateHandler("ping".into()));

        let handler = scope.resolve("ping").expect("first handler kept");
        let value = handler(invoke_event("ping"), vec![])
            .now_or_never()
            .unwrap()
            .unwrap();
        assert_eq!(value, json!("first"));
    }

    #[test]
    fn remove_handler_is_idempotent() {
        let scope = IpcScope::new();
        scope.handle("ping", |_, _| ready(Ok(Value::Null))).unwrap();
        scope.remove_handler("ping");
        scope.remove_handler("ping");
        assert!(scope.resolve("ping").is_none());
        scope.handle("ping", |_, _| ready(Ok(Value::Null))).unwrap();
    }

    #[test]
    fn handle_once_unregisters_before_running() {
        let scope = IpcScope::new();
        let observed = Rc::new(Cell::new(None));
        let weak = Rc::downgrade(&scope);
        let seen = Rc::clone(&observed);
        scope
            .handle_once("boot", move |_, _| {
                let still_registered = weak.upgrade().map(|scope| scope.has_handler("boot"));
                seen.set(still_registered);
                ready(Ok(Value::Null))
            })
            .unwrap();

        let handler = scope.resolve("boot").unwrap();
        handler(invoke_event("boot"), vec![])
            .now_or_never()
            .unwrap()
            .unwrap();
        assert_eq!(observed.get(), Some(false));
        assert!(scope.resolve("boot").is_none());
    }

    #[test]
    fn emit_runs_every_listener_and_drops_once_listeners() {
        let scope = IpcScope::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        for label in ["a", "b"] {
            let calls = Rc::clone(&calls);
            scope.on("tick", move |_, args| {
                calls.borrow_mut().push(format!("{label}:{}", args[0]))
            });
        }
        let once_calls = Rc::clone(&calls);
        scope.once("tick", move |_, _| once_calls.borrow_mut().push("once".into()));

        let event = IpcEvent::new(SurfaceId(1), FrameRef::new(ProcessId(1), FrameId(1)), "tick");
        assert_eq!(scope.emit(&event, &[json!(1)]), 3);
        assert_eq!(scope.emit(&event, &[json!(2)]), 2);
        assert_eq!(
            *calls.borrow(),
            vec!["a:1", "b:1", "once", "a:2", "b:2"]
        );
    }

    #[test]
    fn remove_listener_targets_one_entry() {
        let scope = IpcScope::new();
        let first = scope.on("tick", |_, _| {});
        scope.on("tick", |_, _| {});
        scope.remove_listener("tick", first);
        assert_eq!(scope.listener_count("tick"), 1);
        scope.remove_all_listeners("tick");
        assert_eq!(scope.listener_count("tick"), 0);
    }
}
