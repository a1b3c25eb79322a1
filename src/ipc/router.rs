//! Classifies inbound bridge messages and delivers them to the registry
//! scopes that apply to the sender.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::rc::{Rc, Weak};

use futures_util::future::{self, FutureExt, LocalBoxFuture};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::event::{InvokeEvent, IpcEvent, MessagePortMain};
use super::message::{InboundMessage, InvokeReply, OutboundMessage, PortHandle, RequestId};
use super::registry::IpcScope;
use crate::audit::Audit;
use crate::error::HostError;
use crate::surface::{FrameRef, ProcessId, SurfaceId};

type PendingKey = (SurfaceId, ProcessId, RequestId);

/// Outcome of a fan-out delivery.
#[derive(Debug, Default)]
pub struct Delivery {
    pub listeners: usize,
    /// Messages queued through [`IpcEvent::reply`].
    pub replies: Vec<OutboundMessage>,
}

#[derive(Debug)]
pub struct SyncDelivery {
    pub value: Value,
    pub listeners: usize,
    pub replies: Vec<OutboundMessage>,
}

/// Marks an invoke token as in flight until dropped.
struct PendingGuard {
    key: PendingKey,
    pending: Weak<RefCell<HashSet<PendingKey>>>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.upgrade() {
            pending.borrow_mut().remove(&self.key);
        }
    }
}

pub struct MessageRouter {
    main: Rc<IpcScope>,
    internal: Rc<IpcScope>,
    surfaces: RefCell<HashMap<SurfaceId, Rc<IpcScope>>>,
    frames: RefCell<HashMap<FrameRef, Rc<IpcScope>>>,
    pending: Rc<RefCell<HashSet<PendingKey>>>,
    audit: Audit,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::with_audit(Audit::default())
    }

    /// A router whose scopes record handler registrations to `audit`.
    pub fn with_audit(audit: Audit) -> Self {
        Self {
            main: IpcScope::audited("ipcMain", audit.clone()),
            internal: IpcScope::audited("ipcMainInternal", audit.clone()),
            surfaces: RefCell::new(HashMap::new()),
            frames: RefCell::new(HashMap::new()),
            pending: Rc::new(RefCell::new(HashSet::new())),
            audit,
        }
    }

    /// Process-wide scope shared by every surface.
    pub fn ipc_main(&self) -> Rc<IpcScope> {
        Rc::clone(&self.main)
    }

    /// Scope for host-internal channels; only `internal` messages reach it.
    pub fn internal(&self) -> Rc<IpcScope> {
        Rc::clone(&self.internal)
    }

    pub fn surface_scope(&self, surface: SurfaceId) -> Rc<IpcScope> {
        Rc::clone(
            self.surfaces
                .borrow_mut()
                .entry(surface)
                .or_insert_with(|| IpcScope::audited(format!("surface {surface}"), self.audit.clone())),
        )
    }

    pub fn frame_scope(&self, frame: FrameRef) -> Rc<IpcScope> {
        Rc::clone(self.frames.borrow_mut().entry(frame).or_insert_with(|| {
            IpcScope::audited(
                format!("frame {}:{}", frame.process_id.0, frame.frame_id.0),
                self.audit.clone(),
            )
        }))
    }

    fn existing_surface_scope(&self, surface: SurfaceId) -> Option<Rc<IpcScope>> {
        self.surfaces.borrow().get(&surface).cloned()
    }

    fn existing_frame_scope(&self, frame: FrameRef) -> Option<Rc<IpcScope>> {
        self.frames.borrow().get(&frame).cloned()
    }

    /// Scopes in delivery order: frame, surface, process-wide.
    fn public_scopes(&self, message: &InboundMessage) -> Vec<Rc<IpcScope>> {
        let mut scopes = Vec::with_capacity(3);
        scopes.extend(self.existing_frame_scope(message.frame()));
        scopes.extend(self.existing_surface_scope(message.sender));
        scopes.push(Rc::clone(&self.main));
        scopes
    }

    fn fan_out(&self, message: &InboundMessage, event: &IpcEvent, args: &[Value]) -> usize {
        if message.internal {
            return self.internal.emit(event, args);
        }
        self.public_scopes(message)
            .iter()
            .map(|scope| scope.emit(event, args))
            .sum()
    }

    pub fn send(&self, message: &InboundMessage) -> Delivery {
        let event = IpcEvent::new(message.sender, message.frame(), message.channel.clone());
        let listeners = self.fan_out(message, &event, &message.args);
        Delivery {
            listeners,
            replies: event.take_replies(),
        }
    }

    /// Deliver a sync call. Missing listeners are not an error: the sender
    /// gets `null` and a warning is logged.
    pub fn send_sync(&self, message: &InboundMessage) -> SyncDelivery {
        let event = IpcEvent::new(message.sender, message.frame(), message.channel.clone());
        let listeners = self.fan_out(message, &event, &message.args);
        if listeners == 0 && !message.internal {
            warn!(
                target = "ipc",
                surface = %message.sender,
                channel = %message.channel,
                "surface called sendSync() on a channel without listeners"
            );
        }
        SyncDelivery {
            value: event.return_value().unwrap_or(Value::Null),
            listeners,
            replies: event.take_replies(),
        }
    }

    /// Fan out a port transfer; `args[0]` is the message payload.
    pub fn post_ports(&self, message: &InboundMessage, ports: &[PortHandle]) -> Delivery {
        let ports = ports.iter().copied().map(MessagePortMain::wrap).collect();
        let event = IpcEvent::new(message.sender, message.frame(), message.channel.clone())
            .with_ports(ports);
        let payload = [message.args.first().cloned().unwrap_or(Value::Null)];
        let listeners = self
            .public_scopes(message)
            .iter()
            .map(|scope| scope.emit(&event, &payload))
            .sum();
        Delivery {
            listeners,
            replies: event.take_replies(),
        }
    }

    /// Resolve the one handler for an invoke call and start it.
    ///
    /// Returns `None` when the same request token of this sender is still in
    /// flight; that duplicate gets no reply of its own.
    pub fn invoke(
        &self,
        message: &InboundMessage,
        request_id: RequestId,
    ) -> Option<LocalBoxFuture<'static, InvokeReply>> {
        let key = (message.sender, message.process_id, request_id);
        if !self.pending.borrow_mut().insert(key) {
            warn!(
                target = "ipc",
                surface = %message.sender,
                channel = %message.channel,
                request_id,
                "ignoring invoke with a request token that is still pending"
            );
            return None;
        }
        let guard = PendingGuard {
            key,
            pending: Rc::downgrade(&self.pending),
        };

        let channel = message.channel.clone();
        let handler = if message.internal {
            self.internal.resolve(&channel)
        } else {
            self.public_scopes(message)
                .iter()
                .find_map(|scope| scope.resolve(&channel))
        };

        let Some(handler) = handler else {
            let err = HostError::NoHandler(channel.clone());
            error!(target = "ipc", channel = %channel, error = %err, "invoke failed");
            drop(guard);
            return Some(future::ready(InvokeReply::Error(err.to_string())).boxed_local());
        };

        let event = InvokeEvent {
            sender: message.sender,
            frame: message.frame(),
            channel: channel.clone(),
            request_id,
        };
        let args = message.args.clone();
        let started = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event, args)));

        Some(
            async move {
                let _guard = guard;
                let outcome = match started {
                    Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                    Err(panic) => Err(panic),
                };
                match outcome {
                    Ok(Ok(value)) => InvokeReply::Result(value),
                    Ok(Err(err)) => {
                        let detail = format!("{err:#}");
                        error!(
                            target = "ipc",
                            channel = %channel,
                            error = %detail,
                            "error occurred in invoke handler"
                        );
                        InvokeReply::Error(format!(
                            "Error invoking remote method '{channel}': {err}"
                        ))
                    }
                    Err(_) => {
                        error!(target = "ipc", channel = %channel, "invoke handler panicked");
                        InvokeReply::Error(format!(
                            "Error invoking remote method '{channel}': handler panicked"
                        ))
                    }
                }
            }
            .boxed_local(),
        )
    }

    pub fn is_pending(&self, sender: SurfaceId, process_id: ProcessId, request_id: RequestId) -> bool {
        self.pending
            .borrow()
            .contains(&(sender, process_id, request_id))
    }

    /// Drop the scopes of a surface that is going away.
    pub fn forget_surface(&self, surface: SurfaceId, frames: &[FrameRef]) {
        self.surfaces.borrow_mut().remove(&surface);
        let mut scopes = self.frames.borrow_mut();
        for frame in frames {
            scopes.remove(frame);
        }
        debug!(target = "ipc", surface = %surface, frames = frames.len(), "dropped surface scopes");
    }

    pub fn forget_frame(&self, frame: FrameRef) {
        self.frames.borrow_mut().remove(&frame);
    }
}

/// Register a sync internal handler. The reply follows the
/// `[null, value]` / `[{"message": ..}]` convention of sync host calls.
pub fn handle_sync<F>(scope: &IpcScope, channel: impl Into<String>, handler: F)
where
    F: Fn(&IpcEvent, &[Value]) -> Result<Value, HostError> + 'static,
{
    scope.on(channel, move |event, args| {
        let reply = match handler(event, args) {
            Ok(value) => Value::Array(vec![Value::Null, value]),
            Err(err) => {
                error!(target = "ipc", channel = %event.channel, error = %err, "sync handler failed");
                serde_json::json!([{ "message": err.to_string() }])
            }
        };
        event.set_return_value(reply);
    });
}
