use std::cell::RefCell;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::message::{OutboundMessage, PortHandle, RequestId};
use crate::surface::{FrameRef, SurfaceId};

/// Host-side wrapper around a transferred port handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePortMain {
    pub id: Uuid,
    pub handle: PortHandle,
}

impl MessagePortMain {
    pub fn wrap(handle: PortHandle) -> Self {
        Self {
            id: Uuid::new_v4(),
            handle,
        }
    }
}

/// Event handed to fan-out and sync listeners.
pub struct IpcEvent {
    pub sender: SurfaceId,
    pub frame: FrameRef,
    pub channel: String,
    pub ports: Vec<MessagePortMain>,
    return_value: RefCell<Option<Value>>,
    replies: RefCell<Vec<OutboundMessage>>,
}

impl IpcEvent {
    pub fn new(sender: SurfaceId, frame: FrameRef, channel: impl Into<String>) -> Self {
        Self {
            sender,
            frame,
            channel: channel.into(),
            ports: Vec::new(),
            return_value: RefCell::new(None),
            replies: RefCell::new(Vec::new()),
        }
    }

    pub fn with_ports(mut self, ports: Vec<MessagePortMain>) -> Self {
        self.ports = ports;
        self
    }

    /// Answer a sync call. The last assignment wins.
    pub fn set_return_value(&self, value: Value) {
        *self.return_value.borrow_mut() = Some(value);
    }

    pub fn return_value(&self) -> Option<Value> {
        self.return_value.borrow().clone()
    }

    /// Send a message back to the exact frame that emitted this event.
    pub fn reply(&self, channel: impl Into<String>, args: Vec<Value>) {
        self.replies.borrow_mut().push(OutboundMessage {
            target: self.sender,
            frame: Some(self.frame),
            internal: false,
            channel: channel.into(),
            args,
        });
    }

    pub(crate) fn take_replies(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.replies.borrow_mut())
    }
}

/// Event handed to invoke handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeEvent {
    pub sender: SurfaceId,
    pub frame: FrameRef,
    pub channel: String,
    pub request_id: RequestId,
}
