//! Wire shapes exchanged with the message bridge.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::surface::{FrameId, FrameRef, ProcessId, SurfaceId};

/// Caller-chosen token identifying one sync or invoke request of a sender.
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageKind {
    /// Fire-and-forget fan-out.
    Send,
    /// Fan-out whose listeners may set a return value for the blocked sender.
    SendSync {
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },
    /// Exactly one handler, exactly one reply.
    Invoke {
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },
    /// Fan-out carrying transferable message ports; `args[0]` is the message.
    Ports {
        #[serde(default)]
        ports: Vec<PortHandle>,
    },
    /// A guest's message addressed to its embedder.
    SendToHost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub sender: SurfaceId,
    pub process_id: ProcessId,
    pub frame_id: FrameId,
    #[serde(default)]
    pub internal: bool,
    pub channel: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(flatten)]
    pub kind: MessageKind,
}

impl InboundMessage {
    pub fn frame(&self) -> FrameRef {
        FrameRef::new(self.process_id, self.frame_id)
    }
}

/// Reply to an invoke call: serialized as `{"result": ..}` or `{"error": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokeReply {
    Result(Value),
    Error(String),
}

impl InvokeReply {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Sync(Value),
    Invoke(InvokeReply),
}

/// A host-to-surface message, optionally targeted at one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub target: SurfaceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<FrameRef>,
    pub internal: bool,
    pub channel: String,
    pub args: Vec<Value>,
}

impl OutboundMessage {
    pub fn internal(target: SurfaceId, channel: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            target,
            frame: None,
            internal: true,
            channel: channel.into(),
            args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_invoke_tuple() {
        let message: InboundMessage = serde_json::from_value(json!({
            "sender": 3,
            "processId": 40,
            "frameId": 1,
            "channel": "fs:read",
            "args": ["/tmp"],
            "kind": "invoke",
            "requestId": 9
        }))
        .unwrap();
        assert_eq!(message.sender, SurfaceId(3));
        assert!(!message.internal);
        assert_eq!(message.kind, MessageKind::Invoke { request_id: 9 });
        assert_eq!(message.frame(), FrameRef::new(ProcessId(40), FrameId(1)));
    }

    #[test]
    fn invoke_reply_shape() {
        assert_eq!(
            serde_json::to_value(InvokeReply::Result(json!(4))).unwrap(),
            json!({"result": 4})
        );
        assert_eq!(
            serde_json::to_value(InvokeReply::Error("boom".into())).unwrap(),
            json!({"error": "boom"})
        );
    }
}
