pub mod event;
pub mod message;
pub mod registry;
pub mod router;

pub use event::{InvokeEvent, IpcEvent, MessagePortMain};
pub use message::{
    InboundMessage, InvokeReply, MessageKind, OutboundMessage, PortHandle, Reply, RequestId,
};
pub use registry::{InvokeFuture, InvokeHandler, IpcScope, Listener, ListenerId};
pub use router::{handle_sync, Delivery, MessageRouter, SyncDelivery};
