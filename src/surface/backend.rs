use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::preferences::Preferences;
use super::{FrameId, ProcessId, SurfaceId, SurfaceKind};
use crate::ipc::message::{OutboundMessage, Reply, RequestId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSurfaceParams {
    pub kind: SurfaceKind,
    pub preferences: Preferences,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedder: Option<SurfaceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opener: Option<SurfaceId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadUrlOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// The process-owning side of the runtime: spawns and tears down surfaces and
/// carries messages across the process boundary.
///
/// Implementations must not call back into the host synchronously; lifecycle
/// signals are delivered later as [`crate::host::HostEvent`]s.
pub trait SurfaceBackend {
    /// Spawn the process backing `id` and return its process id.
    fn create_surface(
        &mut self,
        id: SurfaceId,
        params: &CreateSurfaceParams,
    ) -> anyhow::Result<ProcessId>;

    fn destroy_surface(&mut self, id: SurfaceId);

    fn send(&mut self, message: OutboundMessage);

    fn reply(&mut self, target: SurfaceId, request_id: RequestId, reply: Reply);

    fn load_url(&mut self, id: SurfaceId, url: &Url, options: &LoadUrlOptions);

    fn attach_to_iframe(&mut self, guest: SurfaceId, embedder: SurfaceId, frame: FrameId);

    fn detach_from_outer_frame(&mut self, guest: SurfaceId);

    fn add_guest(&mut self, guest: SurfaceId, embedder: SurfaceId, preferences: &Preferences);

    fn remove_guest(&mut self, embedder: SurfaceId, guest: SurfaceId);

    /// Preferences the next child created by `opener` must be constructed with.
    fn set_next_child_preferences(&mut self, opener: SurfaceId, preferences: &Preferences);

    fn call_method(&mut self, id: SurfaceId, method: &str, args: &[Value])
        -> anyhow::Result<Value>;

    fn get_property(&mut self, id: SurfaceId, property: &str) -> anyhow::Result<Value>;

    fn set_property(&mut self, id: SurfaceId, property: &str, value: Value)
        -> anyhow::Result<()>;

    fn focus_changed(&mut self, id: SurfaceId, focused: bool);
}
