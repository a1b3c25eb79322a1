use thiserror::Error;

use crate::surface::SurfaceId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("Attempted to register a second handler for '{0}'")]
    DuplicateHandler(String),
    #[error("No handler registered for '{0}'")]
    NoHandler(String),
    #[error("Invalid guestInstanceId: {0}")]
    InvalidGuestInstance(SurfaceId),
    #[error("Access denied to guestInstanceId: {0}")]
    AccessDenied(SurfaceId),
    #[error("Invalid method: {0}")]
    InvalidMethod(String),
    #[error("Invalid property: {0}")]
    InvalidProperty(String),
    #[error("<webview> disabled for surface {0}")]
    FeatureDisabled(SurfaceId),
    #[error("surface {0} not found")]
    SurfaceNotFound(SurfaceId),
    #[error("surface {0} is being destroyed")]
    SurfaceDestroyed(SurfaceId),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl HostError {
    pub(crate) fn backend(err: anyhow::Error) -> Self {
        Self::Backend(format!("{err:#}"))
    }
}
