// Library exports for the host binary and tests

pub mod audit;
pub mod config;
pub mod error;
pub mod guest;
pub mod host;
pub mod ipc;
pub mod surface;
pub mod window_open;

pub use config::HostConfig;
pub use error::HostError;
pub use host::{Host, HostEvent, SignalOutcome, SurfaceSignal};
pub use surface::{HeadlessBackend, SurfaceBackend, SurfaceId};
