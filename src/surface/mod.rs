//! Arena of rendering surfaces addressed by stable, never-reused identifiers.
//!
//! Relationships between surfaces (embedder, opener) are stored as ids, so a
//! stale reference fails a lookup instead of dangling.

pub mod backend;
pub mod headless;
pub mod preferences;
pub mod visibility;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HostError;
use preferences::Preferences;

pub use backend::{CreateSurfaceParams, LoadUrlOptions, SurfaceBackend};
pub use headless::{HeadlessBackend, OutboundFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(pub u32);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u32);

/// Process-qualified frame coordinates; frame ids are only unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRef {
    pub process_id: ProcessId,
    pub frame_id: FrameId,
}

impl FrameRef {
    pub fn new(process_id: ProcessId, frame_id: FrameId) -> Self {
        Self {
            process_id,
            frame_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SurfaceKind {
    TopLevel,
    Guest,
    Offscreen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Live,
    Destroying,
}

#[derive(Debug, Clone)]
pub struct Surface {
    pub id: SurfaceId,
    pub process_id: ProcessId,
    pub frames: BTreeSet<FrameId>,
    pub kind: SurfaceKind,
    pub preferences: Preferences,
    pub embedder: Option<SurfaceId>,
    pub opener: Option<SurfaceId>,
    /// Assigned on the first attach of a guest.
    pub view_instance_id: Option<i64>,
    pub state: LifecycleState,
}

impl Surface {
    pub fn is_live(&self) -> bool {
        self.state == LifecycleState::Live
    }

    pub fn frame_refs(&self) -> Vec<FrameRef> {
        self.frames
            .iter()
            .map(|frame_id| FrameRef::new(self.process_id, *frame_id))
            .collect()
    }
}

pub struct SurfaceRegistry {
    surfaces: HashMap<SurfaceId, Surface>,
    next_id: u32,
}

impl Default for SurfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self {
            surfaces: HashMap::new(),
            next_id: 1,
        }
    }

    /// Reserve the next identifier. Identifiers increase monotonically and are
    /// never handed out twice, even after the surface is gone.
    pub fn reserve_id(&mut self) -> SurfaceId {
        let id = SurfaceId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, surface: Surface) {
        self.surfaces.insert(surface.id, surface);
    }

    pub fn get(&self, id: SurfaceId) -> Result<&Surface, HostError> {
        self.surfaces.get(&id).ok_or(HostError::SurfaceNotFound(id))
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> Result<&mut Surface, HostError> {
        self.surfaces
            .get_mut(&id)
            .ok_or(HostError::SurfaceNotFound(id))
    }

    /// Like [`get`](Self::get) but also rejects surfaces whose destruction began.
    pub fn live(&self, id: SurfaceId) -> Result<&Surface, HostError> {
        let surface = self.get(id)?;
        if surface.is_live() {
            Ok(surface)
        } else {
            Err(HostError::SurfaceDestroyed(id))
        }
    }

    pub fn is_live(&self, id: SurfaceId) -> bool {
        self.live(id).is_ok()
    }

    /// Flip a live surface into `Destroying`. Returns false when it is unknown
    /// or already on its way out.
    pub fn begin_destroy(&mut self, id: SurfaceId) -> bool {
        match self.surfaces.get_mut(&id) {
            Some(surface) if surface.is_live() => {
                surface.state = LifecycleState::Destroying;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, id: SurfaceId) -> Option<Surface> {
        self.surfaces.remove(&id)
    }

    pub fn ids(&self) -> Vec<SurfaceId> {
        let mut ids: Vec<_> = self.surfaces.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}
