//! Embedder/guest relationship graph.
//!
//! [`GuestViewManager`] holds plain state: the live guest instances, the
//! embedder-element index and the set of watched embedders. The operations
//! that also touch surfaces and the backend live in [`lifecycle`].

pub mod ipc;
pub mod lifecycle;
pub mod methods;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::HostError;
use crate::surface::SurfaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityState {
    Visible,
    Hidden,
}

/// Attributes of the embedding element, as sent by the embedder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestParams {
    #[serde(rename = "instanceId")]
    pub instance_id: Option<i64>,
    pub src: Option<String>,
    #[serde(rename = "httpreferrer")]
    pub http_referrer: Option<String>,
    #[serde(rename = "useragent")]
    pub user_agent: Option<String>,
    #[serde(rename = "nodeintegration")]
    pub node_integration: Option<bool>,
    #[serde(rename = "nodeintegrationinsubframes")]
    pub node_integration_in_sub_frames: Option<bool>,
    pub plugins: Option<bool>,
    #[serde(rename = "allowpopups")]
    pub allow_popups: Option<bool>,
    #[serde(rename = "disablewebsecurity")]
    pub disable_web_security: Option<bool>,
    #[serde(rename = "blinkfeatures")]
    pub blink_features: Option<String>,
    #[serde(rename = "disableblinkfeatures")]
    pub disable_blink_features: Option<String>,
    pub partition: Option<String>,
    /// `file:` URL of the preload script.
    pub preload: Option<String>,
    /// Comma separated `key=value` preference overrides.
    #[serde(rename = "webpreferences")]
    pub web_preferences: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementKey {
    pub embedder: SurfaceId,
    pub element_instance_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuestInstance {
    pub element_instance_id: i64,
    /// Back-reference only; the embedder is never owned.
    pub embedder: SurfaceId,
    /// Owned: removing the instance destroys this surface.
    pub guest: SurfaceId,
    pub visibility: Option<VisibilityState>,
    pub params: GuestParams,
    attached: bool,
}

impl GuestInstance {
    pub fn new(
        element_instance_id: i64,
        embedder: SurfaceId,
        guest: SurfaceId,
        params: GuestParams,
    ) -> Self {
        Self {
            element_instance_id,
            embedder,
            guest,
            visibility: None,
            params,
            attached: false,
        }
    }

    pub fn key(&self) -> ElementKey {
        ElementKey {
            embedder: self.embedder,
            element_instance_id: self.element_instance_id,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

#[derive(Default)]
pub struct GuestViewManager {
    instances: HashMap<SurfaceId, GuestInstance>,
    embedder_elements: HashMap<ElementKey, SurfaceId>,
    watched: HashSet<SurfaceId>,
    webview_enabled: HashMap<SurfaceId, bool>,
}

impl GuestViewManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance(&self, guest: SurfaceId) -> Option<&GuestInstance> {
        self.instances.get(&guest)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Current occupant of an embedder's element slot.
    pub fn guest_at(&self, embedder: SurfaceId, element_instance_id: i64) -> Option<SurfaceId> {
        self.embedder_elements
            .get(&ElementKey {
                embedder,
                element_instance_id,
            })
            .copied()
    }

    /// Record a new instance and point its element slot at it. Any previous
    /// occupant must already have been detached.
    pub fn record(&mut self, instance: GuestInstance) {
        self.embedder_elements.insert(instance.key(), instance.guest);
        self.instances.insert(instance.guest, instance);
    }

    /// Remove `guest` on behalf of `caller`. Only the embedder of record may
    /// detach; anyone else gets `None` and nothing changes.
    pub fn detach(&mut self, caller: SurfaceId, guest: SurfaceId) -> Option<GuestInstance> {
        match self.instances.get(&guest) {
            Some(instance) if instance.embedder == caller => {}
            _ => return None,
        }
        let instance = self.instances.remove(&guest)?;
        let key = instance.key();
        if self.embedder_elements.get(&key) == Some(&guest) {
            self.embedder_elements.remove(&key);
        }
        Some(instance)
    }

    pub fn guests_of(&self, embedder: SurfaceId) -> Vec<SurfaceId> {
        let mut guests: Vec<_> = self
            .instances
            .values()
            .filter(|instance| instance.embedder == embedder)
            .map(|instance| instance.guest)
            .collect();
        guests.sort();
        guests
    }

    /// Returns true when the embedder was not watched before.
    pub fn watch(&mut self, embedder: SurfaceId) -> bool {
        self.watched.insert(embedder)
    }

    pub fn unwatch(&mut self, embedder: SurfaceId) -> bool {
        self.watched.remove(&embedder)
    }

    pub fn is_watched(&self, embedder: SurfaceId) -> bool {
        self.watched.contains(&embedder)
    }

    /// Store `state` on every guest of `embedder` and return those guests.
    pub fn apply_visibility(
        &mut self,
        embedder: SurfaceId,
        state: VisibilityState,
    ) -> Vec<SurfaceId> {
        let mut updated: Vec<_> = self
            .instances
            .values_mut()
            .filter(|instance| instance.embedder == embedder)
            .map(|instance| {
                instance.visibility = Some(state);
                instance.guest
            })
            .collect();
        updated.sort();
        updated
    }

    /// Mark the guest attached. Returns its params only the first time.
    pub fn mark_attached(&mut self, guest: SurfaceId) -> Option<GuestParams> {
        let instance = self.instances.get_mut(&guest)?;
        if instance.attached {
            return None;
        }
        instance.attached = true;
        Some(instance.params.clone())
    }

    /// Look up a guest for a remote call, checking that `caller` hosts it.
    pub fn guest_for_caller(
        &self,
        guest: SurfaceId,
        caller: SurfaceId,
    ) -> Result<&GuestInstance, HostError> {
        let instance = self
            .instances
            .get(&guest)
            .ok_or(HostError::InvalidGuestInstance(guest))?;
        if instance.embedder != caller {
            return Err(HostError::AccessDenied(guest));
        }
        Ok(instance)
    }

    /// Cached answer to "does this surface have the embedding feature".
    pub fn webview_enabled(&mut self, surface: SurfaceId, compute: impl FnOnce() -> bool) -> bool {
        *self.webview_enabled.entry(surface).or_insert_with(compute)
    }

    pub fn forget_surface(&mut self, surface: SurfaceId) {
        self.webview_enabled.remove(&surface);
    }
}
