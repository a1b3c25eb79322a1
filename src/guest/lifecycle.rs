//! Guest creation, attachment, event relays and teardown.
//!
//! Every function here runs on the host loop and takes the shared
//! [`HostState`]. `RefCell` borrows are never held across a hook, a router
//! call or a backend call.

use std::cell::{Cell, Ref, RefCell, RefMut};

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use super::methods::{self, CREATION_CANCELED, DISPATCH_EVENT, VISIBILITY_CHANGE};
use super::{GuestInstance, GuestParams, VisibilityState};
use crate::audit::AuditRecord;
use crate::error::HostError;
use crate::host::HostState;
use crate::ipc::message::{InboundMessage, OutboundMessage};
use crate::surface::preferences::{
    inherit_security_preferences, parse_web_preferences, Preferences,
    GUEST_INHERITED_PREFERENCES,
};
use crate::surface::{CreateSurfaceParams, FrameId, LoadUrlOptions, SurfaceId, SurfaceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateGuestOutcome {
    Created(SurfaceId),
    /// A will-attach listener called `prevent_default`.
    Canceled,
}

impl CreateGuestOutcome {
    /// Value returned to the embedder: the guest id, or `-1`.
    pub fn wire_value(&self) -> Value {
        match self {
            Self::Created(guest) => json!(guest.0),
            Self::Canceled => json!(CREATION_CANCELED),
        }
    }
}

/// Raised on the embedder before a guest is created. Listeners may adjust
/// the preferences or cancel the attachment.
pub struct WillAttachEvent {
    pub embedder: SurfaceId,
    pub params: GuestParams,
    preferences: RefCell<Preferences>,
    prevented: Cell<bool>,
}

impl WillAttachEvent {
    fn new(embedder: SurfaceId, params: GuestParams, preferences: Preferences) -> Self {
        Self {
            embedder,
            params,
            preferences: RefCell::new(preferences),
            prevented: Cell::new(false),
        }
    }

    pub fn preferences(&self) -> Ref<'_, Preferences> {
        self.preferences.borrow()
    }

    pub fn preferences_mut(&self) -> RefMut<'_, Preferences> {
        self.preferences.borrow_mut()
    }

    pub fn prevent_default(&self) {
        self.prevented.set(true);
    }

    pub fn is_prevented(&self) -> bool {
        self.prevented.get()
    }

    fn into_preferences(self) -> Preferences {
        self.preferences.into_inner()
    }
}

/// Effective preferences of a guest: element attributes first, then the
/// `webpreferences` string, then the security keys inherited from the
/// embedder.
pub fn guest_preferences(embedder: &Preferences, params: &GuestParams) -> Preferences {
    let mut prefs = Preferences {
        node_integration: Some(params.node_integration.unwrap_or(false)),
        node_integration_in_sub_frames: Some(params.node_integration_in_sub_frames.unwrap_or(false)),
        plugins: params.plugins,
        zoom_factor: embedder.zoom_factor,
        disable_popups: Some(!params.allow_popups.unwrap_or(false)),
        web_security: Some(!params.disable_web_security.unwrap_or(false)),
        enable_blink_features: params.blink_features.clone(),
        disable_blink_features: params.disable_blink_features.clone(),
        partition: params.partition.clone(),
        ..Preferences::default()
    };
    if let Some(source) = &params.web_preferences {
        prefs = prefs.overlay(&parse_web_preferences(source));
    }
    if let Some(preload) = &params.preload {
        match Url::parse(preload).ok().and_then(|url| url.to_file_path().ok()) {
            Some(path) => prefs.preload = Some(path),
            None => warn!(target = "guest_view", preload = %preload, "ignoring preload that is not a file URL"),
        }
    }
    inherit_security_preferences(&mut prefs, embedder, GUEST_INHERITED_PREFERENCES);
    prefs
}

/// Options of the first navigation of a guest.
pub fn load_options(params: &GuestParams) -> LoadUrlOptions {
    LoadUrlOptions {
        http_referrer: params.http_referrer.clone().filter(|value| !value.is_empty()),
        user_agent: params.user_agent.clone().filter(|value| !value.is_empty()),
    }
}

pub(crate) fn create_guest(
    state: &HostState,
    embedder: SurfaceId,
    embedder_frame: FrameId,
    element_instance_id: i64,
    params: GuestParams,
) -> Result<CreateGuestOutcome, HostError> {
    let embedder_prefs = state.surfaces.borrow().live(embedder)?.preferences.clone();
    let prefs = guest_preferences(&embedder_prefs, &params);
    state.audit.record(|| AuditRecord::WillAttachWebview {
        embedder,
        embedder_frame_id: embedder_frame,
        element_instance_id,
        params: params.clone(),
        web_preferences: prefs.clone(),
    });

    let event = WillAttachEvent::new(embedder, params, prefs);
    state.hooks.emit_will_attach(&event);
    if event.is_prevented() {
        info!(
            target = "guest_view",
            embedder = %embedder,
            element = element_instance_id,
            "guest attachment canceled"
        );
        return Ok(CreateGuestOutcome::Canceled);
    }
    // A hook may have torn the embedder down.
    state.surfaces.borrow().live(embedder)?;
    let params = event.params.clone();
    let prefs = event.into_preferences();

    let guest = state.create_surface(CreateSurfaceParams {
        kind: SurfaceKind::Guest,
        preferences: prefs.clone(),
        embedder: Some(embedder),
        opener: None,
    })?;

    // The slot's previous occupant has to leave its frame before the index
    // points at the new guest.
    let previous = state.guests.borrow().guest_at(embedder, element_instance_id);
    if let Some(previous) = previous {
        debug!(
            target = "guest_view",
            embedder = %embedder,
            element = element_instance_id,
            previous = %previous,
            guest = %guest,
            "replacing guest in occupied slot"
        );
        state.with_backend(|backend| backend.detach_from_outer_frame(previous));
        detach_guest(state, embedder, previous);
    }

    {
        let mut guests = state.guests.borrow_mut();
        guests.record(GuestInstance::new(element_instance_id, embedder, guest, params));
        if guests.watch(embedder) {
            debug!(target = "guest_view", embedder = %embedder, "watching embedder");
        }
    }

    state.with_backend(|backend| {
        backend.add_guest(guest, embedder, &prefs);
        backend.attach_to_iframe(guest, embedder, embedder_frame);
    });
    info!(
        target = "guest_view",
        embedder = %embedder,
        element = element_instance_id,
        guest = %guest,
        "guest created"
    );
    Ok(CreateGuestOutcome::Created(guest))
}

/// Remove the relationship and destroy the guest. Only the recorded embedder
/// may do this; for any other caller it is a no-op returning false.
pub(crate) fn detach_guest(state: &HostState, caller: SurfaceId, guest: SurfaceId) -> bool {
    let Some(instance) = state.guests.borrow_mut().detach(caller, guest) else {
        debug!(target = "guest_view", caller = %caller, guest = %guest, "detach ignored");
        return false;
    };
    state.with_backend(|backend| backend.remove_guest(instance.embedder, guest));
    debug!(
        target = "guest_view",
        embedder = %instance.embedder,
        element = instance.element_instance_id,
        guest = %guest,
        "guest detached"
    );
    state.destroy_surface(guest);
    true
}

/// Attach signal of a guest. Only the first one navigates and notifies.
pub(crate) fn guest_did_attach(state: &HostState, guest: SurfaceId) {
    let Some(params) = state.guests.borrow_mut().mark_attached(guest) else {
        debug!(target = "guest_view", guest = %guest, "ignoring repeated attach");
        return;
    };
    let Some(embedder) = state.guests.borrow().instance(guest).map(|instance| instance.embedder)
    else {
        return;
    };
    if let Ok(surface) = state.surfaces.borrow_mut().get_mut(guest) {
        surface.view_instance_id = params.instance_id;
    }

    if let Some(src) = params.src.as_deref().filter(|src| !src.is_empty()) {
        match Url::parse(src) {
            Ok(url) => {
                let options = load_options(&params);
                state.with_backend(|backend| backend.load_url(guest, &url, &options));
            }
            Err(err) => warn!(target = "guest_view", guest = %guest, src = %src, error = %err, "invalid guest src"),
        }
    }
    state.hooks.emit_did_attach(embedder, guest);
    relay_guest_event(state, guest, "did-attach", &[]);
}

/// The guest's document is ready: replay a visibility recorded earlier.
pub(crate) fn guest_ready(state: &HostState, guest: SurfaceId) {
    let visibility = state
        .guests
        .borrow()
        .instance(guest)
        .and_then(|instance| instance.visibility);
    if let Some(visibility) = visibility {
        send_visibility(state, guest, visibility);
    }
    relay_guest_event(state, guest, "dom-ready", &[]);
}

pub(crate) fn relay_guest_event(state: &HostState, guest: SurfaceId, name: &str, args: &[Value]) {
    let Some(props) = methods::event_props(name, args) else {
        debug!(target = "guest_view", guest = %guest, event = %name, "event not relayed");
        return;
    };
    send_to_embedder(
        state,
        guest,
        DISPATCH_EVENT,
        vec![Value::String(name.to_string()), Value::Object(props)],
    );
}

/// Forward a guest's `sendToHost` message to its embedder.
pub(crate) fn relay_host_message(state: &HostState, message: &InboundMessage) {
    if state.guests.borrow().instance(message.sender).is_none() {
        debug!(
            target = "guest_view",
            surface = %message.sender,
            channel = %message.channel,
            "sendToHost from a surface that is not a guest"
        );
        return;
    }
    let payload = json!({
        "frameId": [message.process_id, message.frame_id],
        "channel": message.channel,
        "args": message.args,
    });
    send_to_embedder(
        state,
        message.sender,
        DISPATCH_EVENT,
        vec![Value::String("ipc-message".into()), payload],
    );
}

fn send_to_embedder(state: &HostState, guest: SurfaceId, channel: &str, args: Vec<Value>) {
    let Some(embedder) = state.guests.borrow().instance(guest).map(|instance| instance.embedder)
    else {
        return;
    };
    let view_instance_id = {
        let surfaces = state.surfaces.borrow();
        if !surfaces.is_live(embedder) {
            return;
        }
        surfaces.get(guest).ok().and_then(|surface| surface.view_instance_id)
    };
    let Some(view_instance_id) = view_instance_id else {
        debug!(target = "guest_view", guest = %guest, channel = %channel, "guest has no view instance yet");
        return;
    };
    let message = OutboundMessage::internal(
        embedder,
        methods::embedder_channel(channel, view_instance_id),
        args,
    );
    state.send(message);
}

fn send_visibility(state: &HostState, guest: SurfaceId, visibility: VisibilityState) {
    if !state.surfaces.borrow().is_live(guest) {
        return;
    }
    state.send(OutboundMessage::internal(
        guest,
        VISIBILITY_CHANGE,
        vec![json!(visibility)],
    ));
}

/// The embedder's window became visible or hidden.
pub(crate) fn embedder_visibility_changed(
    state: &HostState,
    embedder: SurfaceId,
    visibility: VisibilityState,
) {
    let guests = {
        let mut manager = state.guests.borrow_mut();
        if !manager.is_watched(embedder) {
            return;
        }
        manager.apply_visibility(embedder, visibility)
    };
    debug!(
        target = "guest_view",
        embedder = %embedder,
        visibility = ?visibility,
        guests = guests.len(),
        "propagating visibility"
    );
    for guest in guests {
        send_visibility(state, guest, visibility);
    }
}

/// The embedder is going away: force-detach its guests and stop watching it.
pub(crate) fn embedder_will_destroy(state: &HostState, embedder: SurfaceId) {
    if !state.guests.borrow().is_watched(embedder) {
        return;
    }
    let guests = state.guests.borrow().guests_of(embedder);
    for guest in &guests {
        detach_guest(state, embedder, *guest);
    }
    state.guests.borrow_mut().unwatch(embedder);
    info!(
        target = "guest_view",
        embedder = %embedder,
        guests = guests.len(),
        "embedder destroyed, guests detached"
    );
}

/// The guest surface itself is being torn down.
pub(crate) fn guest_destroyed(state: &HostState, guest: SurfaceId) {
    let Some(embedder) = state.guests.borrow().instance(guest).map(|instance| instance.embedder)
    else {
        return;
    };
    relay_guest_event(state, guest, "destroyed", &[]);
    detach_guest(state, embedder, guest);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Sync,
    Async,
}

pub(crate) fn call_guest_method(
    state: &HostState,
    caller: SurfaceId,
    guest: SurfaceId,
    method: &str,
    args: &[Value],
    kind: CallKind,
) -> Result<Value, HostError> {
    state.guests.borrow().guest_for_caller(guest, caller)?;
    let allowed = match kind {
        CallKind::Sync => methods::is_sync_method(method),
        CallKind::Async => methods::is_async_method(method),
    };
    if !allowed {
        return Err(HostError::InvalidMethod(method.to_string()));
    }
    state
        .with_backend(|backend| backend.call_method(guest, method, args))
        .map_err(HostError::backend)
}

pub(crate) fn get_guest_property(
    state: &HostState,
    caller: SurfaceId,
    guest: SurfaceId,
    property: &str,
) -> Result<Value, HostError> {
    state.guests.borrow().guest_for_caller(guest, caller)?;
    if !methods::is_property(property) {
        return Err(HostError::InvalidProperty(property.to_string()));
    }
    state
        .with_backend(|backend| backend.get_property(guest, property))
        .map_err(HostError::backend)
}

pub(crate) fn set_guest_property(
    state: &HostState,
    caller: SurfaceId,
    guest: SurfaceId,
    property: &str,
    value: Value,
) -> Result<(), HostError> {
    state.guests.borrow().guest_for_caller(guest, caller)?;
    if !methods::is_property(property) {
        return Err(HostError::InvalidProperty(property.to_string()));
    }
    state
        .with_backend(|backend| backend.set_property(guest, property, value))
        .map_err(HostError::backend)
}
