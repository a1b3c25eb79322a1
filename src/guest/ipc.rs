//! Internal IPC entry points of the guest-view feature.

use std::rc::{Rc, Weak};

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::error;

use super::lifecycle::{self, CallKind};
use super::methods::{
    CALL, CREATE_AND_ATTACH_GUEST, DETACH_GUEST, FOCUS_CHANGE, PROPERTY_GET, PROPERTY_SET,
};
use super::GuestParams;
use crate::error::HostError;
use crate::host::HostState;
use crate::ipc::router::handle_sync;
use crate::surface::{FrameId, SurfaceId};

/// Register the guest-view channels on the internal scope.
pub(crate) fn register(state: &Rc<HostState>) -> Result<(), HostError> {
    let internal = state.router.internal();

    let weak = Rc::downgrade(state);
    internal.handle(CREATE_AND_ATTACH_GUEST, move |event, args| {
        let weak = weak.clone();
        async move {
            let state = upgrade(&weak)?;
            ensure_enabled(&state, event.sender, CREATE_AND_ATTACH_GUEST)?;
            let frame: u32 = arg(&args, 0, "embedderFrameId")?;
            let element: i64 = arg(&args, 1, "elementInstanceId")?;
            let params: Option<GuestParams> = arg(&args, 2, "params")?;
            let outcome = lifecycle::create_guest(
                &state,
                event.sender,
                FrameId(frame),
                element,
                params.unwrap_or_default(),
            )?;
            Ok::<_, anyhow::Error>(outcome.wire_value())
        }
    })?;

    let weak = Rc::downgrade(state);
    internal.handle(CALL, move |event, args| {
        let weak = weak.clone();
        async move {
            let state = upgrade(&weak)?;
            ensure_enabled(&state, event.sender, CALL)?;
            let guest: SurfaceId = arg(&args, 0, "guestInstanceId")?;
            let method: String = arg(&args, 1, "method")?;
            let call_args: Option<Vec<Value>> = arg(&args, 2, "args")?;
            let value = lifecycle::call_guest_method(
                &state,
                event.sender,
                guest,
                &method,
                &call_args.unwrap_or_default(),
                CallKind::Async,
            )?;
            Ok::<_, anyhow::Error>(value)
        }
    })?;

    let weak = Rc::downgrade(state);
    handle_sync(&internal, DETACH_GUEST, move |event, args| {
        let state = upgrade(&weak)?;
        ensure_enabled(&state, event.sender, DETACH_GUEST)?;
        let guest: SurfaceId = arg(args, 0, "guestInstanceId")?;
        lifecycle::detach_guest(&state, event.sender, guest);
        Ok(Value::Null)
    });

    let weak = Rc::downgrade(state);
    handle_sync(&internal, CALL, move |event, args| {
        let state = upgrade(&weak)?;
        ensure_enabled(&state, event.sender, CALL)?;
        let guest: SurfaceId = arg(args, 0, "guestInstanceId")?;
        let method: String = arg(args, 1, "method")?;
        let call_args: Option<Vec<Value>> = arg(args, 2, "args")?;
        lifecycle::call_guest_method(
            &state,
            event.sender,
            guest,
            &method,
            &call_args.unwrap_or_default(),
            CallKind::Sync,
        )
    });

    let weak = Rc::downgrade(state);
    handle_sync(&internal, PROPERTY_GET, move |event, args| {
        let state = upgrade(&weak)?;
        ensure_enabled(&state, event.sender, PROPERTY_GET)?;
        let guest: SurfaceId = arg(args, 0, "guestInstanceId")?;
        let property: String = arg(args, 1, "property")?;
        lifecycle::get_guest_property(&state, event.sender, guest, &property)
    });

    let weak = Rc::downgrade(state);
    handle_sync(&internal, PROPERTY_SET, move |event, args| {
        let state = upgrade(&weak)?;
        ensure_enabled(&state, event.sender, PROPERTY_SET)?;
        let guest: SurfaceId = arg(args, 0, "guestInstanceId")?;
        let property: String = arg(args, 1, "property")?;
        let value = args.get(2).cloned().unwrap_or(Value::Null);
        lifecycle::set_guest_property(&state, event.sender, guest, &property, value)?;
        Ok(Value::Null)
    });

    // Sent by the embedded element itself, not gated.
    let weak = Rc::downgrade(state);
    internal.on(FOCUS_CHANGE, move |event, args| {
        let Some(state) = weak.upgrade() else {
            return;
        };
        let focused = args.first().and_then(Value::as_bool).unwrap_or(false);
        state.with_backend(|backend| backend.focus_changed(event.sender, focused));
    });

    Ok(())
}

fn upgrade(weak: &Weak<HostState>) -> Result<Rc<HostState>, HostError> {
    weak.upgrade()
        .ok_or_else(|| HostError::backend(anyhow!("host is shutting down")))
}

fn arg<T: DeserializeOwned>(args: &[Value], index: usize, name: &str) -> Result<T, HostError> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|err| HostError::InvalidArgument(format!("{name}: {err}")))
}

/// Reject callers whose preferences do not enable the embedding feature.
/// The answer is cached per surface.
fn ensure_enabled(state: &HostState, sender: SurfaceId, channel: &str) -> Result<(), HostError> {
    let enabled = {
        let surfaces = state.surfaces.borrow();
        state.guests.borrow_mut().webview_enabled(sender, || {
            surfaces
                .get(sender)
                .map(|surface| surface.preferences.webview_tag_enabled())
                .unwrap_or(false)
        })
    };
    if enabled {
        return Ok(());
    }
    error!(
        target = "guest_view",
        surface = %sender,
        channel = %channel,
        "<webview> IPC message sent by surface with <webview> disabled"
    );
    Err(HostError::FeatureDisabled(sender))
}
