//! Composition root: owns every registry, dispatches backend signals and
//! inbound messages, and runs the single-threaded event loop.

use std::any::type_name;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use futures_util::future::{FutureExt, LocalBoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::audit::{Audit, AuditRecord};
use crate::config::HostConfig;
use crate::error::HostError;
use crate::guest::lifecycle::{self, WillAttachEvent};
use crate::guest::{self, GuestInstance, GuestViewManager};
use crate::ipc::message::{InboundMessage, MessageKind, OutboundMessage, Reply};
use crate::ipc::router::MessageRouter;
use crate::surface::preferences::Preferences;
use crate::surface::visibility::VisibilityTracker;
use crate::surface::{
    CreateSurfaceParams, FrameId, FrameRef, LifecycleState, Surface, SurfaceBackend, SurfaceId,
    SurfaceKind, SurfaceRegistry,
};
use crate::window_open::{self, ChildWindow, HandlerDetails, WindowOpenNegotiator, WindowOpenRequest};

/// Lifecycle signals reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "kebab-case")]
pub enum SurfaceSignal {
    /// The document is ready (`dom-ready`).
    Ready { surface: SurfaceId },
    DidAttach { surface: SurfaceId },
    NavigationStarted { surface: SurfaceId, url: String },
    FrameCreated { surface: SurfaceId, frame: FrameId },
    FrameDeleted { surface: SurfaceId, frame: FrameId },
    /// The surface's window was shown, hidden, minimized or restored.
    WindowState {
        surface: SurfaceId,
        visible: bool,
        minimized: bool,
    },
    /// A catalogued event raised by a guest.
    GuestEvent {
        surface: SurfaceId,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    WillDestroy { surface: SurfaceId },
    Destroyed { surface: SurfaceId },
    WillAddNewContents(WindowOpenRequest),
    AddNewContents(WindowOpenRequest),
    NewWindow(WindowOpenRequest),
}

impl SurfaceSignal {
    pub fn surface(&self) -> SurfaceId {
        match self {
            Self::Ready { surface }
            | Self::DidAttach { surface }
            | Self::NavigationStarted { surface, .. }
            | Self::FrameCreated { surface, .. }
            | Self::FrameDeleted { surface, .. }
            | Self::WindowState { surface, .. }
            | Self::GuestEvent { surface, .. }
            | Self::WillDestroy { surface }
            | Self::Destroyed { surface } => *surface,
            Self::WillAddNewContents(request)
            | Self::AddNewContents(request)
            | Self::NewWindow(request) => request.opener,
        }
    }
}

/// One line of input to the host loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum HostEvent {
    Message(InboundMessage),
    Signal(SurfaceSignal),
}

/// Result of handling a signal. `prevented` means its default action did
/// not happen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalOutcome {
    pub prevented: bool,
    pub created: Option<SurfaceId>,
}

impl SignalOutcome {
    pub fn prevented() -> Self {
        Self {
            prevented: true,
            created: None,
        }
    }

    pub fn created(surface: SurfaceId) -> Self {
        Self {
            prevented: false,
            created: Some(surface),
        }
    }
}

type WillAttachHook = Rc<dyn Fn(&WillAttachEvent)>;
type DidAttachHook = Rc<dyn Fn(SurfaceId, SurfaceId)>;
type DidCreateWindowHook = Rc<dyn Fn(SurfaceId, &HandlerDetails)>;

/// Application listeners. Emission iterates a snapshot so a hook may
/// register further hooks.
#[derive(Default)]
pub(crate) struct HostHooks {
    will_attach: RefCell<Vec<WillAttachHook>>,
    did_attach: RefCell<Vec<DidAttachHook>>,
    did_create_window: RefCell<Vec<DidCreateWindowHook>>,
}

impl HostHooks {
    pub(crate) fn emit_will_attach(&self, event: &WillAttachEvent) {
        let hooks = self.will_attach.borrow().clone();
        for hook in hooks {
            hook(event);
        }
    }

    pub(crate) fn emit_did_attach(&self, embedder: SurfaceId, guest: SurfaceId) {
        let hooks = self.did_attach.borrow().clone();
        for hook in hooks {
            hook(embedder, guest);
        }
    }

    pub(crate) fn emit_did_create_window(&self, child: SurfaceId, details: &HandlerDetails) {
        let hooks = self.did_create_window.borrow().clone();
        for hook in hooks {
            hook(child, details);
        }
    }
}

pub(crate) struct HostState {
    pub(crate) config: HostConfig,
    pub(crate) surfaces: RefCell<SurfaceRegistry>,
    backend: RefCell<Box<dyn SurfaceBackend>>,
    pub(crate) router: MessageRouter,
    pub(crate) guests: RefCell<GuestViewManager>,
    pub(crate) windows: RefCell<WindowOpenNegotiator>,
    pub(crate) visibility: RefCell<VisibilityTracker>,
    pub(crate) hooks: HostHooks,
    pub(crate) audit: Audit,
}

impl HostState {
    pub(crate) fn with_backend<R>(&self, f: impl FnOnce(&mut dyn SurfaceBackend) -> R) -> R {
        let mut backend = self.backend.borrow_mut();
        f(backend.as_mut())
    }

    pub(crate) fn send(&self, message: OutboundMessage) {
        self.with_backend(|backend| backend.send(message));
    }

    fn deliver(&self, replies: Vec<OutboundMessage>) {
        for message in replies {
            self.send(message);
        }
    }

    pub(crate) fn create_surface(&self, params: CreateSurfaceParams) -> Result<SurfaceId, HostError> {
        let id = self.surfaces.borrow_mut().reserve_id();
        let process_id = self
            .with_backend(|backend| backend.create_surface(id, &params))
            .map_err(HostError::backend)?;
        let kind = params.kind;
        if kind == SurfaceKind::TopLevel {
            self.audit.record(|| AuditRecord::SurfaceCreated {
                surface: id,
                kind,
                web_preferences: params.preferences.clone(),
            });
        }
        self.surfaces.borrow_mut().insert(Surface {
            id,
            process_id,
            frames: BTreeSet::new(),
            kind,
            preferences: params.preferences,
            embedder: params.embedder,
            opener: params.opener,
            view_instance_id: None,
            state: LifecycleState::Live,
        });
        info!(target = "host", surface = %id, kind = ?kind, "surface created");
        Ok(id)
    }

    /// Flip the surface to `Destroying` and tear down the guests it embeds.
    fn begin_destroy(&self, id: SurfaceId) -> bool {
        if !self.surfaces.borrow_mut().begin_destroy(id) {
            return false;
        }
        lifecycle::embedder_will_destroy(self, id);
        true
    }

    pub(crate) fn destroy_surface(&self, id: SurfaceId) {
        if !self.begin_destroy(id) {
            return;
        }
        self.with_backend(|backend| backend.destroy_surface(id));
        self.finish_destroy(id);
    }

    fn finish_destroy(&self, id: SurfaceId) {
        lifecycle::guest_destroyed(self, id);
        let closing = self.windows.borrow_mut().forget_surface(id);
        for child in closing {
            self.destroy_surface(child);
        }
        let frames = self
            .surfaces
            .borrow()
            .get(id)
            .map(Surface::frame_refs)
            .unwrap_or_default();
        self.router.forget_surface(id, &frames);
        self.visibility.borrow_mut().forget(id);
        self.guests.borrow_mut().forget_surface(id);
        self.surfaces.borrow_mut().remove(id);
        info!(target = "host", surface = %id, "surface destroyed");
    }
}

pub struct Host {
    state: Rc<HostState>,
}

impl Host {
    pub fn new(config: HostConfig, backend: impl SurfaceBackend + 'static) -> Result<Self, HostError> {
        let audit = Audit::from_config(&config);
        let state = Rc::new(HostState {
            config,
            surfaces: RefCell::new(SurfaceRegistry::new()),
            backend: RefCell::new(Box::new(backend)),
            router: MessageRouter::with_audit(audit.clone()),
            guests: RefCell::new(GuestViewManager::new()),
            windows: RefCell::new(WindowOpenNegotiator::default()),
            visibility: RefCell::new(VisibilityTracker::default()),
            hooks: HostHooks::default(),
            audit,
        });
        guest::ipc::register(&state)?;
        Ok(Self { state })
    }

    pub fn config(&self) -> &HostConfig {
        &self.state.config
    }

    pub fn router(&self) -> &MessageRouter {
        &self.state.router
    }

    pub fn create_surface(
        &self,
        kind: SurfaceKind,
        preferences: Preferences,
    ) -> Result<SurfaceId, HostError> {
        self.state.create_surface(CreateSurfaceParams {
            kind,
            preferences,
            embedder: None,
            opener: None,
        })
    }

    pub fn destroy_surface(&self, id: SurfaceId) {
        self.state.destroy_surface(id);
    }

    pub fn surface(&self, id: SurfaceId) -> Option<Surface> {
        self.state.surfaces.borrow().get(id).ok().cloned()
    }

    pub fn surface_ids(&self) -> Vec<SurfaceId> {
        self.state.surfaces.borrow().ids()
    }

    pub fn set_window_open_handler<F>(&self, surface: SurfaceId, handler: F)
    where
        F: Fn(&HandlerDetails) -> Value + 'static,
    {
        self.state.audit.record(|| AuditRecord::WindowOpenHandlerSet {
            surface,
            handler: type_name::<F>().to_string(),
        });
        self.state
            .windows
            .borrow_mut()
            .set_handler(surface, Some(Rc::new(handler)));
    }

    pub fn clear_window_open_handler(&self, surface: SurfaceId) {
        self.state.windows.borrow_mut().set_handler(surface, None);
    }

    /// Called before a guest is created; may edit its preferences or cancel.
    pub fn on_will_attach<F>(&self, hook: F)
    where
        F: Fn(&WillAttachEvent) + 'static,
    {
        self.state.hooks.will_attach.borrow_mut().push(Rc::new(hook));
    }

    /// Called with `(embedder, guest)` on a guest's first attach.
    pub fn on_did_attach<F>(&self, hook: F)
    where
        F: Fn(SurfaceId, SurfaceId) + 'static,
    {
        self.state.hooks.did_attach.borrow_mut().push(Rc::new(hook));
    }

    pub fn on_did_create_window<F>(&self, hook: F)
    where
        F: Fn(SurfaceId, &HandlerDetails) + 'static,
    {
        self.state
            .hooks
            .did_create_window
            .borrow_mut()
            .push(Rc::new(hook));
    }

    pub fn guest(&self, guest: SurfaceId) -> Option<GuestInstance> {
        self.state.guests.borrow().instance(guest).cloned()
    }

    pub fn guests_of(&self, embedder: SurfaceId) -> Vec<SurfaceId> {
        self.state.guests.borrow().guests_of(embedder)
    }

    pub fn guest_at(&self, embedder: SurfaceId, element_instance_id: i64) -> Option<SurfaceId> {
        self.state.guests.borrow().guest_at(embedder, element_instance_id)
    }

    pub fn is_watched(&self, embedder: SurfaceId) -> bool {
        self.state.guests.borrow().is_watched(embedder)
    }

    pub fn window_child(&self, child: SurfaceId) -> Option<ChildWindow> {
        self.state.windows.borrow().child(child)
    }

    pub fn has_pending_window(&self, opener: SurfaceId) -> bool {
        self.state.windows.borrow().has_pending(opener)
    }

    pub fn handle_signal(&self, signal: SurfaceSignal) -> SignalOutcome {
        let state = &*self.state;
        let surface = signal.surface();
        let destroyed = matches!(signal, SurfaceSignal::Destroyed { .. });
        if !destroyed && !state.surfaces.borrow().is_live(surface) {
            debug!(target = "host", surface = %surface, "dropping signal for surface that is not live");
            return SignalOutcome::prevented();
        }

        match signal {
            SurfaceSignal::Ready { surface } => lifecycle::guest_ready(state, surface),
            SurfaceSignal::DidAttach { surface } => lifecycle::guest_did_attach(state, surface),
            SurfaceSignal::NavigationStarted { surface, url } => {
                debug!(target = "host", surface = %surface, url = %url, "navigation started");
            }
            SurfaceSignal::FrameCreated { surface, frame } => {
                if let Ok(entry) = state.surfaces.borrow_mut().get_mut(surface) {
                    entry.frames.insert(frame);
                }
            }
            SurfaceSignal::FrameDeleted { surface, frame } => {
                let process_id = {
                    let mut surfaces = state.surfaces.borrow_mut();
                    let Ok(entry) = surfaces.get_mut(surface) else {
                        return SignalOutcome::default();
                    };
                    entry.frames.remove(&frame);
                    entry.process_id
                };
                state.router.forget_frame(FrameRef::new(process_id, frame));
            }
            SurfaceSignal::WindowState {
                surface,
                visible,
                minimized,
            } => {
                let change = state.visibility.borrow_mut().update(surface, visible, minimized);
                if let Some(visibility) = change {
                    lifecycle::embedder_visibility_changed(state, surface, visibility);
                }
            }
            SurfaceSignal::GuestEvent { surface, name, args } => {
                lifecycle::relay_guest_event(state, surface, &name, &args);
            }
            SurfaceSignal::WillDestroy { surface } => {
                state.begin_destroy(surface);
            }
            SurfaceSignal::Destroyed { surface } => {
                state.begin_destroy(surface);
                if state.surfaces.borrow().get(surface).is_ok() {
                    state.finish_destroy(surface);
                }
            }
            SurfaceSignal::WillAddNewContents(request) => {
                return window_open::will_add_new_contents(state, &request);
            }
            SurfaceSignal::AddNewContents(request) => {
                return window_open::add_new_contents(state, &request);
            }
            SurfaceSignal::NewWindow(request) => return window_open::new_window(state, &request),
        }
        SignalOutcome::default()
    }

    /// Route one inbound message. Invoke calls return the future that
    /// produces and sends their reply; everything else completes inline.
    pub fn handle_message(&self, message: InboundMessage) -> Option<LocalBoxFuture<'static, ()>> {
        let state = &self.state;
        let sender = message.sender;
        if !state.surfaces.borrow().is_live(sender) {
            debug!(
                target = "ipc",
                surface = %sender,
                channel = %message.channel,
                "dropping message from surface that is not live"
            );
            return None;
        }

        match &message.kind {
            MessageKind::Send => {
                let delivery = state.router.send(&message);
                state.deliver(delivery.replies);
            }
            MessageKind::SendSync { request_id } => {
                let delivery = state.router.send_sync(&message);
                state.deliver(delivery.replies);
                let request_id = *request_id;
                state.with_backend(|backend| {
                    backend.reply(sender, request_id, Reply::Sync(delivery.value))
                });
            }
            MessageKind::Ports { ports } => {
                let delivery = state.router.post_ports(&message, ports);
                state.deliver(delivery.replies);
            }
            MessageKind::SendToHost => lifecycle::relay_host_message(state, &message),
            MessageKind::Invoke { request_id } => {
                let request_id = *request_id;
                let pending = state.router.invoke(&message, request_id)?;
                let weak = Rc::downgrade(state);
                return Some(
                    async move {
                        let reply = pending.await;
                        let Some(state) = weak.upgrade() else {
                            return;
                        };
                        if !state.surfaces.borrow().is_live(sender) {
                            debug!(target = "ipc", surface = %sender, request_id, "caller gone before reply");
                            return;
                        }
                        state.with_backend(|backend| {
                            backend.reply(sender, request_id, Reply::Invoke(reply))
                        });
                    }
                    .boxed_local(),
                );
            }
        }
        None
    }

    /// Consume events until the channel closes. Must run inside a
    /// [`tokio::task::LocalSet`]; invoke calls are spawned onto it.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<HostEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                HostEvent::Message(message) => {
                    if let Some(task) = self.handle_message(message) {
                        tokio::task::spawn_local(task);
                    }
                }
                HostEvent::Signal(signal) => {
                    self.handle_signal(signal);
                }
            }
        }
        debug!(target = "host", "event channel closed");
    }

    /// Destroy every remaining surface.
    pub fn shutdown(&self) {
        let ids = self.state.surfaces.borrow().ids();
        for id in ids {
            self.state.destroy_surface(id);
        }
        info!(target = "host", "host shut down");
    }
}
