//! In-memory surface backend. Records every call so the host can run without
//! real renderer processes, and optionally forwards outbound traffic to a
//! channel (the host binary writes it to stdout).

use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use super::backend::{CreateSurfaceParams, LoadUrlOptions, SurfaceBackend};
use super::preferences::Preferences;
use super::{FrameId, ProcessId, SurfaceId};
use crate::ipc::message::{OutboundMessage, Reply, RequestId};

const FIRST_PROCESS_ID: u32 = 100;

/// Outbound traffic as seen by the far side of the bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Message(OutboundMessage),
    Reply {
        target: SurfaceId,
        request_id: RequestId,
        reply: Reply,
    },
    Navigate {
        surface: SurfaceId,
        url: Url,
        options: LoadUrlOptions,
    },
    Destroy {
        surface: SurfaceId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub surface: SurfaceId,
    pub method: String,
    pub args: Vec<Value>,
}

#[derive(Default)]
pub struct HeadlessLog {
    pub created: Vec<(SurfaceId, CreateSurfaceParams)>,
    pub destroyed: Vec<SurfaceId>,
    pub sent: Vec<OutboundMessage>,
    pub replies: Vec<(SurfaceId, RequestId, Reply)>,
    pub loads: Vec<(SurfaceId, Url, LoadUrlOptions)>,
    pub iframe_attachments: Vec<(SurfaceId, SurfaceId, FrameId)>,
    pub detached_from_outer: Vec<SurfaceId>,
    pub guests_added: Vec<(SurfaceId, SurfaceId)>,
    pub guests_removed: Vec<(SurfaceId, SurfaceId)>,
    pub next_child_preferences: HashMap<SurfaceId, Preferences>,
    pub calls: Vec<MethodCall>,
    pub properties: HashMap<(SurfaceId, String), Value>,
    pub focus: HashMap<SurfaceId, bool>,
    next_process: u32,
}

impl HeadlessLog {
    pub fn sent_on(&self, channel: &str) -> Vec<&OutboundMessage> {
        self.sent
            .iter()
            .filter(|message| message.channel == channel)
            .collect()
    }

    pub fn loads_for(&self, surface: SurfaceId) -> usize {
        self.loads.iter().filter(|(id, _, _)| *id == surface).count()
    }

    pub fn reply_to(&self, surface: SurfaceId, request_id: RequestId) -> Option<&Reply> {
        self.replies
            .iter()
            .find(|(target, id, _)| *target == surface && *id == request_id)
            .map(|(_, _, reply)| reply)
    }
}

/// Cloning yields another handle onto the same log.
#[derive(Clone, Default)]
pub struct HeadlessBackend {
    log: Rc<RefCell<HeadlessLog>>,
    outbox: Option<mpsc::UnboundedSender<OutboundFrame>>,
    fail_creation: Rc<Cell<bool>>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outbox(mut self, outbox: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn log(&self) -> Ref<'_, HeadlessLog> {
        self.log.borrow()
    }

    /// Make subsequent `create_surface` calls fail, as when a renderer cannot
    /// be spawned.
    pub fn fail_creation(&self, fail: bool) {
        self.fail_creation.set(fail);
    }

    fn forward(&self, frame: OutboundFrame) {
        if let Some(outbox) = &self.outbox {
            let _ = outbox.send(frame);
        }
    }
}

impl SurfaceBackend for HeadlessBackend {
    fn create_surface(
        &mut self,
        id: SurfaceId,
        params: &CreateSurfaceParams,
    ) -> anyhow::Result<ProcessId> {
        if self.fail_creation.get() {
            return Err(anyhow!("renderer process for surface {id} failed to launch"));
        }
        let mut log = self.log.borrow_mut();
        let process = ProcessId(FIRST_PROCESS_ID + log.next_process);
        log.next_process += 1;
        log.created.push((id, params.clone()));
        Ok(process)
    }

    fn destroy_surface(&mut self, id: SurfaceId) {
        self.log.borrow_mut().destroyed.push(id);
        self.forward(OutboundFrame::Destroy { surface: id });
    }

    fn send(&mut self, message: OutboundMessage) {
        self.log.borrow_mut().sent.push(message.clone());
        self.forward(OutboundFrame::Message(message));
    }

    fn reply(&mut self, target: SurfaceId, request_id: RequestId, reply: Reply) {
        self.log
            .borrow_mut()
            .replies
            .push((target, request_id, reply.clone()));
        self.forward(OutboundFrame::Reply {
            target,
            request_id,
            reply,
        });
    }

    fn load_url(&mut self, id: SurfaceId, url: &Url, options: &LoadUrlOptions) {
        self.log
            .borrow_mut()
            .loads
            .push((id, url.clone(), options.clone()));
        self.forward(OutboundFrame::Navigate {
            surface: id,
            url: url.clone(),
            options: options.clone(),
        });
    }

    fn attach_to_iframe(&mut self, guest: SurfaceId, embedder: SurfaceId, frame: FrameId) {
        self.log
            .borrow_mut()
            .iframe_attachments
            .push((guest, embedder, frame));
    }

    fn detach_from_outer_frame(&mut self, guest: SurfaceId) {
        self.log.borrow_mut().detached_from_outer.push(guest);
    }

    fn add_guest(&mut self, guest: SurfaceId, embedder: SurfaceId, _preferences: &Preferences) {
        self.log.borrow_mut().guests_added.push((guest, embedder));
    }

    fn remove_guest(&mut self, embedder: SurfaceId, guest: SurfaceId) {
        self.log.borrow_mut().guests_removed.push((guest, embedder));
    }

    fn set_next_child_preferences(&mut self, opener: SurfaceId, preferences: &Preferences) {
        self.log
            .borrow_mut()
            .next_child_preferences
            .insert(opener, preferences.clone());
    }

    fn call_method(
        &mut self,
        id: SurfaceId,
        method: &str,
        args: &[Value],
    ) -> anyhow::Result<Value> {
        let mut log = self.log.borrow_mut();
        log.calls.push(MethodCall {
            surface: id,
            method: method.to_string(),
            args: args.to_vec(),
        });
        let value = match method {
            "getURL" => log
                .loads
                .iter()
                .rev()
                .find(|(surface, _, _)| *surface == id)
                .map(|(_, url, _)| Value::String(url.to_string()))
                .unwrap_or_else(|| Value::String(String::new())),
            _ => Value::Null,
        };
        Ok(value)
    }

    fn get_property(&mut self, id: SurfaceId, property: &str) -> anyhow::Result<Value> {
        Ok(self
            .log
            .borrow()
            .properties
            .get(&(id, property.to_string()))
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn set_property(&mut self, id: SurfaceId, property: &str, value: Value) -> anyhow::Result<()> {
        self.log
            .borrow_mut()
            .properties
            .insert((id, property.to_string()), value);
        Ok(())
    }

    fn focus_changed(&mut self, id: SurfaceId, focused: bool) {
        self.log.borrow_mut().focus.insert(id, focused);
    }
}
