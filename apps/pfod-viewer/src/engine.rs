//! Async driver around [`SyncCore`].
//!
//! One task owns the core. It sends at most one command at a time through the
//! transport, sleeps until the refresh deadline, and applies control commands
//! from [`EngineHandle`]s between those events.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use pfod_transport::{CommandTransport, TransportResult};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn, Instrument};

use crate::error::SyncError;
use crate::model::DrawingItem;
use crate::protocol::TouchCommand;
use crate::sync::{Dispatch, RequestId, SyncCore};
use crate::telemetry::{self, Timing};
use crate::view::{ViewEffect, ViewSink};

type Reply = BoxFuture<'static, (RequestId, TransportResult<String>)>;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Connect,
    OpenDrawing(String),
    Enqueue {
        tag: String,
        target: Option<String>,
        command: String,
    },
    Touch(TouchCommand),
    /// Local feedback drawn over the current drawing for a pressed zone.
    TouchAction(Vec<DrawingItem>),
    GestureStart,
    GestureEnd,
    Overlay(bool),
    PauseUpdates,
    ResumeUpdates,
    Back,
    Reload,
    RemoveSubDrawing(String),
    Shutdown,
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    pub fn send(&self, command: EngineCommand) -> Result<(), SyncError> {
        self.tx.send(command).map_err(|_| SyncError::EngineClosed)
    }

    pub fn connect(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::Connect)
    }

    pub fn open_drawing(&self, name: impl Into<String>) -> Result<(), SyncError> {
        self.send(EngineCommand::OpenDrawing(name.into()))
    }

    pub fn enqueue(
        &self,
        tag: impl Into<String>,
        target: Option<&str>,
        command: impl Into<String>,
    ) -> Result<(), SyncError> {
        self.send(EngineCommand::Enqueue {
            tag: tag.into(),
            target: target.map(str::to_string),
            command: command.into(),
        })
    }

    pub fn touch(&self, touch: TouchCommand) -> Result<(), SyncError> {
        self.send(EngineCommand::Touch(touch))
    }

    pub fn show_touch_action(&self, items: Vec<DrawingItem>) -> Result<(), SyncError> {
        self.send(EngineCommand::TouchAction(items))
    }

    pub fn gesture_start(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::GestureStart)
    }

    pub fn gesture_end(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::GestureEnd)
    }

    pub fn set_overlay_open(&self, open: bool) -> Result<(), SyncError> {
        self.send(EngineCommand::Overlay(open))
    }

    pub fn pause_updates(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::PauseUpdates)
    }

    pub fn resume_updates(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::ResumeUpdates)
    }

    pub fn back(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::Back)
    }

    pub fn reload(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::Reload)
    }

    pub fn remove_sub_drawing(&self, name: impl Into<String>) -> Result<(), SyncError> {
        self.send(EngineCommand::RemoveSubDrawing(name.into()))
    }

    pub fn shutdown(&self) -> Result<(), SyncError> {
        self.send(EngineCommand::Shutdown)
    }
}

pub struct Engine {
    core: SyncCore,
    transport: Arc<dyn CommandTransport>,
    sink: Box<dyn ViewSink>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
}

impl Engine {
    pub fn new(
        core: SyncCore,
        transport: Arc<dyn CommandTransport>,
        sink: Box<dyn ViewSink>,
    ) -> (Self, EngineHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let engine = Self {
            core,
            transport,
            sink,
            commands,
        };
        (engine, EngineHandle { tx })
    }

    /// Runs until shut down or every handle is dropped, then disconnects the
    /// transport and returns the final state.
    pub async fn run(mut self) -> SyncCore {
        let mut reply: Option<Reply> = None;
        loop {
            if reply.is_none() {
                if let Some(dispatch) = self.core.next_dispatch(Instant::now()) {
                    reply = Some(self.send(dispatch));
                }
            }
            self.flush_effects();

            let deadline = self.core.refresh_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                (id, result) = next_reply(&mut reply), if reply.is_some() => {
                    reply = None;
                    if let Err(err) = self.core.complete(id, result, Instant::now()) {
                        warn!(target: "pfod::engine", error = %err, "dropping reply");
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.core.fire_refresh(Instant::now());
                }
            }
        }

        self.flush_effects();
        if let Err(err) = self.transport.disconnect().await {
            warn!(target: "pfod::engine", error = %err, "disconnect failed");
        }
        if let Some(perf) = telemetry::summary() {
            perf.log();
        }
        info!(target: "pfod::engine", "engine stopped");
        self.core
    }

    fn send(&self, dispatch: Dispatch) -> Reply {
        let transport = Arc::clone(&self.transport);
        let span = telemetry::request_span(&dispatch);
        async move {
            let _perf = telemetry::PerfGuard::new(Timing::RoundTrip);
            let started = Instant::now();
            let result = transport.send(&dispatch.command).await;
            debug!(
                target: "pfod::engine",
                ok = result.is_ok(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "reply received"
            );
            (dispatch.id, result)
        }
        .instrument(span)
        .boxed()
    }

    fn handle(&mut self, command: EngineCommand) {
        let now = Instant::now();
        match command {
            EngineCommand::Connect => {
                self.core.connect();
            }
            EngineCommand::OpenDrawing(name) => {
                self.core.request_drawing(&name);
            }
            EngineCommand::Enqueue {
                tag,
                target,
                command,
            } => {
                // Rejections are logged by the core.
                let _ = self.core.enqueue_tagged(&tag, target.as_deref(), &command);
            }
            EngineCommand::Touch(touch) => {
                self.core.touch(&touch);
            }
            EngineCommand::TouchAction(items) => {
                self.core.show_touch_action(&items);
            }
            EngineCommand::GestureStart => self.core.gesture_start(),
            EngineCommand::GestureEnd => self.core.gesture_end(now),
            EngineCommand::Overlay(open) => self.core.set_overlay_open(open, now),
            EngineCommand::PauseUpdates => self.core.pause_updates(),
            EngineCommand::ResumeUpdates => self.core.resume_updates(now),
            EngineCommand::Back => {
                self.core.navigate_back();
            }
            EngineCommand::Reload => {
                self.core.reload();
            }
            EngineCommand::RemoveSubDrawing(name) => {
                self.core.remove_sub_drawing(&name);
            }
            EngineCommand::Shutdown => {}
        }
    }

    fn flush_effects(&mut self) {
        for effect in self.core.take_effects() {
            match effect {
                ViewEffect::Redraw => self.sink.redraw(self.core.visible()),
                ViewEffect::ShowDiagnostic(view) => self.sink.show_diagnostic(&view),
                ViewEffect::Alert(alert) => self.sink.alert(&alert),
            }
        }
    }
}

async fn next_reply(reply: &mut Option<Reply>) -> (RequestId, TransportResult<String>) {
    match reply.as_mut() {
        Some(reply) => reply.await,
        None => std::future::pending().await,
    }
}
