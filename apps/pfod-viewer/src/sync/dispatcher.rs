//! Single-flight request dispatch and response routing.
//!
//! `SyncCore` is a synchronous state machine: the engine asks it for the next
//! request to send, hands back the transport result, and drains the view
//! effects it produced. All timing decisions take an explicit `now`.

use pfod_transport::{TransportError, TransportResult};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::error::{CodecError, FoldError, SyncError, ViewerError};
use crate::model::{
    DefaultMerger, DrawingDecoder, DrawingItem, DrawingMerger, DrawingUpdate, JsonItemDecoder,
};
use crate::protocol::response::{parse, DEFAULT_CHART_LIMIT};
use crate::protocol::{
    drawing_request, DiagnosticView, MenuResponse, ParsedResponse, ResponseShape, TouchCommand,
    MAIN_MENU_COMMAND,
};
use crate::telemetry::{self, Timing};
use crate::view::{Alert, ViewEffect, VisibleModel};

use super::navigation::NavigationStack;
use super::pending::PendingResponses;
use super::policy::{self, SessionClass};
use super::queue::RequestQueue;
use super::refresh::{RefreshGate, RefreshScheduler};
use super::request::{Request, RequestId, RequestKind};
use super::session::{Session, SessionTracker};

/// A request handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub id: RequestId,
    pub kind: RequestKind,
    pub target: Option<String>,
    pub command: String,
}

pub struct SyncCore {
    queue: RequestQueue,
    in_flight: Option<Request>,
    sessions: SessionTracker,
    pending: PendingResponses,
    refresh: RefreshScheduler,
    visible: VisibleModel,
    nav: NavigationStack,
    decoder: Box<dyn DrawingDecoder>,
    merger: Box<dyn DrawingMerger>,
    gesture_active: bool,
    overlay_open: bool,
    updates_enabled: bool,
    was_idle: bool,
    effects: Vec<ViewEffect>,
}

impl SyncCore {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            queue: RequestQueue::new(),
            in_flight: None,
            sessions: SessionTracker::new(),
            pending: PendingResponses::new(),
            refresh: RefreshScheduler::new(),
            visible: VisibleModel::new(identifier),
            nav: NavigationStack::new(),
            decoder: Box::new(JsonItemDecoder),
            merger: Box::new(DefaultMerger),
            gesture_active: false,
            overlay_open: false,
            updates_enabled: false,
            was_idle: true,
            effects: Vec::new(),
        }
    }

    pub fn with_decoder(mut self, decoder: impl DrawingDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    pub fn with_merger(mut self, merger: impl DrawingMerger + 'static) -> Self {
        self.merger = Box::new(merger);
        self
    }

    pub fn visible(&self) -> &VisibleModel {
        &self.visible
    }

    pub fn queued(&self) -> impl Iterator<Item = &Request> {
        self.queue.iter()
    }

    pub fn in_flight(&self) -> Option<&Request> {
        self.in_flight.as_ref()
    }

    pub fn active_session(&self) -> Option<SessionClass> {
        self.sessions.active_class()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn updates_enabled(&self) -> bool {
        self.updates_enabled
    }

    pub fn refresh_deadline(&self) -> Option<Instant> {
        self.refresh.deadline()
    }

    pub fn navigation(&self) -> &NavigationStack {
        &self.nav
    }

    pub fn take_effects(&mut self) -> Vec<ViewEffect> {
        std::mem::take(&mut self.effects)
    }

    /// Queues a request and enforces session priority against it.
    pub fn enqueue(&mut self, request: Request) -> RequestId {
        let preempts = request.kind.preempts_polling();
        let outcome = self.queue.push(request);
        if preempts {
            if let Some(flight) = self
                .in_flight
                .as_mut()
                .filter(|flight| flight.kind.is_refresh_class() && !flight.discard)
            {
                flight.discard = true;
                debug!(
                    target: "pfod::dispatch",
                    id = flight.id,
                    "in-flight refresh superseded by user request"
                );
            }
        }
        self.enforce_priority("higher priority request queued");
        telemetry::record_queue_depth(self.queue.len());
        outcome.id
    }

    /// Queues a request named by its wire tag; unknown tags are refused.
    pub fn enqueue_tagged(
        &mut self,
        tag: &str,
        target: Option<&str>,
        command: &str,
    ) -> Result<RequestId, SyncError> {
        let kind = tag.parse::<RequestKind>().inspect_err(|err| {
            error!(target: "pfod::queue", %tag, command, error = %err, "request rejected");
        })?;
        Ok(self.enqueue(Request::new(kind, target, command)))
    }

    /// Starts a connection by asking for the main menu.
    pub fn connect(&mut self) -> RequestId {
        self.enqueue(Request::new(RequestKind::MainMenu, None, MAIN_MENU_COMMAND).initial())
    }

    /// Opens a drawing directly, skipping the menu.
    pub fn request_drawing(&mut self, name: &str) -> RequestId {
        let drawings = self.visible.drawings();
        let version = drawings.has_data(name).then(|| drawings.version(name)).flatten();
        let command = drawing_request(name, version);
        self.enqueue(Request::new(RequestKind::Main, Some(name), command).initial())
    }

    pub fn touch(&mut self, touch: &TouchCommand) -> RequestId {
        let root = self.visible.drawings().current_name().map(str::to_string);
        self.enqueue(Request::touch(root.as_deref(), touch))
    }

    /// Pops the next request to send. Returns `None` while a request is in
    /// flight or when the queue is empty.
    pub fn next_dispatch(&mut self, now: Instant) -> Option<Dispatch> {
        if self.in_flight.is_some() {
            return None;
        }
        self.enforce_priority("higher priority request queued");
        let Some(request) = self.queue.pop_front() else {
            self.on_idle(now);
            return None;
        };
        self.was_idle = false;
        if let Some(class) = request.kind.session_class() {
            self.begin_session(class, &request);
        }
        telemetry::record_queue_depth(self.queue.len());
        debug!(
            target: "pfod::dispatch",
            id = request.id,
            kind = %request.kind,
            command = %request.command,
            remaining = self.queue.len(),
            "request dispatched"
        );
        let dispatch = Dispatch {
            id: request.id,
            kind: request.kind,
            target: request.target.clone(),
            command: request.command.clone(),
        };
        self.in_flight = Some(request);
        Some(dispatch)
    }

    /// Hands back the transport result for the in-flight request.
    pub fn complete(
        &mut self,
        id: RequestId,
        result: TransportResult<String>,
        now: Instant,
    ) -> Result<(), SyncError> {
        let request = match self.in_flight.take() {
            Some(request) if request.id == id => request,
            other => {
                self.in_flight = other;
                warn!(target: "pfod::dispatch", id, "response for a request not in flight");
                return Err(SyncError::NotInFlight(id));
            }
        };
        if request.discard {
            debug!(
                target: "pfod::dispatch",
                id,
                kind = %request.kind,
                command = %request.command,
                "response discarded"
            );
            self.check_and_apply(now);
            return Ok(());
        }
        let text = match result {
            Ok(text) => text,
            Err(err) => {
                self.on_transport_failure(request, err, now);
                return Ok(());
            }
        };
        let parsed = match parse(&text) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.on_malformed(request, err, now);
                return Ok(());
            }
        };
        if self.gesture_active {
            // The request stays in flight until the pointer is released.
            self.pending.push(request.clone(), parsed);
            self.in_flight = Some(request);
            return Ok(());
        }
        self.route(request, parsed);
        self.check_and_apply(now);
        Ok(())
    }

    pub fn gesture_start(&mut self) {
        self.gesture_active = true;
        self.refresh.cancel();
        let dropped = self.queue.retain(|queued| !queued.kind.is_refresh_class());
        if dropped > 0 {
            debug!(target: "pfod::dispatch", dropped, "queued polling dropped for gesture");
        }
        self.enforce_priority("pointer down");
    }

    /// Replays responses buffered during the gesture, then resumes.
    pub fn gesture_end(&mut self, now: Instant) {
        self.gesture_active = false;
        let discarded = self
            .in_flight
            .as_ref()
            .filter(|flight| flight.discard)
            .map(|flight| flight.id);
        let buffered = self.pending.drain();
        let replayed = buffered.len();
        for entry in buffered {
            if Some(entry.request.id) == discarded {
                debug!(target: "pfod::pending", id = entry.request.id, "buffered response discarded");
                continue;
            }
            self.route(entry.request, entry.data);
        }
        if replayed > 0 {
            debug!(target: "pfod::pending", replayed, "gesture ended");
            self.in_flight = None;
        }
        self.check_and_apply(now);
        self.schedule_refresh(now);
    }

    pub fn set_overlay_open(&mut self, open: bool, now: Instant) {
        self.overlay_open = open;
        if open {
            self.refresh.cancel();
        } else {
            self.schedule_refresh(now);
        }
    }

    pub fn pause_updates(&mut self) {
        self.updates_enabled = false;
        self.refresh.cancel();
    }

    pub fn resume_updates(&mut self, now: Instant) {
        self.updates_enabled = true;
        self.schedule_refresh(now);
    }

    /// Called when the refresh deadline passes. Queues a refresh of the root
    /// and every sub-drawing unless user activity blocks it.
    pub fn fire_refresh(&mut self, now: Instant) -> bool {
        if !self.refresh.take_due(now) {
            return false;
        }
        let in_flight_preempts = self
            .in_flight
            .as_ref()
            .is_some_and(|flight| flight.kind.preempts_polling());
        let blocked = if self.overlay_open {
            Some("input overlay open")
        } else if self.gesture_active {
            Some("pointer down")
        } else if self.queue.kinds().any(RequestKind::preempts_polling) {
            Some("user request queued")
        } else if in_flight_preempts {
            Some("user request in flight")
        } else {
            None
        };
        if let Some(reason) = blocked {
            debug!(target: "pfod::refresh", reason, "refresh deferred");
            self.schedule_refresh(now);
            return false;
        }
        if let Some(class) = self.sessions.active_class() {
            debug!(target: "pfod::refresh", session = class.as_str(), "refresh skipped, session in progress");
            return false;
        }

        let drawings = self.visible.drawings();
        let Some(root) = drawings.current_name().filter(|root| drawings.has_data(root)) else {
            return false;
        };
        let requests: Vec<Request> = drawings
            .list_drawings()
            .iter()
            .map(|name| {
                let kind = if name == root {
                    RequestKind::Refresh
                } else {
                    RequestKind::RefreshInsertDwg
                };
                Request::new(kind, Some(name), drawing_request(name, drawings.version(name)))
            })
            .collect();

        let count = requests.len();
        for request in requests {
            self.enqueue(request);
        }
        self.updates_enabled = true;
        debug!(target: "pfod::refresh", drawings = count, "refresh queued");
        true
    }

    /// Returns to the previous display, or the main menu.
    pub fn navigate_back(&mut self) -> RequestId {
        let dropped = self.queue.clear();
        self.abandon_session("navigating back");
        let command = self.nav.back();
        info!(target: "pfod::dispatch", %command, dropped, "navigating back");
        self.enqueue(Request::new(RequestKind::Back, None, command))
    }

    /// Re-issues the command behind the current display.
    pub fn reload(&mut self) -> RequestId {
        let dropped = self.queue.clear();
        self.abandon_session("reload");
        let command = self.nav.reload_command();
        info!(target: "pfod::dispatch", %command, dropped, "reloading");
        self.enqueue(Request::new(RequestKind::Refresh, None, command))
    }

    /// Removes a sub-drawing and everything it inserted from the visible
    /// model, the active workspace, and the queue.
    pub fn remove_sub_drawing(&mut self, name: &str) -> Vec<String> {
        let mut removed = self.visible.drawings_mut().remove_sub_drawing(name);
        if let Some(session) = self.sessions.active_mut() {
            for extra in session.remove(name) {
                if !removed.contains(&extra) {
                    removed.push(extra);
                }
            }
        }
        if removed.is_empty() {
            debug!(target: "pfod::dispatch", drawing = name, "nothing to remove");
            return removed;
        }
        let dropped = self.queue.remove_targets(&removed);
        if let Some(flight) = self.in_flight.as_mut() {
            if flight.target.as_ref().is_some_and(|target| removed.contains(target)) {
                flight.discard = true;
            }
        }
        let merged = self.merger.merge(self.visible.drawings());
        self.visible.drawings_mut().set_merged(merged);
        self.effects.push(ViewEffect::Redraw);
        info!(
            target: "pfod::dispatch",
            drawing = name,
            removed = removed.len(),
            dropped,
            "sub-drawing removed"
        );
        removed
    }

    /// Draws the local feedback for a pressed touch zone over the visible
    /// drawing. The items it covers are kept and put back when the next
    /// menu or raw-data response replaces the drawing. Returns false when no
    /// drawing is shown.
    pub fn show_touch_action(&mut self, items: &[DrawingItem]) -> bool {
        if !self.visible.is_displaying_drawing() {
            debug!(target: "pfod::view", "touch action ignored, no drawing shown");
            return false;
        }
        self.visible.save_touch_action_backup();
        let overlay = DrawingUpdate {
            items: items.to_vec(),
            ..DrawingUpdate::default()
        };
        self.visible.drawings_mut().write_merged(&overlay);
        self.effects.push(ViewEffect::Redraw);
        debug!(target: "pfod::view", items = items.len(), "touch action drawn");
        true
    }

    fn displaying_drawing(&self) -> bool {
        self.visible.is_displaying_drawing() || self.sessions.active().is_some_and(Session::saw_drawing)
    }

    fn gate(&self) -> RefreshGate {
        RefreshGate {
            updates_enabled: self.updates_enabled,
            interval_ms: self.visible.drawings().refresh_ms(),
            gesture_active: self.gesture_active,
            queue_empty: self.queue.is_empty(),
            in_flight: self.in_flight.is_some(),
            overlay_open: self.overlay_open,
            displaying_drawing: self.visible.is_displaying_drawing(),
        }
    }

    fn schedule_refresh(&mut self, now: Instant) {
        let gate = self.gate();
        self.refresh.schedule(&gate, now);
    }

    fn on_idle(&mut self, now: Instant) {
        if self.was_idle {
            return;
        }
        self.was_idle = true;
        trace!(target: "pfod::dispatch", "queue drained");
        if self.sessions.active().is_none()
            && self.visible.is_displaying_drawing()
            && !self.gesture_active
        {
            self.effects.push(ViewEffect::Redraw);
        }
        if !self.refresh.is_armed() {
            self.schedule_refresh(now);
        }
    }

    fn begin_session(&mut self, class: SessionClass, request: &Request) {
        match self.sessions.active_class() {
            None => {}
            Some(active) if active == class => {
                trace!(target: "pfod::session", session = class.as_str(), "request joins active session");
                return;
            }
            Some(active) if active > class => {
                debug!(
                    target: "pfod::session",
                    session = active.as_str(),
                    kind = %request.kind,
                    "request rides along with higher priority session"
                );
                return;
            }
            Some(active) => {
                error!(
                    target: "pfod::session",
                    session = active.as_str(),
                    next = class.as_str(),
                    "lower priority session still active at dispatch"
                );
                self.abandon_session("superseded at dispatch");
            }
        }
        self.sessions
            .start(class, self.visible.drawings(), request.target.as_deref());
    }

    fn enforce_priority(&mut self, reason: &str) {
        let Some(class) = self.sessions.active_class() else {
            return;
        };
        if policy::should_abandon(class, self.queue.kinds(), self.gesture_active) {
            self.abandon_session(reason);
        }
    }

    /// Drops the active session, its queued companions and its in-flight
    /// response.
    fn abandon_session(&mut self, reason: &str) {
        let Some(session) = self.sessions.abandon(reason) else {
            return;
        };
        let class = session.class();
        let dropped = self.queue.retain(|queued| !queued.kind.is_insert());
        let mut discarded = false;
        if let Some(flight) = self.in_flight.as_mut() {
            if policy::is_related(class, flight.kind) {
                flight.discard = true;
                discarded = true;
            }
        }
        debug!(
            target: "pfod::session",
            session = class.as_str(),
            dropped,
            discarded,
            "abandoned session requests dropped"
        );
    }

    fn route(&mut self, request: Request, parsed: ParsedResponse) {
        if parsed.shape == ResponseShape::Error {
            self.on_drawing_error(&request, &parsed);
            return;
        }
        if !parsed.is_drawing(self.displaying_drawing()) {
            self.on_non_drawing(&request, &parsed);
            return;
        }
        if let Some(cmd) = request.drag_cmd() {
            if self.queue.has_drag_for(cmd) {
                debug!(target: "pfod::dispatch", id = request.id, cmd, "drag response superseded");
                return;
            }
        }
        self.fold(request, parsed);
    }

    fn fold(&mut self, request: Request, parsed: ParsedResponse) {
        if self.sessions.active().is_none() {
            self.sessions.adopt(self.visible.drawings());
        }
        let Some(session) = self.sessions.active_mut() else {
            return;
        };
        match session.fold(&request, parsed, self.decoder.as_ref()) {
            Ok(inserts) => {
                for insert in inserts {
                    let queued = insert
                        .target
                        .as_deref()
                        .is_some_and(|name| self.queue.contains_target(name));
                    if !queued {
                        self.enqueue(insert);
                    }
                }
            }
            Err(err) => self.on_fold_failure(&request, err),
        }
    }

    fn on_fold_failure(&mut self, request: &Request, err: FoldError) {
        let Some(session) = self.sessions.active_mut() else {
            return;
        };
        let name = request
            .target
            .clone()
            .or_else(|| session.workspace().current_name().map(str::to_string))
            .unwrap_or_default();
        session.repair(&name);
        if session.is_root(request.target.as_deref()) {
            error!(target: "pfod::session", drawing = %name, error = %err, "root drawing failed to load");
            self.abandon_session("root drawing failed to load");
            self.effects
                .push(ViewEffect::Alert(Alert::new(ViewerError::from(err))));
        } else {
            warn!(target: "pfod::session", drawing = %name, error = %err, "sub-drawing failed to load");
            self.omit_sub(&name, "fold failed");
        }
    }

    fn omit_sub(&mut self, name: &str, reason: &str) {
        let Some(session) = self.sessions.active_mut() else {
            return;
        };
        let removed = session.omit(name);
        let dropped = self.queue.remove_targets(&removed);
        warn!(
            target: "pfod::session",
            drawing = name,
            reason,
            removed = removed.len(),
            dropped,
            "continuing without sub-drawing"
        );
    }

    /// Whether a failed request was one of the active session's sub-drawings
    /// rather than its root.
    fn is_session_sub(&self, request: &Request) -> bool {
        self.sessions.active().is_some_and(|session| {
            policy::is_related(session.class(), request.kind)
                && !session.is_root(request.target.as_deref())
        })
    }

    fn is_session_request(&self, request: &Request) -> bool {
        self.sessions
            .active()
            .is_some_and(|session| policy::is_related(session.class(), request.kind))
    }

    fn on_drawing_error(&mut self, request: &Request, parsed: &ParsedResponse) {
        let code = parsed
            .raw
            .error
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let message = parsed.raw.message.clone().unwrap_or_default();
        if self.is_session_sub(request) {
            self.omit_sub(request.target_name(), &code);
            return;
        }
        warn!(
            target: "pfod::dispatch",
            %code,
            %message,
            command = %request.command,
            "device reported a drawing error"
        );
        if self.is_session_request(request) {
            self.abandon_session("drawing error");
        }
        self.visible.apply_error();
        self.pause_updates();
        self.effects
            .push(ViewEffect::Alert(Alert::new(ViewerError::Drawing { code, message })));
    }

    fn on_non_drawing(&mut self, request: &Request, parsed: &ParsedResponse) {
        if self.visible.is_displaying_drawing() {
            if self.visible.restore_touch_action_backup() {
                debug!(target: "pfod::dispatch", "touch action overlay cleared");
            }
            self.refresh.cancel();
        }
        match parsed.shape {
            ResponseShape::Menu => {
                self.nav.record(request);
                self.visible.apply_menu();
                match parsed.menu() {
                    Some(menu) => self.follow_menu(menu),
                    None => warn!(
                        target: "pfod::dispatch",
                        command = %request.command,
                        "menu carries no drawing selector"
                    ),
                }
            }
            ResponseShape::RawData => match parsed.diagnostic() {
                Some(view) => {
                    self.nav.record(request);
                    self.visible.apply_diagnostic(view.clone());
                    self.effects.push(ViewEffect::ShowDiagnostic(view));
                }
                None => debug!(target: "pfod::dispatch", "raw data response without content"),
            },
            ResponseShape::Empty => {
                debug!(target: "pfod::dispatch", command = %request.command, "empty response ignored")
            }
            other => warn!(
                target: "pfod::dispatch",
                shape = ?other,
                command = %request.command,
                "unexpected response ignored"
            ),
        }
    }

    fn follow_menu(&mut self, menu: MenuResponse) {
        self.visible.set_identifier(&menu.identifier);
        let name = menu
            .drawing_name
            .clone()
            .or_else(|| self.visible.drawings().current_name().map(str::to_string));
        let Some(name) = name else {
            warn!(target: "pfod::dispatch", "menu names no drawing and none is loaded");
            return;
        };
        let drawings = self.visible.drawings();
        let stored = drawings.has_data(&name).then(|| drawings.version(&name)).flatten();
        let version = match (stored, menu.version.as_deref()) {
            (Some(stored), Some(advertised)) if stored == advertised => Some(stored),
            (Some(stored), None) => Some(stored),
            _ => None,
        };
        let command = drawing_request(&name, version);
        debug!(
            target: "pfod::dispatch",
            drawing = %name,
            identifier = %menu.identifier,
            %command,
            "menu selects drawing"
        );
        self.enqueue(Request::new(RequestKind::Main, Some(&name), command));
    }

    fn on_transport_failure(&mut self, request: Request, err: TransportError, now: Instant) {
        warn!(
            target: "pfod::dispatch",
            id = request.id,
            kind = %request.kind,
            command = %request.command,
            error = %err,
            "request failed"
        );
        if request.is_initial && err.is_exhausted() {
            self.abandon_session("initial request failed");
            let view = DiagnosticView::Chart {
                title: "Chart".to_string(),
                labels: Vec::new(),
                limit: DEFAULT_CHART_LIMIT,
            };
            self.visible.apply_diagnostic(view.clone());
            self.effects.push(ViewEffect::ShowDiagnostic(view));
            return;
        }
        self.on_request_failed(request, ViewerError::Transport(err), now);
    }

    fn on_malformed(&mut self, mut request: Request, err: CodecError, now: Instant) {
        if !request.parse_retried {
            warn!(
                target: "pfod::dispatch",
                id = request.id,
                command = %request.command,
                error = %err,
                "malformed response, retrying once"
            );
            request.parse_retried = true;
            self.queue.retry_front(request);
            return;
        }
        self.on_request_failed(request, ViewerError::MalformedResponse(err), now);
    }

    fn on_request_failed(&mut self, request: Request, error: ViewerError, now: Instant) {
        if self.is_session_sub(&request) {
            self.omit_sub(request.target_name(), "request failed");
            self.check_and_apply(now);
            return;
        }
        if self.is_session_request(&request) {
            self.abandon_session("request failed");
        }
        self.effects.push(ViewEffect::Alert(Alert::new(error)));
    }

    /// Applies the active session once nothing related is outstanding.
    fn check_and_apply(&mut self, now: Instant) {
        let Some(session) = self.sessions.active() else {
            return;
        };
        let class = session.class();
        if policy::should_abandon(class, self.queue.kinds(), self.gesture_active) {
            self.abandon_session("higher priority request queued");
            return;
        }
        let in_flight = self.in_flight.as_ref().map(|flight| flight.kind);
        if !session.is_complete(self.queue.kinds(), in_flight) {
            trace!(target: "pfod::session", session = class.as_str(), "waiting for related requests");
            return;
        }
        let Some(session) = self.sessions.take() else {
            return;
        };
        if session.collected().next().is_none() {
            debug!(target: "pfod::session", session = class.as_str(), "session closed without drawing content");
            return;
        }
        self.apply(session, now);
    }

    fn apply(&mut self, session: Session, now: Instant) {
        let _perf = telemetry::PerfGuard::new(Timing::Apply);
        let class = session.class();
        let saw_drawing = session.saw_drawing();
        let adopted = session.adopted();
        let folded = session.collected().count();
        let previous_refresh = self.visible.drawings().refresh_ms();

        let mut workspace = session.into_workspace();
        // Touch responses were written straight onto the merged view.
        if class != SessionClass::Touch {
            let merged = self.merger.merge(&workspace);
            workspace.set_merged(merged);
        }
        self.visible.replace_drawings(workspace, saw_drawing);

        let refresh_ms = self.visible.drawings().refresh_ms();
        info!(
            target: "pfod::session",
            session = class.as_str(),
            drawing = self.visible.drawings().current_name().unwrap_or(""),
            folded,
            adopted,
            refresh_ms,
            "session applied"
        );
        self.effects.push(ViewEffect::Redraw);

        if refresh_ms != previous_refresh {
            self.refresh.cancel();
            if refresh_ms > 0 {
                self.refresh.arm(refresh_ms, now);
            }
        } else {
            self.schedule_refresh(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TouchFilter;
    use crate::view::DisplayMode;
    use std::time::Duration;

    fn snapshot(version: &str, refresh: u64, items: &str) -> String {
        format!(
            r#"{{"pfodDrawing":"start","version":"{version}","refresh":{refresh},"items":[{items}]}}"#
        )
    }

    fn update(items: &str) -> String {
        format!(r#"{{"pfodDrawing":"update","items":[{items}]}}"#)
    }

    fn label(idx: u32, text: &str) -> String {
        format!(r#"{{"type":"label","idx":{idx},"text":"{text}"}}"#)
    }

    fn reply(core: &mut SyncCore, now: Instant, text: &str) -> Dispatch {
        let dispatch = core.next_dispatch(now).expect("a request to send");
        core.complete(dispatch.id, Ok(text.to_string()), now).unwrap();
        dispatch
    }

    fn loaded(now: Instant) -> SyncCore {
        let mut core = SyncCore::new("pfodWeb");
        core.request_drawing("gauge");
        reply(&mut core, now, &snapshot("V1", 1000, &label(1, "a")));
        core.take_effects();
        core
    }

    fn merged_text(core: &SyncCore, idx: u32) -> String {
        core.visible().merged().indexed[&idx].props["text"]
            .as_str()
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn menu_then_drawing_with_sub_applies_once_complete() {
        let now = Instant::now();
        let mut core = SyncCore::new("pfodWeb");
        core.connect();

        let menu = reply(&mut core, now, "{,|+A~gauge}");
        assert_eq!(menu.command, "{.}");
        assert_eq!(core.active_session(), None);
        assert_eq!(core.visible().identifier(), "A");

        let main = reply(
            &mut core,
            now,
            &snapshot("V1", 1000, r#"{"type":"insertDwg","drawingName":"sub1"}"#),
        );
        assert_eq!(main.command, "{gauge}");
        assert_eq!(main.kind, RequestKind::Main);
        assert!(core.visible().drawings().current_name().is_none());
        assert!(core.take_effects().is_empty());

        let sub = reply(&mut core, now, &snapshot("S1", 0, &label(7, "sub")));
        assert_eq!(sub.command, "{sub1}");
        assert_eq!(sub.kind, RequestKind::InsertDwg);
        assert_eq!(core.visible().drawings().list_drawings(), ["gauge", "sub1"]);
        assert_eq!(core.visible().mode(), DisplayMode::Drawing);
        assert_eq!(merged_text(&core, 7), "sub");
        assert_eq!(core.take_effects(), [ViewEffect::Redraw]);
        assert_eq!(
            core.refresh_deadline(),
            Some(now + Duration::from_millis(1000))
        );
    }

    #[test]
    fn menu_reuses_version_only_when_it_matches() {
        let now = Instant::now();
        let mut core = loaded(now);
        core.enqueue(Request::new(RequestKind::MainMenu, None, "{.}"));
        reply(&mut core, now, "{,|+A~gauge}");
        assert_eq!(core.queued().next().unwrap().command, "{V1:gauge}");
        assert_eq!(core.visible().mode(), DisplayMode::Menu);

        let mut core = loaded(now);
        core.enqueue(Request::new(RequestKind::MainMenu, None, "{.}"));
        reply(&mut core, now, r#"{"cmd":["{,","|+A~gauge","}"],"version":"V2"}"#);
        assert_eq!(core.queued().next().unwrap().command, "{gauge}");
    }

    #[test]
    fn touch_abandons_refresh_and_discards_its_response() {
        let now = Instant::now();
        let mut core = loaded(now);
        let due = now + Duration::from_millis(1000);
        assert!(core.fire_refresh(due));
        assert!(core.updates_enabled());

        let refresh = core.next_dispatch(due).unwrap();
        assert_eq!(refresh.command, "{V1:gauge}");
        assert_eq!(core.active_session(), Some(SessionClass::Refresh));

        core.touch(&TouchCommand::new("pfodWeb", "k", 1, 1, TouchFilter::Down));
        assert_eq!(core.active_session(), None);
        assert!(core.in_flight().unwrap().discard);

        core.complete(refresh.id, Ok(update(&label(1, "stale"))), due)
            .unwrap();
        assert_eq!(merged_text(&core, 1), "a");

        let touch = reply(&mut core, due, &update(&label(1, "touched")));
        assert_eq!(touch.kind, RequestKind::Touch);
        assert_eq!(merged_text(&core, 1), "touched");
    }

    #[test]
    fn responses_wait_for_pointer_release() {
        let now = Instant::now();
        let mut core = loaded(now);
        core.gesture_start();
        core.touch(&TouchCommand::new("pfodWeb", "k", 1, 1, TouchFilter::Down));
        let touch = core.next_dispatch(now).unwrap();
        core.complete(touch.id, Ok(update(&label(1, "b"))), now)
            .unwrap();

        assert_eq!(core.pending_len(), 1);
        assert!(core.in_flight().is_some());
        assert!(core.next_dispatch(now).is_none());
        assert_eq!(merged_text(&core, 1), "a");

        core.gesture_end(now);
        assert_eq!(core.pending_len(), 0);
        assert!(core.in_flight().is_none());
        assert_eq!(merged_text(&core, 1), "b");
    }

    #[test]
    fn superseded_drag_response_is_dropped() {
        let now = Instant::now();
        let mut core = loaded(now);
        core.touch(&TouchCommand::new("pfodWeb", "k", 1, 1, TouchFilter::Drag));
        let first = core.next_dispatch(now).unwrap();
        core.touch(&TouchCommand::new("pfodWeb", "k", 2, 1, TouchFilter::Drag));
        core.complete(first.id, Ok(update(&label(1, "old"))), now)
            .unwrap();
        assert_eq!(merged_text(&core, 1), "a");

        reply(&mut core, now, &update(&label(1, "new")));
        assert_eq!(merged_text(&core, 1), "new");
    }

    #[test]
    fn drawing_error_pauses_updates() {
        let now = Instant::now();
        let mut core = loaded(now);
        assert!(core.refresh_deadline().is_some());
        core.request_drawing("missing");
        reply(
            &mut core,
            now,
            r#"{"pfodDrawing":"error","error":"drawing_not_found","message":"not found"}"#,
        );
        assert_eq!(core.visible().mode(), DisplayMode::Error);
        assert!(!core.updates_enabled());
        assert!(core.refresh_deadline().is_none());
        let effects = core.take_effects();
        assert!(matches!(
            &effects[..],
            [ViewEffect::Alert(Alert { error: ViewerError::Drawing { code, .. }, .. })]
                if code == "drawing_not_found"
        ));
    }

    #[test]
    fn exhausted_initial_request_shows_empty_chart() {
        let now = Instant::now();
        let mut core = SyncCore::new("pfodWeb");
        core.connect();
        let menu = core.next_dispatch(now).unwrap();
        let err = TransportError::RetriesExhausted {
            attempts: 3,
            last: "timeout".into(),
        };
        core.complete(menu.id, Err(err), now).unwrap();
        assert_eq!(core.visible().mode(), DisplayMode::Chart);
        assert_eq!(
            core.take_effects(),
            [ViewEffect::ShowDiagnostic(DiagnosticView::Chart {
                title: "Chart".into(),
                labels: Vec::new(),
                limit: 500,
            })]
        );
    }

    #[test]
    fn failed_sub_drawing_is_omitted() {
        let now = Instant::now();
        let mut core = SyncCore::new("pfodWeb");
        core.request_drawing("gauge");
        reply(
            &mut core,
            now,
            &snapshot("V1", 0, r#"{"type":"insertDwg","drawingName":"sub1"}"#),
        );
        let sub = core.next_dispatch(now).unwrap();
        core.complete(sub.id, Err(TransportError::Status(500)), now)
            .unwrap();
        assert_eq!(core.visible().drawings().list_drawings(), ["gauge"]);
        assert_eq!(core.visible().mode(), DisplayMode::Drawing);
        assert_eq!(core.take_effects(), [ViewEffect::Redraw]);
    }

    #[test]
    fn failed_refresh_of_a_loaded_sub_drawing_keeps_it() {
        let now = Instant::now();
        let mut core = SyncCore::new("pfodWeb");
        core.request_drawing("gauge");
        reply(
            &mut core,
            now,
            &snapshot("V1", 1000, r#"{"type":"insertDwg","drawingName":"sub1"}"#),
        );
        reply(&mut core, now, &snapshot("S1", 0, &label(7, "sub")));
        core.take_effects();

        let due = now + Duration::from_millis(1000);
        assert!(core.fire_refresh(due));
        assert_eq!(reply(&mut core, due, &update("")).command, "{V1:gauge}");
        let sub = core.next_dispatch(due).unwrap();
        assert_eq!(sub.command, "{S1:sub1}");
        core.complete(sub.id, Err(TransportError::Status(500)), due)
            .unwrap();

        assert_eq!(core.active_session(), None);
        assert_eq!(core.visible().drawings().list_drawings(), ["gauge", "sub1"]);
        assert_eq!(merged_text(&core, 7), "sub");
        assert_eq!(core.take_effects(), [ViewEffect::Redraw]);

        let next = core.refresh_deadline().unwrap();
        assert_eq!(next, due + Duration::from_millis(1000));
        assert!(core.fire_refresh(next));
        let commands: Vec<_> = core.queued().map(|r| r.command.clone()).collect();
        assert_eq!(commands, ["{V1:gauge}", "{S1:sub1}"]);
    }

    #[test]
    fn repeated_refresh_with_the_same_reply_changes_nothing() {
        let now = Instant::now();
        let mut core = loaded(now);
        let mut due = now;
        let mut shown = Vec::new();
        for _ in 0..2 {
            due += Duration::from_millis(1000);
            assert_eq!(core.refresh_deadline(), Some(due));
            assert!(core.fire_refresh(due));
            let refresh = reply(&mut core, due, &update(&label(1, "a")));
            assert_eq!(refresh.command, "{V1:gauge}");
            shown.push(core.visible().drawings().clone());
        }
        assert_eq!(shown[0], shown[1]);
        assert_eq!(merged_text(&core, 1), "a");
    }

    #[test]
    fn undecodable_root_response_keeps_the_shown_drawing() {
        let now = Instant::now();
        let mut core = loaded(now);
        let before = core.visible().drawings().clone();

        core.request_drawing("gauge");
        let main = reply(&mut core, now, r#"{"pfodDrawing":"update","items":[42]}"#);
        assert_eq!(main.command, "{V1:gauge}");

        assert_eq!(core.active_session(), None);
        assert_eq!(
            core.take_effects(),
            [ViewEffect::Alert(Alert::new(ViewerError::ConnectionLost(
                "gauge".into()
            )))]
        );
        assert_eq!(core.visible().drawings(), &before);
        assert_eq!(core.visible().mode(), DisplayMode::Drawing);
    }

    #[test]
    fn touch_action_overlay_is_undone_by_a_menu() {
        let now = Instant::now();
        let mut core = loaded(now);
        let pressed = DrawingItem::from_value(&serde_json::json!(
            {"type": "label", "idx": 1, "text": "pressed"}
        ))
        .unwrap();

        assert!(core.show_touch_action(std::slice::from_ref(&pressed)));
        assert_eq!(merged_text(&core, 1), "pressed");
        assert_eq!(core.take_effects(), [ViewEffect::Redraw]);

        core.enqueue(Request::new(RequestKind::MainMenu, None, "{.}"));
        reply(&mut core, now, "{,|+A~gauge}");
        assert_eq!(core.visible().mode(), DisplayMode::Menu);
        assert_eq!(merged_text(&core, 1), "a");
        assert!(!core.show_touch_action(&[pressed]));
    }

    #[test]
    fn malformed_response_is_retried_once() {
        let now = Instant::now();
        let mut core = SyncCore::new("pfodWeb");
        core.request_drawing("gauge");
        let first = reply(&mut core, now, "garbage");
        assert_eq!(core.queued().next().map(|r| r.id), Some(first.id));

        reply(&mut core, now, "still garbage");
        assert!(core.queued().next().is_none());
        assert_eq!(core.active_session(), None);
        let effects = core.take_effects();
        assert!(matches!(
            &effects[..],
            [ViewEffect::Alert(Alert { error: ViewerError::MalformedResponse(_), .. })]
        ));
    }

    #[test]
    fn back_and_reload_use_navigation_history() {
        let now = Instant::now();
        let mut core = SyncCore::new("pfodWeb");
        core.connect();
        reply(&mut core, now, "{=Log|ignored}");
        core.enqueue(Request::new(RequestKind::Main, None, "{=Other}"));
        reply(&mut core, now, "{=Other}");
        assert_eq!(core.navigation().current(), Some("{=Other}"));

        core.enqueue(Request::new(RequestKind::InsertDwg, Some("x"), "{x}"));
        core.navigate_back();
        let kinds: Vec<_> = core.queued().map(|r| r.kind).collect();
        assert_eq!(kinds, [RequestKind::Back]);
        assert_eq!(core.queued().next().unwrap().command, "{.}");

        core.reload();
        let queued: Vec<_> = core.queued().map(|r| (r.kind, r.command.clone())).collect();
        assert_eq!(queued, [(RequestKind::Refresh, "{.}".to_string())]);
    }

    #[test]
    fn unknown_request_tags_are_rejected() {
        let mut core = SyncCore::new("pfodWeb");
        assert_eq!(
            core.enqueue_tagged("bogus", Some("gauge"), "{gauge}"),
            Err(SyncError::UnknownRequestKind("bogus".into()))
        );
        assert!(core.queued().next().is_none());
        assert!(core.enqueue_tagged("main", Some("gauge"), "{gauge}").is_ok());
    }

    #[test]
    fn completing_the_wrong_request_is_refused() {
        let now = Instant::now();
        let mut core = SyncCore::new("pfodWeb");
        core.connect();
        let menu = core.next_dispatch(now).unwrap();
        assert_eq!(
            core.complete(menu.id + 1, Ok("{}".into()), now),
            Err(SyncError::NotInFlight(menu.id + 1))
        );
        assert!(core.in_flight().is_some());
    }

    #[test]
    fn removing_a_sub_drawing_drops_its_requests() {
        let now = Instant::now();
        let mut core = SyncCore::new("pfodWeb");
        core.request_drawing("gauge");
        reply(
            &mut core,
            now,
            &snapshot("V1", 0, r#"{"type":"insertDwg","drawingName":"sub1"}"#),
        );
        reply(&mut core, now, &snapshot("S1", 0, &label(7, "sub")));
        core.take_effects();

        core.enqueue(Request::new(RequestKind::InsertDwg, Some("sub1"), "{sub1}"));
        assert_eq!(core.remove_sub_drawing("sub1"), ["sub1"]);
        assert!(core.queued().next().is_none());
        assert!(!core.visible().merged().indexed.contains_key(&7));
        assert_eq!(core.take_effects(), [ViewEffect::Redraw]);
        assert!(core.remove_sub_drawing("gauge").is_empty());
    }

    #[test]
    fn empty_response_counts_only_while_drawing_is_shown() {
        let now = Instant::now();
        let mut core = SyncCore::new("pfodWeb");
        core.request_drawing("gauge");
        reply(&mut core, now, "{}");
        assert_eq!(core.visible().mode(), DisplayMode::Connecting);
        assert!(core.take_effects().is_empty());

        let mut core = loaded(now);
        core.touch(&TouchCommand::new("pfodWeb", "k", 1, 1, TouchFilter::Up));
        reply(&mut core, now, "{}");
        assert_eq!(core.visible().mode(), DisplayMode::Drawing);
        assert_eq!(merged_text(&core, 1), "a");
    }

    #[test]
    fn refresh_is_deferred_while_overlay_open() {
        let now = Instant::now();
        let mut core = loaded(now);
        core.resume_updates(now);
        core.set_overlay_open(true, now);
        assert!(core.refresh_deadline().is_none());
        core.set_overlay_open(false, now);
        let due = core.refresh_deadline().unwrap();
        assert!(core.fire_refresh(due));
        assert_eq!(core.queued().next().unwrap().kind, RequestKind::Refresh);
    }
}
