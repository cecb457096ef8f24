//! Session tracking and the shadow workspace.
//!
//! A session collects every response that must reach the visible model
//! together: the root drawing plus any sub-drawings it inserts. Responses are
//! written into a private copy of the drawing-set as they arrive; the copy is
//! only handed back once nothing related is queued or in flight.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::error::FoldError;
use crate::model::{Drawing, DrawingDecoder, DrawingSet, InsertPlacement, InsertRef};
use crate::protocol::{drawing_request, ParsedResponse, ResponseShape};

use super::policy::{self, SessionClass};
use super::request::{Request, RequestKind};

#[derive(Debug)]
pub struct Session {
    class: SessionClass,
    collected: BTreeMap<String, ParsedResponse>,
    workspace: DrawingSet,
    /// Loaded sub-drawings as they stood when the session opened.
    seeded: BTreeMap<String, Drawing>,
    saw_drawing: bool,
    adopted: bool,
}

impl Session {
    fn new(class: SessionClass, seed: &DrawingSet, root: Option<&str>, adopted: bool) -> Self {
        let mut workspace = seed.clone();
        if class != SessionClass::Touch {
            if let Some(root) = root.filter(|root| !root.is_empty()) {
                workspace.set_root(root);
            }
        }
        let root = workspace.current_name().map(str::to_string);
        let seeded = workspace
            .list_drawings()
            .iter()
            .filter(|name| Some(name.as_str()) != root.as_deref())
            .filter_map(|name| workspace.drawing(name))
            .filter(|drawing| drawing.has_data())
            .map(|drawing| (drawing.name.clone(), drawing.clone()))
            .collect();
        Self {
            class,
            collected: BTreeMap::new(),
            workspace,
            seeded,
            saw_drawing: false,
            adopted,
        }
    }

    pub fn class(&self) -> SessionClass {
        self.class
    }

    pub fn workspace(&self) -> &DrawingSet {
        &self.workspace
    }

    /// A snapshot or update has been folded in this session.
    pub fn saw_drawing(&self) -> bool {
        self.saw_drawing
    }

    /// Started for a drawing response that arrived with no session open.
    pub fn adopted(&self) -> bool {
        self.adopted
    }

    pub fn collected(&self) -> impl Iterator<Item = (&str, &ParsedResponse)> {
        self.collected
            .iter()
            .map(|(name, response)| (name.as_str(), response))
    }

    /// Complete once no related request is queued or in flight.
    pub fn is_complete(
        &self,
        queued: impl IntoIterator<Item = RequestKind>,
        in_flight: Option<RequestKind>,
    ) -> bool {
        let related = |kind: RequestKind| policy::is_related(self.class, kind);
        !in_flight.is_some_and(related) && !queued.into_iter().any(related)
    }

    /// Writes one drawing response into the workspace and returns requests
    /// for any sub-drawings it references that still need fetching.
    pub fn fold(
        &mut self,
        request: &Request,
        response: ParsedResponse,
        decoder: &dyn DrawingDecoder,
    ) -> Result<Vec<Request>, FoldError> {
        if self.class == SessionClass::Touch && request.kind == RequestKind::Touch {
            let update = decoder.decode(request.target_name(), &response)?;
            self.workspace.write_merged(&update);
            self.note_shape(response.shape);
            self.collected.insert(request.target_name().to_string(), response);
            return Ok(Vec::new());
        }

        let name = request
            .target
            .clone()
            .or_else(|| self.workspace.current_name().map(str::to_string))
            .or_else(|| response.raw.name.clone().filter(|name| !name.is_empty()))
            .ok_or_else(|| FoldError::UnknownDrawing(String::new()))?;
        if self.workspace.current_name().is_none() {
            self.workspace.set_root(&name);
        }
        if !self.workspace.contains(&name) {
            return Err(FoldError::UnknownDrawing(name));
        }

        let update = decoder.decode(&name, &response)?;
        let inserts = self.workspace.write(&name, update)?;
        self.note_shape(response.shape);
        debug!(
            target: "pfod::session",
            session = self.class.as_str(),
            drawing = %name,
            version = ?self.workspace.version(&name),
            inserts = inserts.len(),
            "response folded"
        );
        self.collected.insert(name.clone(), response);

        Ok(inserts
            .into_iter()
            .filter_map(|insert| self.resolve_insert(&name, insert))
            .collect())
    }

    fn note_shape(&mut self, shape: ResponseShape) {
        if matches!(shape, ResponseShape::Snapshot | ResponseShape::Update) {
            self.saw_drawing = true;
        }
    }

    fn resolve_insert(&mut self, parent: &str, insert: InsertRef) -> Option<Request> {
        let root = self.workspace.current_name().unwrap_or_default();
        if insert.name == root {
            warn!(
                target: "pfod::session",
                drawing = %insert.name,
                "drawing cannot insert itself"
            );
            return None;
        }
        if self.workspace.contains(&insert.name) {
            if self.workspace.has_data(&insert.name) {
                return None;
            }
        } else {
            self.workspace.add_sub_drawing(
                &insert.name,
                InsertPlacement {
                    parent: parent.to_string(),
                    offset: insert.offset,
                    transform: insert.transform,
                },
            );
        }
        let kind = if self.class == SessionClass::Refresh {
            RequestKind::RefreshInsertDwg
        } else {
            RequestKind::InsertDwg
        };
        Some(Request::new(
            kind,
            Some(&insert.name),
            drawing_request(&insert.name, None),
        ))
    }

    /// Best-effort repair after a failed fold.
    pub fn repair(&mut self, name: &str) {
        if self.workspace.contains(name) {
            self.workspace.ensure_collections(name);
        }
    }

    /// Gives up on a sub-drawing that could not be loaded this cycle. A sub
    /// that was already loaded before the session keeps its earlier content;
    /// one first seen in this session is pruned with everything it inserted.
    /// Returns the names pruned.
    pub fn omit(&mut self, name: &str) -> Vec<String> {
        self.collected.remove(name);
        if let Some(previous) = self.seeded.get(name).cloned() {
            if self.workspace.restore_drawing(previous) {
                debug!(
                    target: "pfod::session",
                    drawing = name,
                    "keeping previously loaded sub-drawing"
                );
                return Vec::new();
            }
        }
        self.workspace.remove_sub_drawing(name)
    }

    /// Removes a sub-drawing on request, loaded or not.
    pub fn remove(&mut self, name: &str) -> Vec<String> {
        self.collected.remove(name);
        let removed = self.workspace.remove_sub_drawing(name);
        for gone in &removed {
            self.seeded.remove(gone);
        }
        removed
    }

    pub fn is_root(&self, name: Option<&str>) -> bool {
        match name {
            None => true,
            Some(name) => self.workspace.current_name().is_none_or(|root| root == name),
        }
    }

    pub fn into_workspace(self) -> DrawingSet {
        self.workspace
    }
}

/// Holds at most one active session.
#[derive(Debug, Default)]
pub struct SessionTracker {
    active: Option<Session>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&Session> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut Session> {
        self.active.as_mut()
    }

    pub fn active_class(&self) -> Option<SessionClass> {
        self.active.as_ref().map(Session::class)
    }

    /// Opens a session seeded from a copy of `seed`.
    pub fn start(&mut self, class: SessionClass, seed: &DrawingSet, root: Option<&str>) {
        if let Some(previous) = self.active.take() {
            warn!(
                target: "pfod::session",
                previous = previous.class.as_str(),
                next = class.as_str(),
                "replacing active session"
            );
        }
        info!(
            target: "pfod::session",
            session = class.as_str(),
            root = root.unwrap_or(""),
            "session started"
        );
        self.active = Some(Session::new(class, seed, root, false));
    }

    /// Opens a `main` session for a drawing response nobody asked to track.
    pub fn adopt(&mut self, seed: &DrawingSet) -> &mut Session {
        debug!(target: "pfod::session", "adopting orphan drawing response");
        self.active
            .insert(Session::new(SessionClass::Main, seed, None, true))
    }

    /// Discards the session and everything folded into it.
    pub fn abandon(&mut self, reason: &str) -> Option<Session> {
        let session = self.active.take()?;
        info!(
            target: "pfod::session",
            session = session.class.as_str(),
            folded = session.collected.len(),
            reason,
            "session abandoned"
        );
        Some(session)
    }

    pub fn take(&mut self) -> Option<Session> {
        self.active.take()
    }
}
