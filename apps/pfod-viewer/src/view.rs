use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::error::{RecoveryAction, ViewerError};
use crate::model::{DrawingItem, DrawingSet, MergedView};
use crate::protocol::DiagnosticView;

/// What the viewer is currently showing. Several rules (empty-response
/// handling, refresh gating) depend on whether this is `Drawing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayMode {
    #[default]
    Connecting,
    Drawing,
    Menu,
    Chart,
    RawData,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub error: ViewerError,
    pub actions: Vec<RecoveryAction>,
}

impl Alert {
    pub fn new(error: ViewerError) -> Self {
        let actions = error.recovery_actions();
        Self { error, actions }
    }
}

/// Side effects produced by the sync core for whoever renders.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEffect {
    Redraw,
    ShowDiagnostic(DiagnosticView),
    Alert(Alert),
}

/// The drawing-set currently on screen plus display state.
#[derive(Debug, Clone, Default)]
pub struct VisibleModel {
    drawings: DrawingSet,
    mode: DisplayMode,
    diagnostic: Option<DiagnosticView>,
    identifier: String,
    touch_action_backup: Option<BTreeMap<u32, DrawingItem>>,
}

impl VisibleModel {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    pub fn drawings(&self) -> &DrawingSet {
        &self.drawings
    }

    pub fn merged(&self) -> &MergedView {
        self.drawings.merged()
    }

    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    pub fn is_displaying_drawing(&self) -> bool {
        self.mode == DisplayMode::Drawing
    }

    pub fn diagnostic(&self) -> Option<&DiagnosticView> {
        self.diagnostic.as_ref()
    }

    /// Touch identifier sent with zone commands.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub(crate) fn set_identifier(&mut self, identifier: &str) {
        if !identifier.is_empty() {
            self.identifier = identifier.to_string();
        }
    }

    /// Swaps in a completed workspace in one step.
    pub(crate) fn replace_drawings(&mut self, drawings: DrawingSet, saw_drawing: bool) {
        self.drawings = drawings;
        self.touch_action_backup = None;
        if saw_drawing {
            self.mode = DisplayMode::Drawing;
            self.diagnostic = None;
        }
    }

    pub(crate) fn drawings_mut(&mut self) -> &mut DrawingSet {
        &mut self.drawings
    }

    pub(crate) fn apply_menu(&mut self) {
        self.mode = DisplayMode::Menu;
        self.diagnostic = None;
    }

    pub(crate) fn apply_diagnostic(&mut self, view: DiagnosticView) {
        self.mode = match view {
            DiagnosticView::Chart { .. } => DisplayMode::Chart,
            DiagnosticView::RawText { .. } => DisplayMode::RawData,
        };
        self.diagnostic = Some(view);
    }

    pub(crate) fn apply_error(&mut self) {
        self.mode = DisplayMode::Error;
        self.diagnostic = None;
    }

    /// Remembers the merged indexed items before a touch-action overlay is
    /// drawn over them. A second overlay keeps the first backup.
    pub(crate) fn save_touch_action_backup(&mut self) {
        if self.touch_action_backup.is_none() {
            self.touch_action_backup = Some(self.drawings.merged().indexed.clone());
        }
    }

    pub(crate) fn restore_touch_action_backup(&mut self) -> bool {
        let Some(backup) = self.touch_action_backup.take() else {
            return false;
        };
        let mut merged = self.drawings.merged().clone();
        merged.indexed.extend(backup);
        self.drawings.set_merged(merged);
        true
    }
}

/// Receives what the engine wants shown. Implementations render; the engine
/// never touches a display directly.
pub trait ViewSink: Send {
    fn redraw(&mut self, model: &VisibleModel);
    fn show_diagnostic(&mut self, view: &DiagnosticView);
    fn alert(&mut self, alert: &Alert);
}

/// Sink that only logs, for headless runs.
#[derive(Debug, Default)]
pub struct LogSink;

impl ViewSink for LogSink {
    fn redraw(&mut self, model: &VisibleModel) {
        let merged = model.merged();
        info!(
            target: "pfod::view",
            drawing = model.drawings().current_name().unwrap_or(""),
            version = ?model.drawings().current_name().and_then(|name| model.drawings().version(name)),
            mode = ?model.mode(),
            unindexed = merged.unindexed.len(),
            indexed = merged.indexed.len(),
            zones = merged.zones.len(),
            "redraw"
        );
    }

    fn show_diagnostic(&mut self, view: &DiagnosticView) {
        match view {
            DiagnosticView::Chart {
                title,
                labels,
                limit,
            } => info!(target: "pfod::view", %title, ?labels, limit, "chart display"),
            DiagnosticView::RawText { title, text } => {
                info!(target: "pfod::view", %title, lines = text.lines().count(), "raw data display")
            }
        }
    }

    fn alert(&mut self, alert: &Alert) {
        warn!(
            target: "pfod::view",
            error = %alert.error,
            actions = ?alert.actions,
            "alert"
        );
    }
}
