//! Priority and abandonment rules between sessions.
//!
//! Sessions are totally ordered `MainMenu > Main > Touch > Refresh`. A queued
//! request of strictly higher class abandons the active session; a pressed
//! pointer additionally abandons a refresh session. `refresh` and
//! `refresh-insertDwg` are one class here.

use super::request::RequestKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionClass {
    Refresh,
    Touch,
    Main,
    MainMenu,
}

impl SessionClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionClass::Refresh => "refresh",
            SessionClass::Touch => "touch",
            SessionClass::Main => "main",
            SessionClass::MainMenu => "mainMenu",
        }
    }

    /// Whether a queued request of `kind` outranks a session of this class.
    pub fn abandoned_by(self, kind: RequestKind) -> bool {
        kind.session_class().is_some_and(|queued| queued > self)
    }

    pub const fn abandoned_by_gesture(self) -> bool {
        matches!(self, SessionClass::Refresh)
    }
}

/// Decides whether the active session must be dropped.
pub fn should_abandon(
    active: SessionClass,
    queued: impl IntoIterator<Item = RequestKind>,
    gesture_down: bool,
) -> bool {
    if gesture_down && active.abandoned_by_gesture() {
        return true;
    }
    queued.into_iter().any(|kind| active.abandoned_by(kind))
}

/// Whether a request of `kind` still contributes to a session of `active`.
pub fn is_related(active: SessionClass, kind: RequestKind) -> bool {
    match kind {
        RequestKind::InsertDwg => true,
        RequestKind::RefreshInsertDwg => active == SessionClass::Refresh,
        other => other.session_class() == Some(active),
    }
}
