use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;
use crate::protocol::{TouchCommand, TouchFilter};

use super::policy::SessionClass;

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    MainMenu,
    Main,
    Touch,
    Refresh,
    InsertDwg,
    RefreshInsertDwg,
    Back,
}

impl RequestKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            RequestKind::MainMenu => "mainMenu",
            RequestKind::Main => "main",
            RequestKind::Touch => "touch",
            RequestKind::Refresh => "refresh",
            RequestKind::InsertDwg => "insertDwg",
            RequestKind::RefreshInsertDwg => "refresh-insertDwg",
            RequestKind::Back => "back",
        }
    }

    /// The session a request of this kind starts, if any.
    pub const fn session_class(self) -> Option<SessionClass> {
        match self {
            RequestKind::MainMenu => Some(SessionClass::MainMenu),
            RequestKind::Main => Some(SessionClass::Main),
            RequestKind::Touch => Some(SessionClass::Touch),
            RequestKind::Refresh => Some(SessionClass::Refresh),
            RequestKind::InsertDwg | RequestKind::RefreshInsertDwg | RequestKind::Back => None,
        }
    }

    /// User intent: evicts queued polling and blocks the refresh timer.
    pub const fn preempts_polling(self) -> bool {
        matches!(
            self,
            RequestKind::MainMenu | RequestKind::Main | RequestKind::Touch | RequestKind::Back
        )
    }

    pub const fn is_refresh_class(self) -> bool {
        matches!(self, RequestKind::Refresh | RequestKind::RefreshInsertDwg)
    }

    pub const fn is_insert(self) -> bool {
        matches!(self, RequestKind::InsertDwg | RequestKind::RefreshInsertDwg)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = SyncError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let kind = match tag {
            "mainMenu" => RequestKind::MainMenu,
            "main" => RequestKind::Main,
            "touch" => RequestKind::Touch,
            "refresh" => RequestKind::Refresh,
            "insertDwg" => RequestKind::InsertDwg,
            "refresh-insertDwg" => RequestKind::RefreshInsertDwg,
            "back" => RequestKind::Back,
            other => return Err(SyncError::UnknownRequestKind(other.to_string())),
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchZoneInfo {
    pub cmd: String,
    pub filter: TouchFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Assigned by the queue on enqueue.
    pub id: RequestId,
    pub target: Option<String>,
    pub command: String,
    pub kind: RequestKind,
    pub touch_zone: Option<TouchZoneInfo>,
    pub is_initial: bool,
    /// Set when the response must be dropped on arrival.
    pub discard: bool,
    pub parse_retried: bool,
}

impl Request {
    pub fn new(kind: RequestKind, target: Option<&str>, command: impl Into<String>) -> Self {
        Self {
            id: 0,
            target: target.map(str::to_string),
            command: command.into(),
            kind,
            touch_zone: None,
            is_initial: false,
            discard: false,
            parse_retried: false,
        }
    }

    pub fn touch(target: Option<&str>, touch: &TouchCommand) -> Self {
        let mut request = Self::new(RequestKind::Touch, target, touch.encode());
        request.touch_zone = Some(TouchZoneInfo {
            cmd: touch.zone_cmd.clone(),
            filter: touch.filter,
        });
        request
    }

    pub fn initial(mut self) -> Self {
        self.is_initial = true;
        self
    }

    pub fn drag_cmd(&self) -> Option<&str> {
        self.touch_zone
            .as_ref()
            .filter(|zone| zone.filter.is_drag())
            .map(|zone| zone.cmd.as_str())
    }

    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or("")
    }
}
