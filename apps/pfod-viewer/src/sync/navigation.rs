use tracing::debug;

use crate::protocol::MAIN_MENU_COMMAND;

use super::request::{Request, RequestKind};

/// Commands that opened menu or diagnostic displays, for back and reload.
#[derive(Debug, Default)]
pub struct NavigationStack {
    stack: Vec<String>,
    current: Option<String>,
}

impl NavigationStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a navigation to the display opened by `request`. Polling and
    /// back requests are not navigations.
    pub fn record(&mut self, request: &Request) {
        if request.kind.is_refresh_class() || request.kind == RequestKind::Back {
            return;
        }
        if let Some(current) = self.current.take() {
            if self.stack.last() != Some(&current) {
                self.stack.push(current);
            }
        }
        debug!(
            target: "pfod::dispatch",
            command = %request.command,
            depth = self.stack.len(),
            "navigation recorded"
        );
        self.current = Some(request.command.clone());
    }

    /// Pops the previous display, falling back to the main menu.
    pub fn back(&mut self) -> String {
        let command = self
            .stack
            .pop()
            .unwrap_or_else(|| MAIN_MENU_COMMAND.to_string());
        self.current = Some(command.clone());
        command
    }

    pub fn reload_command(&self) -> String {
        self.current
            .clone()
            .unwrap_or_else(|| MAIN_MENU_COMMAND.to_string())
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}
