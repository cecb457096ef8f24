use tracing::debug;

use crate::protocol::ParsedResponse;

use super::request::Request;

#[derive(Debug, Clone)]
pub struct PendingResponse {
    pub request: Request,
    pub data: ParsedResponse,
}

/// Responses held back while a pointer is pressed, replayed in arrival order
/// when it is released.
#[derive(Debug, Default)]
pub struct PendingResponses {
    entries: Vec<PendingResponse>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a response. A drag response supersedes an earlier one for the
    /// same zone; returns true when that happened.
    pub fn push(&mut self, request: Request, data: ParsedResponse) -> bool {
        let mut collapsed = false;
        if let Some(cmd) = request.drag_cmd() {
            let before = self.entries.len();
            self.entries
                .retain(|pending| pending.request.drag_cmd() != Some(cmd));
            collapsed = before != self.entries.len();
        }
        debug!(
            target: "pfod::pending",
            id = request.id,
            kind = %request.kind,
            collapsed,
            buffered = self.entries.len() + 1,
            "response buffered during gesture"
        );
        self.entries.push(PendingResponse { request, data });
        collapsed
    }

    pub fn drain(&mut self) -> Vec<PendingResponse> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
