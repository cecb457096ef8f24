use std::collections::VecDeque;

use tracing::debug;

use super::request::{Request, RequestId, RequestKind};

/// What `push` did besides appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub id: RequestId,
    /// Queued polling requests dropped in favour of this one.
    pub evicted_polling: usize,
    /// A queued drag for the same zone was superseded.
    pub replaced_drag: bool,
}

/// FIFO of pending requests. Priority is enforced by session abandonment,
/// never by reordering; the only rewrites are polling eviction and drag
/// collapse.
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: VecDeque<Request>,
    next_id: RequestId,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut request: Request) -> Enqueued {
        self.next_id += 1;
        request.id = self.next_id;

        let mut evicted_polling = 0;
        if request.kind.preempts_polling() {
            let before = self.entries.len();
            self.entries.retain(|queued| !queued.kind.is_refresh_class());
            evicted_polling = before - self.entries.len();
        }

        let mut replaced_drag = false;
        if let Some(cmd) = request.drag_cmd() {
            let before = self.entries.len();
            self.entries.retain(|queued| queued.drag_cmd() != Some(cmd));
            replaced_drag = before != self.entries.len();
        }

        debug!(
            target: "pfod::queue",
            id = request.id,
            kind = %request.kind,
            command = %request.command,
            evicted_polling,
            replaced_drag,
            depth = self.entries.len() + 1,
            "request queued"
        );
        let id = request.id;
        self.entries.push_back(request);
        Enqueued {
            id,
            evicted_polling,
            replaced_drag,
        }
    }

    /// Puts a request back at the head, keeping its id.
    pub fn retry_front(&mut self, request: Request) {
        debug!(
            target: "pfod::queue",
            id = request.id,
            kind = %request.kind,
            command = %request.command,
            "request requeued for retry"
        );
        self.entries.push_front(request);
    }

    pub fn pop_front(&mut self) -> Option<Request> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.entries.iter()
    }

    pub fn kinds(&self) -> impl Iterator<Item = RequestKind> + '_ {
        self.entries.iter().map(|request| request.kind)
    }

    pub fn contains_target(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|request| request.target.as_deref() == Some(name))
    }

    pub fn has_drag_for(&self, cmd: &str) -> bool {
        self.entries
            .iter()
            .any(|request| request.drag_cmd() == Some(cmd))
    }

    /// Drops every queued request aimed at one of `names`.
    pub fn remove_targets(&mut self, names: &[String]) -> usize {
        self.retain(|request| {
            request
                .target
                .as_ref()
                .is_none_or(|target| !names.contains(target))
        })
    }

    pub fn retain(&mut self, keep: impl FnMut(&Request) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(keep);
        before - self.entries.len()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}
