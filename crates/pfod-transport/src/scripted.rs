use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{CommandTransport, TransportError, TransportResult};

pub enum ScriptedReply {
    Text(String),
    Error(TransportError),
    /// Stays pending until the paired sender fires.
    Held(oneshot::Receiver<TransportResult<String>>),
}

/// In-memory transport for tests and offline use. Replies are consumed in
/// order; running out of replies looks like a device that stopped answering.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<ScriptedReply>>,
    sent: Mutex<Vec<String>>,
    max_retries: u32,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.replies.lock().push_back(ScriptedReply::Text(text.into()));
    }

    pub fn push_error(&self, err: TransportError) {
        self.replies.lock().push_back(ScriptedReply::Error(err));
    }

    /// Queues a reply that only resolves once the returned sender is used.
    pub fn push_held(&self) -> oneshot::Sender<TransportResult<String>> {
        let (tx, rx) = oneshot::channel();
        self.replies.lock().push_back(ScriptedReply::Held(rx));
        tx
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl CommandTransport for ScriptedTransport {
    async fn send(&self, command: &str) -> TransportResult<String> {
        self.sent.lock().push(command.to_string());
        let reply = self.replies.lock().pop_front();
        match reply {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Error(err)) => Err(err),
            Some(ScriptedReply::Held(rx)) => rx.await.unwrap_or(Err(TransportError::Closed)),
            None => Err(TransportError::RetriesExhausted {
                attempts: self.max_retries + 1,
                last: "no scripted reply".to_string(),
            }),
        }
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
