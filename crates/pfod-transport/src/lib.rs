//! Command transport used by the pfod viewer.
//!
//! A transport carries exactly one textual command to the device (or its
//! proxy) and hands back the response text. Retries live below this
//! interface: callers only ever observe a final success or a final error,
//! and `TransportError::is_exhausted` tells them whether the retry budget
//! ran out.

mod http;
mod scripted;

pub use http::{HttpTransport, HttpTransportConfig};
pub use scripted::{ScriptedReply, ScriptedTransport};

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("all {attempts} attempts exhausted: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("response timeout after {0:?} - device may not be responding")]
    Timeout(Duration),
    #[error("device returned http status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Io(String),
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// True when the device stopped answering: retries ran out or the
    /// response never arrived.
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            TransportError::RetriesExhausted { .. } | TransportError::Timeout(_)
        )
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Sends one command and waits for its response text.
    async fn send(&self, command: &str) -> TransportResult<String>;

    async fn disconnect(&self) -> TransportResult<()> {
        Ok(())
    }

    fn max_retries(&self) -> u32;
}

/// Alphabet of the one-character prefix the device uses to spot resent commands.
pub const DEDUP_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Default)]
pub struct DedupCounter {
    next: AtomicUsize,
}

impl DedupCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_char(&self) -> char {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % DEDUP_CHARS.len();
        DEDUP_CHARS[index] as char
    }
}

/// Runs `attempt` up to `max_retries + 1` times. The dedup prefix is taken
/// once, so every retry of the same command carries the same character.
pub async fn send_with_retries<F, Fut>(
    command: &str,
    max_retries: u32,
    dedup: &DedupCounter,
    mut attempt: F,
) -> TransportResult<String>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = TransportResult<String>>,
{
    let prefixed = format!("{}{}", dedup.next_char(), command);
    let attempts = max_retries.saturating_add(1);
    let mut last_error = None;

    for n in 1..=attempts {
        match attempt(prefixed.clone()).await {
            Ok(text) => {
                debug!(
                    target: "pfod::transport",
                    attempt = n,
                    command = %prefixed,
                    bytes = text.len(),
                    "command answered"
                );
                return Ok(text);
            }
            Err(err) => {
                warn!(
                    target: "pfod::transport",
                    attempt = n,
                    attempts,
                    command = %prefixed,
                    error = %err,
                    "send attempt failed"
                );
                last_error = Some(err);
            }
        }
    }

    Err(TransportError::RetriesExhausted {
        attempts,
        last: last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no attempt made".to_string()),
    })
}
