use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::{
    send_with_retries, CommandTransport, DedupCounter, TransportError, TransportResult,
};

const MAX_RESPONSE_TIMEOUT_SECS: u64 = 30;
const NEVER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub base_url: Url,
    pub response_timeout: Duration,
    pub max_retries: u32,
}

impl HttpTransportConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            response_timeout: Self::response_timeout_from_secs(3),
            max_retries: 2,
        }
    }

    /// Clamps to 0..=30 seconds; zero means "never", which is really a minute.
    pub fn response_timeout_from_secs(secs: u64) -> Duration {
        match secs.min(MAX_RESPONSE_TIMEOUT_SECS) {
            0 => NEVER_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }
}

/// Sends commands as `GET {base}/pfodWeb?cmd=...`.
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
    dedup: DedupCounter,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.response_timeout)
            .build()
            .map_err(|err| TransportError::Io(err.to_string()))?;
        Ok(Self {
            client,
            config,
            dedup: DedupCounter::new(),
        })
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    fn endpoint(&self, prefixed: &str) -> TransportResult<Url> {
        let mut url = self
            .config
            .base_url
            .join("pfodWeb")
            .map_err(|err| TransportError::Io(err.to_string()))?;
        url.query_pairs_mut().append_pair("cmd", prefixed);
        Ok(url)
    }

    async fn send_once(&self, prefixed: String) -> TransportResult<String> {
        let url = self.endpoint(&prefixed)?;
        debug!(target: "pfod::transport", %url, "fetching");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| self.classify(err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        response.text().await.map_err(|err| self.classify(err))
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.config.response_timeout)
        } else {
            TransportError::Io(err.to_string())
        }
    }
}

#[async_trait]
impl CommandTransport for HttpTransport {
    async fn send(&self, command: &str) -> TransportResult<String> {
        send_with_retries(command, self.config.max_retries, &self.dedup, |prefixed| {
            self.send_once(prefixed)
        })
        .await
    }

    fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}
