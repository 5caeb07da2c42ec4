//! # Watch — Push Client with Polling Fallback
//!
//! Follows one sync until it reaches a terminal status. The stream
//! (`/api/sync/{id}/stream`) is preferred; when it drops, the client polls
//! `GET /api/sync/{id}` at a fixed interval while retrying the stream with
//! the configured backoff (1s, 2s, 4s, 8s, 16s by default). Once the delays
//! are exhausted it settles into polling for the rest of the run.
//!
//! Whatever the channel, [`ProgressView`] only moves forward: a late or
//! replayed snapshot never makes the displayed phase or percent go back.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::record::SyncRecord;

// ── Reconnect policy ────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
    poll_interval: Duration,
}

impl ReconnectPolicy {
    pub fn new(delays: Vec<Duration>, poll_interval: Duration) -> Self {
        ReconnectPolicy {
            delays,
            poll_interval,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.reconnect_delays(), config.poll_interval())
    }

    /// Delay before reconnect attempt `attempt` (0-based); `None` once the
    /// schedule is exhausted.
    pub fn delay_for(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

// ── Progress view ───────────────────────────────────────────────

/// Latest accepted snapshot of one sync.
#[derive(Debug, Default)]
pub struct ProgressView {
    current: Option<SyncRecord>,
}

impl ProgressView {
    /// Accept `incoming` if it does not move backwards. Returns whether the
    /// view changed.
    pub fn merge(&mut self, mut incoming: SyncRecord) -> bool {
        let Some(current) = &self.current else {
            self.current = Some(incoming);
            return true;
        };
        if current.sync_id != incoming.sync_id || current.status.is_terminal() {
            return false;
        }
        if incoming.status.is_terminal() {
            incoming.percent_complete = incoming.percent_complete.max(current.percent_complete);
            self.current = Some(incoming);
            return true;
        }
        if incoming.current_phase < current.current_phase
            || incoming.percent_complete < current.percent_complete
        {
            return false;
        }
        if incoming == *current {
            return false;
        }
        self.current = Some(incoming);
        true
    }

    pub fn current(&self) -> Option<&SyncRecord> {
        self.current.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|r| r.status.is_terminal())
    }
}

// ── Transports ──────────────────────────────────────────────────

/// How the watcher reaches the server: a push stream of snapshots and a
/// one-shot fetch.
#[async_trait]
pub trait StatusTransport: Send + Sync {
    /// Open the push stream. The stream ends when the server closes it.
    async fn subscribe(&self, sync_id: &str) -> Result<BoxStream<'static, Result<SyncRecord>>>;

    /// Current snapshot, `None` if the server does not know the sync.
    async fn fetch(&self, sync_id: &str) -> Result<Option<SyncRecord>>;
}

/// WebSocket + HTTP against a running `dbsync serve`.
pub struct HttpTransport {
    base: url::Url,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(server_url: &str) -> Result<Self> {
        let base = url::Url::parse(server_url)
            .map_err(|e| anyhow::anyhow!("invalid server URL '{}': {}", server_url, e))?;
        if !matches!(base.scheme(), "http" | "https") {
            anyhow::bail!("server URL must be http:// or https://, got '{}'", server_url);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(HttpTransport { base, client })
    }

    fn status_url(&self, sync_id: &str) -> Result<url::Url> {
        Ok(self
            .base
            .join(&format!("/api/sync/{}", urlencoding::encode(sync_id)))?)
    }

    fn stream_url(&self, sync_id: &str) -> Result<url::Url> {
        let mut url = self
            .base
            .join(&format!("/api/sync/{}/stream", urlencoding::encode(sync_id)))?;
        let scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("cannot derive stream URL from {}", self.base))?;
        Ok(url)
    }
}

#[async_trait]
impl StatusTransport for HttpTransport {
    async fn subscribe(&self, sync_id: &str) -> Result<BoxStream<'static, Result<SyncRecord>>> {
        let url = self.stream_url(sync_id)?;
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let stream = ws
            .take_while(|msg| futures_util::future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => {
                        Some(serde_json::from_str::<SyncRecord>(&text).map_err(anyhow::Error::from))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(e.into())),
                }
            })
            .boxed();
        Ok(stream)
    }

    async fn fetch(&self, sync_id: &str) -> Result<Option<SyncRecord>> {
        let response = self.client.get(self.status_url(sync_id)?).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = response.error_for_status()?.json::<SyncRecord>().await?;
        Ok(Some(record))
    }
}

// ── Watcher ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Stream,
    Poll,
}

pub struct Watcher<T> {
    transport: T,
    policy: ReconnectPolicy,
}

impl<T: StatusTransport> Watcher<T> {
    pub fn new(transport: T, policy: ReconnectPolicy) -> Self {
        Watcher { transport, policy }
    }

    /// Follow `sync_id` to completion, calling `on_update` for each accepted
    /// snapshot with the channel it arrived on. Returns the terminal record.
    pub async fn watch<F>(&self, sync_id: &str, mut on_update: F) -> Result<SyncRecord>
    where
        F: FnMut(&SyncRecord, Channel) + Send,
    {
        let mut view = ProgressView::default();
        let mut attempt = 0;

        loop {
            match self.transport.subscribe(sync_id).await {
                Ok(mut stream) => {
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(record) => {
                                attempt = 0;
                                if view.merge(record) {
                                    if let Some(current) = view.current() {
                                        on_update(current, Channel::Stream);
                                    }
                                }
                                if let Some(done) = terminal(&view) {
                                    return Ok(done);
                                }
                            }
                            Err(e) => {
                                debug!(sync_id, error = %e, "status stream error");
                                break;
                            }
                        }
                    }
                    warn!(sync_id, "status stream lost");
                }
                Err(e) => debug!(sync_id, attempt, error = %e, "status stream connect failed"),
            }

            let Some(delay) = self.policy.delay_for(attempt) else {
                break;
            };
            attempt += 1;
            if let Some(done) = self
                .poll_for(sync_id, &mut view, delay, &mut on_update)
                .await?
            {
                return Ok(done);
            }
        }

        warn!(
            sync_id,
            attempts = self.policy.max_attempts(),
            "stream unavailable, polling until the sync finishes"
        );
        loop {
            if let Some(done) = self
                .poll_for(sync_id, &mut view, self.policy.poll_interval(), &mut on_update)
                .await?
            {
                return Ok(done);
            }
        }
    }

    /// Poll at the fixed interval for `window`. Returns the terminal record
    /// if one was seen.
    async fn poll_for<F>(
        &self,
        sync_id: &str,
        view: &mut ProgressView,
        window: Duration,
        on_update: &mut F,
    ) -> Result<Option<SyncRecord>>
    where
        F: FnMut(&SyncRecord, Channel) + Send,
    {
        let deadline = Instant::now() + window;
        loop {
            match self.transport.fetch(sync_id).await {
                Ok(Some(record)) => {
                    if view.merge(record) {
                        if let Some(current) = view.current() {
                            on_update(current, Channel::Poll);
                        }
                    }
                    if let Some(done) = terminal(view) {
                        return Ok(Some(done));
                    }
                }
                Ok(None) => anyhow::bail!("sync {} not found", sync_id),
                Err(e) => debug!(sync_id, error = %e, "status poll failed"),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.policy.poll_interval().min(deadline - now)).await;
        }
    }
}

fn terminal(view: &ProgressView) -> Option<SyncRecord> {
    view.current()
        .filter(|r| r.status.is_terminal())
        .cloned()
}
