//! Notifier
//!
//! Delivers `walletnotify` and `payoutnotify` calls to the external ledger.
//! Delivery is at-least-once; the ledger deduplicates by transaction id.
//! Scanned transactions reach the notifier through the durable outbox, so a
//! stuck ledger delays notifications without holding back the scan cursor.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::config::NotifyConfig;
use super::error::{NotifyError, StoreError};
use super::shutdown::ShutdownSignal;
use super::store::OutboxStore;

#[async_trait]
pub trait NotifyTransport: Send + Sync {
    /// POST to `path` (relative to the ledger base URL) and return the JSON reply
    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Value, NotifyError>;
}

/// HTTP transport over `reqwest`
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth_header: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(config: &NotifyConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NotifyError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header: config.auth_header.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl NotifyTransport for HttpTransport {
    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Value, NotifyError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .header(self.auth_header.as_str(), self.api_key.as_str());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Transport(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        response.json().await.map_err(|e| {
            NotifyError::Response(format!("POST {} returned {} without JSON: {}", url, status, e))
        })
    }
}

pub struct Notifier {
    transport: Arc<dyn NotifyTransport>,
    retry_backoff: Duration,
    transport_backoff: Duration,
    shutdown: Arc<ShutdownSignal>,
}

impl Notifier {
    pub fn new(
        transport: Arc<dyn NotifyTransport>,
        config: &NotifyConfig,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            transport,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            transport_backoff: Duration::from_millis(config.transport_backoff_ms),
            shutdown,
        }
    }

    /// Report a relevant transaction. Returns once the ledger answers
    /// `status: success`; only shutdown ends the retry loop early.
    pub async fn walletnotify(&self, symbol: &str, txid: &str) -> Result<(), NotifyError> {
        let path = format!("walletnotify/{}/{}", symbol, txid);
        let mut attempt = 0u64;

        loop {
            if self.shutdown.is_shutdown_requested() {
                return Err(NotifyError::Cancelled);
            }
            attempt += 1;

            let backoff = match self.transport.post(&path, None).await {
                Ok(reply) if reply.get("status").and_then(Value::as_str) == Some("success") => {
                    info!("walletnotify {} {} delivered (attempt {})", symbol, txid, attempt);
                    return Ok(());
                }
                Ok(reply) => {
                    warn!(
                        "walletnotify {} {} not accepted (attempt {}): {}",
                        symbol, txid, attempt, reply
                    );
                    self.retry_backoff
                }
                Err(NotifyError::Transport(e)) => {
                    warn!(
                        "walletnotify {} {} transport failure (attempt {}): {}",
                        symbol, txid, attempt, e
                    );
                    self.transport_backoff
                }
                Err(e) => {
                    warn!(
                        "walletnotify {} {} failed (attempt {}): {}",
                        symbol, txid, attempt, e
                    );
                    self.retry_backoff
                }
            };

            if !self.shutdown.sleep(backoff).await {
                return Err(NotifyError::Cancelled);
            }
        }
    }

    /// Report a completed payout. Retried on transport failure only; any
    /// reply from the ledger ends the call.
    pub async fn payoutnotify(&self, symbol: &str, payload: &Value) -> Result<Value, NotifyError> {
        let path = format!("payoutnotify/{}", symbol);

        loop {
            if self.shutdown.is_shutdown_requested() {
                return Err(NotifyError::Cancelled);
            }

            match self.transport.post(&path, Some(payload)).await {
                Ok(reply) => {
                    info!("payoutnotify {} answered: {}", symbol, reply);
                    return Ok(reply);
                }
                Err(NotifyError::Transport(e)) => {
                    warn!("payoutnotify {} transport failure: {}", symbol, e);
                }
                Err(e) => return Err(e),
            }

            if !self.shutdown.sleep(self.transport_backoff).await {
                return Err(NotifyError::Cancelled);
            }
        }
    }
}

/// Drains the notification outbox with bounded parallelism
pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    notifier: Arc<Notifier>,
    concurrency: usize,
    poll_interval: Duration,
    shutdown: Arc<ShutdownSignal>,
}

impl OutboxDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        notifier: Arc<Notifier>,
        concurrency: usize,
        poll_interval: Duration,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            outbox,
            notifier,
            concurrency: concurrency.max(1),
            poll_interval,
            shutdown,
        }
    }

    /// Deliver one page of pending notifications; returns how many were delivered
    pub async fn dispatch_once(&self) -> Result<usize, StoreError> {
        let pending = self.outbox.pending(self.concurrency * 16).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        debug!("Dispatching {} pending notifications", pending.len());

        let notifier = &self.notifier;
        let mut deliveries = stream::iter(pending)
            .map(|entry| async move {
                let result = notifier.walletnotify(&entry.symbol, &entry.txid).await;
                (entry, result)
            })
            .buffer_unordered(self.concurrency);

        let mut delivered = 0;
        while let Some((entry, result)) = deliveries.next().await {
            match result {
                Ok(()) => {
                    self.outbox.mark_delivered(entry.id).await?;
                    delivered += 1;
                }
                Err(NotifyError::Cancelled) => {
                    debug!("Delivery of {} {} cancelled", entry.symbol, entry.txid);
                }
                Err(e) => {
                    error!("Delivery of {} {} failed: {}", entry.symbol, entry.txid, e);
                }
            }
        }

        Ok(delivered)
    }

    pub async fn run(&self) {
        info!(
            "Outbox dispatcher started, concurrency {}",
            self.concurrency
        );

        while !self.shutdown.is_shutdown_requested() {
            let delivered = match self.dispatch_once().await {
                Ok(delivered) => delivered,
                Err(e) => {
                    error!("Outbox poll failed: {}", e);
                    0
                }
            };

            if delivered == 0 && !self.shutdown.sleep(self.poll_interval).await {
                break;
            }
        }

        info!("Outbox dispatcher stopped");
    }
}
