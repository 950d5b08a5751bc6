//! Background upload of completed sessions.
//!
//! Drains due entries of the [`SyncQueue`] with bounded concurrency. A
//! successful POST removes the entry; any failure requeues it with
//! exponential backoff. Entries that run out of attempts stay in the queue
//! but are no longer picked up.

use std::time::{Duration, Instant};

use base64::Engine;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;

use crate::config::SyncConfig;
use crate::error::{HeatlineError, Result};
use crate::persistence::{QueuedSession, SyncQueue};
use crate::session::now_millis;

/// Largest number of entries taken from the queue per pass.
const BATCH_LIMIT: usize = 64;

/// Outcome of one upload pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub uploaded: usize,
    /// Requeued for a later retry
    pub failed: usize,
    /// Failed and out of attempts
    pub exhausted: usize,
}

/// HTTP uploader for queued sessions.
pub struct SessionUploader {
    client: Client,
    url: String,
    auth_header: Option<String>,
    config: SyncConfig,
}

impl SessionUploader {
    /// Fails with `InvalidConfig` when no endpoint is configured.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| HeatlineError::config("sync endpoint is not configured"))?;
        let url = format!("{}/sessions", endpoint.trim_end_matches('/'));

        let auth_header = config.api_key.as_ref().map(|key| {
            let auth = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{}", key));
            format!("Basic {}", auth)
        });

        let client = Client::builder()
            .pool_max_idle_per_host(config.concurrency.max(1))
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| HeatlineError::Http {
                message: format!("Failed to create HTTP client: {}", e),
                status_code: None,
            })?;

        Ok(Self {
            client,
            url,
            auth_header,
            config,
        })
    }

    /// Upload every due entry once.
    pub async fn upload_due(&self, queue: &SyncQueue) -> Result<SyncReport> {
        let now = now_millis();
        let entries = queue.due(now, self.config.max_attempts, BATCH_LIMIT)?;
        if entries.is_empty() {
            return Ok(SyncReport::default());
        }

        info!(
            "[Uploader] Uploading {} sessions with {} concurrent requests",
            entries.len(),
            self.config.concurrency
        );
        let start = Instant::now();

        let results: Vec<(QueuedSession, Result<()>)> = stream::iter(entries)
            .map(|entry| async move {
                let result = self.post(&entry.payload).await;
                (entry, result)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = SyncReport {
            attempted: results.len(),
            ..SyncReport::default()
        };

        for (entry, result) in results {
            match result {
                Ok(()) => {
                    queue.mark_uploaded(entry.id)?;
                    report.uploaded += 1;
                    debug!("[Uploader] Uploaded session {}", entry.session_id);
                }
                Err(e) => {
                    let attempts = entry.attempts + 1;
                    let delay_ms = self.config.backoff_secs(attempts).saturating_mul(1000);
                    let next = now_millis().saturating_add(delay_ms as i64);
                    queue.mark_failed(entry.id, &e.to_string(), next)?;

                    if attempts >= self.config.max_attempts {
                        report.exhausted += 1;
                        warn!(
                            "[Uploader] Giving up on session {} after {} attempts: {}",
                            entry.session_id, attempts, e
                        );
                    } else {
                        report.failed += 1;
                        warn!(
                            "[Uploader] Session {} failed (attempt {}), retry in {}s: {}",
                            entry.session_id,
                            attempts,
                            delay_ms / 1000,
                            e
                        );
                    }
                }
            }
        }

        info!(
            "[Uploader] Completed: {}/{} uploaded in {:.2}s",
            report.uploaded,
            report.attempted,
            start.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    async fn post(&self, payload: &str) -> Result<()> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_string());
        if let Some(auth) = &self.auth_header {
            request = request.header(AUTHORIZATION, auth);
        }

        let response = request.send().await.map_err(|e| HeatlineError::Http {
            message: e.to_string(),
            status_code: None,
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(HeatlineError::Http {
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
                status_code: Some(status.as_u16()),
            })
        }
    }
}

/// Blocking wrapper for callers without an async runtime.
pub fn upload_due_sync(config: SyncConfig, queue: &SyncQueue) -> Result<SyncReport> {
    use tokio::runtime::Runtime;

    let rt = Runtime::new().map_err(|e| HeatlineError::Internal {
        message: format!("Failed to create tokio runtime: {}", e),
    })?;
    let uploader = SessionUploader::new(config)?;
    rt.block_on(uploader.upload_due(queue))
}
