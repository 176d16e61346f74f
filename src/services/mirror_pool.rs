use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::manifest::chunk::Chunk;
use crate::manifest::reader::sha1_digest;
use crate::services::repository::ManifestRepository;
use crate::services::CancelToken;
use crate::utils::env_u64;

const DEFAULT_RETRY_BACKOFF_MS: u64 = 5_000;
const CANCEL_POLL_MS: u64 = 100;

// Exponentially weighted average: heavy history, light sample.
const EWMA_SAMPLE_WEIGHT: f64 = 0.3;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MirrorStats {
    pub base_url: String,
    pub failures: u32,
    pub average_bps: f64,
    pub last_attempt: Option<i64>,
}

impl MirrorStats {
    fn new(base_url: String) -> Self {
        Self {
            base_url,
            failures: 0,
            average_bps: 0.0,
            last_attempt: None,
        }
    }
}

/// Mirror-aware chunk fetcher. Tracks per-mirror throughput and failure
/// counts and walks mirrors fastest-first with fallback.
#[derive(Clone)]
pub struct MirrorPool {
    repository: Arc<dyn ManifestRepository>,
    stats: Arc<Mutex<Vec<MirrorStats>>>,
    retry_backoff: Duration,
    max_passes: Option<usize>,
}

impl MirrorPool {
    pub fn new(repository: Arc<dyn ManifestRepository>, base_urls: Vec<String>) -> Self {
        let backoff_ms = env_u64("CHUNKFORGE_RETRY_BACKOFF_MS").unwrap_or(DEFAULT_RETRY_BACKOFF_MS);
        let stats = base_urls
            .into_iter()
            .map(|url| MirrorStats::new(url.trim_end_matches('/').to_string()))
            .collect();
        Self {
            repository,
            stats: Arc::new(Mutex::new(stats)),
            retry_backoff: Duration::from_millis(backoff_ms),
            max_passes: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Bound the retry loop to `passes` full sweeps over the mirror list.
    /// The default is unbounded: availability wins over timeliness and the
    /// caller provides the deadline via cancellation.
    pub fn with_max_passes(mut self, passes: usize) -> Self {
        self.max_passes = Some(passes);
        self
    }

    /// Mirrors ordered by descending average speed, ties broken by ascending
    /// failure count. Deterministic for a fixed stats snapshot.
    pub fn prioritize(&self) -> Vec<MirrorStats> {
        let mut snapshot = self
            .stats
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        snapshot.sort_by(|a, b| {
            b.average_bps
                .partial_cmp(&a.average_bps)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.failures.cmp(&b.failures))
        });
        snapshot
    }

    pub fn record_success(&self, base_url: &str, measured_bps: f64) {
        if let Ok(mut guard) = self.stats.lock() {
            if let Some(stats) = guard.iter_mut().find(|s| s.base_url == base_url) {
                stats.average_bps = if stats.average_bps == 0.0 {
                    measured_bps
                } else {
                    EWMA_SAMPLE_WEIGHT * measured_bps
                        + (1.0 - EWMA_SAMPLE_WEIGHT) * stats.average_bps
                };
                stats.last_attempt = Some(chrono::Utc::now().timestamp());
            }
        }
    }

    pub fn record_failure(&self, base_url: &str) {
        if let Ok(mut guard) = self.stats.lock() {
            if let Some(stats) = guard.iter_mut().find(|s| s.base_url == base_url) {
                stats.failures = stats.failures.saturating_add(1);
                stats.last_attempt = Some(chrono::Utc::now().timestamp());
            }
        }
    }

    /// One pass over the prioritized mirrors. A response whose payload does
    /// not hash to `expected_sha` counts as a mirror failure and falls
    /// through to the next mirror. Fails only when every mirror failed in
    /// this pass.
    pub async fn fetch_chunk(
        &self,
        relative_path: &str,
        expected_sha: Option<&[u8; 20]>,
    ) -> Result<Vec<u8>> {
        let mirrors = self.prioritize();
        if mirrors.is_empty() {
            return Err(EngineError::Network("no mirrors configured".to_string()));
        }

        for mirror in &mirrors {
            let url = format!("{}/{}", mirror.base_url, relative_path);
            let started = Instant::now();
            match self.repository.fetch_bytes(&url).await {
                Ok(bytes) => {
                    if let Some(expected) = expected_sha {
                        if let Err(err) = validate_chunk_payload(&bytes, expected) {
                            self.record_failure(&mirror.base_url);
                            tracing::warn!("corrupt chunk from mirror url={} error={}", url, err);
                            continue;
                        }
                    }
                    let elapsed = started.elapsed().as_secs_f64().max(0.001);
                    let bps = bytes.len() as f64 / elapsed;
                    self.record_success(&mirror.base_url, bps);
                    return Ok(bytes);
                }
                Err(err) => {
                    self.record_failure(&mirror.base_url);
                    tracing::warn!(
                        "mirror fetch failed url={} failures={} error={}",
                        url,
                        mirror.failures + 1,
                        err
                    );
                }
            }
        }

        Err(EngineError::Network(format!(
            "all {} mirrors failed for {}",
            mirrors.len(),
            relative_path
        )))
    }

    /// Repeats full mirror passes with a fixed backoff between them until a
    /// pass succeeds, the pass ceiling is hit, or the caller cancels.
    pub async fn fetch_with_retry(
        &self,
        relative_path: &str,
        expected_sha: Option<&[u8; 20]>,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        let mut passes = 0_usize;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            match self.fetch_chunk(relative_path, expected_sha).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    passes += 1;
                    if let Some(limit) = self.max_passes {
                        if passes >= limit {
                            return Err(EngineError::Network(format!(
                                "giving up on {relative_path} after {passes} passes: {err}"
                            )));
                        }
                    }
                    tracing::warn!(
                        "retrying {} after failed pass {}: {}",
                        relative_path,
                        passes,
                        err
                    );
                }
            }

            let mut waited = Duration::ZERO;
            while waited < self.retry_backoff {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                let step = Duration::from_millis(CANCEL_POLL_MS);
                tokio::time::sleep(step).await;
                waited += step;
            }
        }
    }
}

fn validate_chunk_payload(bytes: &[u8], expected: &[u8; 20]) -> Result<()> {
    let chunk = Chunk::parse(bytes)?;
    let payload = chunk.payload()?;
    if sha1_digest(payload) != *expected {
        return Err(EngineError::Integrity(
            "chunk payload SHA-1 does not match its directory entry".to_string(),
        ));
    }
    Ok(())
}
