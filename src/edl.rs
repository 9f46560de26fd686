//! EDL Updater (C5): periodic fetch-with-retry of the trie blob, atomic
//! hand-off into the matcher.
//!
//! Background-loop shape mirrors `OutboxDispatcher::run` (sleep-on-idle,
//! `tokio::select!` against a shutdown signal) and
//! `bpmn_integration::worker::JobWorker::run` (separate, longer backoff on
//! error than on idle).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify, RwLock};

use crate::error::{truncate_body, EdlError};
use crate::matcher::Matcher;
use crate::trie::Trie;

const DEFAULT_FREQUENCY: Duration = Duration::from_secs(5 * 60);
const MAX_FETCH_ATTEMPTS: u32 = 3;
const RETRY_STEP: Duration = Duration::from_secs(2);

pub struct EdlUpdater {
    client: reqwest::Client,
    matcher: Arc<Matcher>,
    url: RwLock<String>,
    frequency: RwLock<Duration>,
    last_update: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    update_count: AtomicU64,
    reconfigure: Notify,
}

impl EdlUpdater {
    pub fn new(client: reqwest::Client, matcher: Arc<Matcher>, url: String, frequency_secs: i64) -> Self {
        Self {
            client,
            matcher,
            url: RwLock::new(url),
            frequency: RwLock::new(normalize_frequency(frequency_secs)),
            last_update: RwLock::new(None),
            last_error: RwLock::new(None),
            update_count: AtomicU64::new(0),
            reconfigure: Notify::new(),
        }
    }

    /// Requires a non-empty URL; runs one `update_now` and surfaces its
    /// error upward without entering the loop.
    pub async fn start(&self) -> Result<(), EdlError> {
        if self.url.read().await.trim().is_empty() {
            return Err(EdlError::EdlFetch {
                status: 0,
                body: "no EDL URL configured".into(),
            });
        }
        self.update_now().await
    }

    pub async fn update_now(&self) -> Result<(), EdlError> {
        self.update_now_cancellable(None).await
    }

    async fn update_now_cancellable(
        &self,
        shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<(), EdlError> {
        match self.fetch_with_retry(shutdown).await {
            Ok(bytes) => match Trie::load(&bytes) {
                Ok((trie, approx)) => {
                    self.matcher.update(trie, approx);
                    *self.last_update.write().await = Some(Utc::now());
                    *self.last_error.write().await = None;
                    self.update_count.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(e) => {
                    *self.last_error.write().await = Some(e.to_string());
                    Err(e)
                }
            },
            Err(e) => {
                *self.last_error.write().await = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn fetch(&self) -> Result<Vec<u8>, EdlError> {
        let url = self.url.read().await.clone();
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = truncate_body(&resp.text().await.unwrap_or_default());
            return Err(EdlError::EdlFetch {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn fetch_with_retry(
        &self,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<Vec<u8>, EdlError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.fetch().await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < MAX_FETCH_ATTEMPTS => {
                    tracing::warn!(attempt, error = %e, "EDL fetch attempt failed, retrying");
                    let delay = RETRY_STEP * attempt;
                    match shutdown.as_deref_mut() {
                        Some(rx) => {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = rx.changed() => return Err(e),
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Periodic update loop. A reconfigure wakes the loop immediately
    /// rather than waiting out the old frequency.
    pub async fn run_update_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("EDL update loop started");
        loop {
            let frequency = *self.frequency.read().await;
            tokio::select! {
                _ = tokio::time::sleep(frequency) => {}
                _ = self.reconfigure.notified() => {
                    // Loop back around and re-read the (possibly new) frequency.
                    continue;
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.update_now_cancellable(Some(&mut shutdown)).await {
                tracing::error!(error = %e, "scheduled EDL update failed, previous list remains live");
            }
        }
        tracing::info!("EDL update loop stopped");
    }

    /// Updates the stored URL/frequency, wakes the loop, and triggers an
    /// immediate out-of-band fetch.
    pub async fn reconfigure(&self, url: String, frequency_secs: i64) {
        *self.url.write().await = url;
        *self.frequency.write().await = normalize_frequency(frequency_secs);
        self.reconfigure.notify_one();
        if let Err(e) = self.update_now().await {
            tracing::warn!(error = %e, "out-of-band EDL refresh after reconfigure failed");
        }
    }

    pub async fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.read().await
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }
}

fn normalize_frequency(frequency_secs: i64) -> Duration {
    if frequency_secs <= 0 {
        DEFAULT_FREQUENCY
    } else {
        Duration::from_secs(frequency_secs as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::{encode, v4};

    #[tokio::test]
    async fn start_fails_on_empty_url() {
        let updater = EdlUpdater::new(
            reqwest::Client::new(),
            Arc::new(Matcher::empty()),
            String::new(),
            300,
        );
        assert!(updater.start().await.is_err());
    }

    #[test]
    fn zero_or_negative_frequency_defaults_to_five_minutes() {
        assert_eq!(normalize_frequency(0), DEFAULT_FREQUENCY);
        assert_eq!(normalize_frequency(-5), DEFAULT_FREQUENCY);
        assert_eq!(normalize_frequency(60), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn update_now_loads_bytes_into_matcher() {
        let matcher = Arc::new(Matcher::empty());
        let updater = EdlUpdater::new(
            reqwest::Client::new(),
            Arc::clone(&matcher),
            String::new(),
            300,
        );
        let bytes = encode(&[v4(203, 0, 113, 0, 24)]);
        let (trie, approx) = Trie::load(&bytes).unwrap();
        matcher.update(trie, approx);
        assert!(matcher.contains("203.0.113.9"));
        assert_eq!(updater.update_count(), 0);
    }
}
