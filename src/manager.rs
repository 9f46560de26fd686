//! Manager (C7): the process-wide singleton that owns the token manager,
//! EDL updater, matcher, and event shipper, and sequences their lifecycle.
//!
//! `tokio::sync::OnceCell::get_or_try_init` gives exactly the semantics
//! needed here: the first initialization attempt runs to completion, and
//! concurrent subsequent calls observe the cached instance. It is the
//! async analogue of a `std::sync::OnceLock`-based singleton, upgraded to
//! `tokio::sync::OnceCell` because initialization itself is `async` (it
//! makes network calls).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{watch, OnceCell, RwLock};

use crate::block_event::{BlockEvent, EventPool};
use crate::config::{EdlGuardConfig, IpStrategy};
use crate::edl::EdlUpdater;
use crate::error::{truncate_body, EdlError};
use crate::matcher::Matcher;
use crate::shipper::{BatchMetadata, EventShipper, ShipperConfig};
use crate::token::{BootstrapOutcome, ConfigRecheck, TokenManager};
use crate::trusted_proxy::TrustedProxySet;

const DISABLED_RETRY_INTERVAL: Duration = Duration::from_secs(60);

static MANAGER: OnceCell<Arc<Manager>> = OnceCell::const_new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Allowlist,
    Blocklist,
}

impl Mode {
    fn from_purpose(purpose: &str) -> Self {
        // "allowlist" selects allowlist mode; every other value, including
        // the "other"/"others" blocklist synonyms observed from the control
        // plane, collapses to blocklist.
        if purpose == "allowlist" {
            Mode::Allowlist
        } else {
            Mode::Blocklist
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    Enabled,
    TemporarilyDisabled,
    Deleted,
}

#[derive(Debug, Deserialize)]
struct EdlConfigUrls {
    combined: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EdlConfigResponse {
    #[allow(dead_code)]
    deployment_id: String,
    purpose: String,
    update_frequency_seconds: i64,
    urls: Option<EdlConfigUrls>,
}

/// Read-only observability snapshot. Not an administrative API: no call
/// here can change behavior, only report it.
#[derive(Debug, Clone)]
pub struct ManagerSnapshot {
    pub deployment_state: DeploymentState,
    pub mode: Mode,
    pub update_count: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub approx_entry_count: u32,
    pub shipper_dropped: u64,
    pub shipper_shipped_batches: u64,
    pub shipper_shipped_events: u64,
}

pub struct Manager {
    client: reqwest::Client,
    token_manager: Arc<TokenManager>,
    matcher: Arc<Matcher>,
    updater: RwLock<Option<Arc<EdlUpdater>>>,
    shipper: RwLock<Option<Arc<EventShipper>>>,
    pool: Arc<EventPool>,
    mode: RwLock<Mode>,
    state: RwLock<DeploymentState>,
    disabled_check_time: RwLock<Option<DateTime<Utc>>>,
    machine_id: String,
    ip_strategy: IpStrategy,
    trusted_header: String,
    trusted_proxies: Vec<String>,
    trusted_set: TrustedProxySet,
    shutdown_tx: watch::Sender<bool>,
}

impl Manager {
    /// Returns the cached singleton, initializing it on the very first
    /// call. Subsequent calls with a different `config` still return the
    /// original instance: re-initialization is intentionally refused.
    pub async fn get_or_init(config: EdlGuardConfig) -> Result<Arc<Manager>, EdlError> {
        MANAGER
            .get_or_try_init(|| async { Manager::init(config).await })
            .await
            .map(Arc::clone)
    }

    /// Returns the singleton if already initialized, without attempting
    /// initialization. Dispatcher step 1 ("retrieve the manager; if nil,
    /// pass through") uses this.
    pub fn get() -> Option<Arc<Manager>> {
        MANAGER.get().map(Arc::clone)
    }

    async fn init(config: EdlGuardConfig) -> Result<Arc<Manager>, EdlError> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(EdlError::Transport)?;

        let token_manager = Arc::new(TokenManager::new(
            client.clone(),
            config.bootstrap_token.clone(),
            config.machine_id.clone(),
        )?);

        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let trusted_set = TrustedProxySet::parse(&config.trusted_proxies);

        let manager = Arc::new(Manager {
            client: client.clone(),
            token_manager: Arc::clone(&token_manager),
            matcher: Arc::new(Matcher::empty()),
            updater: RwLock::new(None),
            shipper: RwLock::new(None),
            pool: Arc::new(EventPool::new()),
            mode: RwLock::new(Mode::Blocklist),
            state: RwLock::new(DeploymentState::Enabled),
            disabled_check_time: RwLock::new(None),
            machine_id: config.machine_id.clone(),
            ip_strategy: config.ip_strategy,
            trusted_header: config.trusted_header.clone(),
            trusted_proxies: config.trusted_proxies.clone(),
            trusted_set,
            shutdown_tx,
        });

        match token_manager.bootstrap().await {
            Ok(outcome) => {
                manager.apply_bootstrap_outcome(&outcome).await;
            }
            Err(EdlError::PermanentlyDeleted) => {
                tracing::warn!("deployment deleted at initial bootstrap, passing through indefinitely");
                *manager.state.write().await = DeploymentState::Deleted;
                manager.spawn_token_refresh_loop();
                return Ok(manager);
            }
            Err(EdlError::TemporarilyDisabled { body }) => {
                tracing::warn!(body, "deployment temporarily disabled at initial bootstrap");
                manager.enter_temporarily_disabled().await;
                manager.spawn_token_refresh_loop();
                manager.spawn_disabled_retry_supervisor();
                return Ok(manager);
            }
            Err(e) => return Err(e),
        }

        manager.spawn_token_refresh_loop();
        Ok(manager)
    }

    /// Runs the remainder of the initialization order for a deployment
    /// that successfully bootstrapped: shipper (if a logs URL was
    /// returned), config fetch, and EDL updater plus its background loop.
    async fn apply_bootstrap_outcome(self: &Arc<Self>, outcome: &BootstrapOutcome) {
        *self.state.write().await = DeploymentState::Enabled;

        if let Some(logs_url) = outcome.logs_url.clone().filter(|u| !u.is_empty()) {
            self.start_shipper(logs_url).await;
        }

        self.refresh_edl_config(outcome).await;
    }

    async fn start_shipper(self: &Arc<Self>, logs_url: String) {
        let metadata = BatchMetadata {
            device_id: self.machine_id.clone(),
            ip_strategy: ip_strategy_label(self.ip_strategy).to_string(),
            trusted_header: if self.trusted_header.is_empty() {
                None
            } else {
                Some(self.trusted_header.clone())
            },
            trusted_proxies: if self.trusted_proxies.is_empty() {
                None
            } else {
                Some(self.trusted_proxies.clone())
            },
        };
        let shipper = Arc::new(EventShipper::new(
            self.client.clone(),
            logs_url,
            Arc::clone(&self.token_manager),
            metadata,
            Arc::clone(&self.pool),
            ShipperConfig::default(),
        ));
        tokio::spawn(Arc::clone(&shipper).run_worker(self.shutdown_tx.subscribe()));
        *self.shipper.write().await = Some(shipper);
    }

    /// Fetches `{config_url}` with the freshly minted access token and
    /// applies it: a no-op if the config is missing a usable URL, otherwise
    /// (re)configures the EDL updater and, on first construction, spawns
    /// its background loop.
    async fn refresh_edl_config(self: &Arc<Self>, outcome: &BootstrapOutcome) {
        let resp = self
            .client
            .get(&outcome.config_url)
            .bearer_auth(&outcome.access_token)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "EDL config fetch request failed, will retry on next refresh");
                return;
            }
        };

        let status = resp.status();
        if status.as_u16() == 410 {
            tracing::warn!("EDL config fetch observed permanent deletion");
            *self.state.write().await = DeploymentState::Deleted;
            return;
        }
        if status.as_u16() == 403 {
            let body = truncate_body(&resp.text().await.unwrap_or_default());
            tracing::warn!(body, "EDL config fetch observed temporary disable");
            self.enter_temporarily_disabled().await;
            self.spawn_disabled_retry_supervisor();
            return;
        }
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "EDL config fetch failed, logged and ignored until next scheduled attempt");
            return;
        }

        let parsed: EdlConfigResponse = match resp.json().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "EDL config body could not be parsed");
                return;
            }
        };

        let url = parsed
            .urls
            .as_ref()
            .and_then(|u| u.combined.first())
            .cloned()
            .unwrap_or_default();
        if url.is_empty() {
            tracing::debug!("EDL config has no trie URL, treated as a no-op trigger");
            return;
        }

        *self.mode.write().await = Mode::from_purpose(&parsed.purpose);

        let existing = self.updater.read().await.clone();
        match existing {
            Some(updater) => {
                updater.reconfigure(url, parsed.update_frequency_seconds).await;
            }
            None => {
                let updater = Arc::new(EdlUpdater::new(
                    self.client.clone(),
                    Arc::clone(&self.matcher),
                    url,
                    parsed.update_frequency_seconds,
                ));
                if let Err(e) = updater.start().await {
                    tracing::error!(error = %e, "initial EDL fetch failed, will retry on the update loop's own schedule");
                }
                tokio::spawn(Arc::clone(&updater).run_update_loop(self.shutdown_tx.subscribe()));
                *self.updater.write().await = Some(updater);
            }
        }
    }

    async fn enter_temporarily_disabled(self: &Arc<Self>) {
        *self.state.write().await = DeploymentState::TemporarilyDisabled;
        *self.disabled_check_time.write().await = Some(Utc::now() + chrono::Duration::minutes(1));
    }

    fn spawn_token_refresh_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let token_manager = Arc::clone(&self.token_manager);
        let shutdown = self.shutdown_tx.subscribe();
        let check_manager = Arc::clone(self);
        tokio::spawn(
            Arc::clone(&token_manager).run_refresh_loop(
                manager,
                move || {
                    check_manager
                        .state
                        .try_read()
                        .map(|s| matches!(*s, DeploymentState::Deleted))
                        .unwrap_or(false)
                },
                shutdown,
            ),
        );
    }

    /// Retries bootstrap once per minute while disabled.
    fn spawn_disabled_retry_supervisor(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DISABLED_RETRY_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => return,
                }
                if *shutdown.borrow() {
                    return;
                }
                if !matches!(*manager.state.read().await, DeploymentState::TemporarilyDisabled) {
                    return;
                }
                let due = manager
                    .disabled_check_time
                    .read()
                    .await
                    .map(|t| Utc::now() >= t)
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                match manager.token_manager.bootstrap().await {
                    Ok(outcome) => {
                        tracing::info!("disabled-retry bootstrap succeeded, re-enabling");
                        *manager.state.write().await = DeploymentState::Enabled;
                        manager.apply_bootstrap_outcome(&outcome).await;
                        return;
                    }
                    Err(EdlError::PermanentlyDeleted) => {
                        tracing::warn!("disabled-retry observed permanent deletion");
                        *manager.state.write().await = DeploymentState::Deleted;
                        return;
                    }
                    Err(EdlError::TemporarilyDisabled { .. }) => {
                        *manager.disabled_check_time.write().await =
                            Some(Utc::now() + chrono::Duration::minutes(1));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "disabled-retry bootstrap failed, extending check time");
                        *manager.disabled_check_time.write().await =
                            Some(Utc::now() + chrono::Duration::minutes(1));
                    }
                }
            }
        });
    }

    /// `allowed = (mode == blocklist) XOR in_list`.
    pub async fn is_ip_allowed(&self, ip_text: &str) -> Result<bool, EdlError> {
        if !matches!(*self.state.read().await, DeploymentState::Enabled) {
            return Ok(true);
        }
        if ip_text.parse::<std::net::IpAddr>().is_err() {
            return Err(EdlError::InvalidIp(ip_text.to_string()));
        }
        let in_list = self.matcher.contains(ip_text);
        let mode_is_blocklist = matches!(*self.mode.read().await, Mode::Blocklist);
        Ok(mode_is_blocklist ^ in_list)
    }

    pub async fn is_enabled(&self) -> bool {
        matches!(*self.state.read().await, DeploymentState::Enabled)
    }

    pub async fn mode(&self) -> Mode {
        *self.mode.read().await
    }

    pub fn ip_strategy(&self) -> IpStrategy {
        self.ip_strategy
    }

    pub fn trusted_header(&self) -> &str {
        &self.trusted_header
    }

    pub fn trusted_proxies(&self) -> &[String] {
        &self.trusted_proxies
    }

    pub fn trusted_set(&self) -> &TrustedProxySet {
        &self.trusted_set
    }

    pub fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    /// Fire-and-forget enqueue; `false` means the shipper isn't running
    /// (no logs URL was ever configured) or has shut down.
    pub async fn submit_block_event(&self, event: BlockEvent) -> bool {
        match self.shipper.read().await.as_ref() {
            Some(shipper) => shipper.submit(event),
            None => false,
        }
    }

    pub async fn snapshot(&self) -> ManagerSnapshot {
        let updater = self.updater.read().await.clone();
        let shipper = self.shipper.read().await.clone();
        ManagerSnapshot {
            deployment_state: *self.state.read().await,
            mode: *self.mode.read().await,
            update_count: updater.as_ref().map(|u| u.update_count()).unwrap_or(0),
            last_update: match &updater {
                Some(u) => u.last_update().await,
                None => None,
            },
            last_error: match &updater {
                Some(u) => u.last_error().await,
                None => None,
            },
            approx_entry_count: self.matcher.approx_entry_count(),
            shipper_dropped: shipper
                .as_ref()
                .map(|s| s.stats.dropped.load(Ordering::Relaxed))
                .unwrap_or(0),
            shipper_shipped_batches: shipper
                .as_ref()
                .map(|s| s.stats.shipped_batches.load(Ordering::Relaxed))
                .unwrap_or(0),
            shipper_shipped_events: shipper
                .as_ref()
                .map(|s| s.stats.shipped_events.load(Ordering::Relaxed))
                .unwrap_or(0),
        }
    }

    /// Tears down every background task. Primarily exercised by tests,
    /// since the embedding host otherwise lets the process exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[async_trait]
impl ConfigRecheck for Manager {
    async fn recheck(&self, outcome: &BootstrapOutcome) {
        // `refresh_edl_config` takes `&Arc<Self>`, but the trait hands us
        // `&self`; the call is only ever made through the `Arc` stored in
        // `MANAGER`, so reconstructing one here is safe and cheap (it just
        // bumps the refcount) rather than a real allocation.
        if let Some(arc_self) = MANAGER.get() {
            arc_self.refresh_edl_config(outcome).await;
        }
    }
}

fn ip_strategy_label(strategy: IpStrategy) -> &'static str {
    match strategy {
        IpStrategy::Direct => "direct",
        IpStrategy::XForwardedFor => "xff",
        IpStrategy::RealIp => "real-ip",
        IpStrategy::Custom => "custom",
    }
}
