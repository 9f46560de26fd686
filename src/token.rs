//! Token Manager (C4): bootstrap token parsing, bootstrap call against the
//! control plane, and the scheduled refresh loop.
//!
//! Grounded in `sem_os_client::http::HttpClient` for the request/response
//! shape (bearer auth, status-based error mapping) and in
//! `bpmn_integration::worker::JobWorker::run` for the `tokio::select!`
//! sleep-or-shutdown background-loop shape.
//!
//! The JWT payload is decoded by hand (split on `.`, base64-url decode the
//! middle segment, parse as JSON) rather than via `jsonwebtoken`, even
//! though that crate is used elsewhere (`sem_os_server`):
//! `jsonwebtoken::decode` validates a signature by construction, and this
//! token must explicitly NOT be signature-checked. It is an opaque
//! credential relayed unmodified to the control plane, which is the trust
//! anchor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::error::{truncate_body, EdlError};

const COMPONENT_TYPE: &str = "ellio_traefik_middleware_plugin";
const COMPONENT_VERSION: &str = "1.0.0";
const REFRESH_MIN_DELAY: Duration = Duration::from_secs(30);
const REFRESH_FAILURE_BACKOFF: Duration = Duration::from_secs(30);

/// Claims lifted from the bootstrap JWT's unverified payload segment.
#[derive(Debug, Clone, Deserialize)]
struct BootstrapClaims {
    iss: String,
    component_type: String,
    #[allow(dead_code)]
    deployment_id: Option<String>,
}

/// Hand-decode the middle segment of a three-part JWT. No signature
/// validation is performed, see the module doc comment.
fn decode_bootstrap_token(token: &str) -> Result<BootstrapClaims, EdlError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(EdlError::InvalidBootstrapToken(
            "expected a three-segment JWT".into(),
        ));
    }
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| EdlError::InvalidBootstrapToken(format!("bad base64 payload: {e}")))?;
    let claims: BootstrapClaims = serde_json::from_slice(&payload)
        .map_err(|e| EdlError::InvalidBootstrapToken(format!("bad JSON payload: {e}")))?;
    url::Url::parse(&claims.iss)
        .map_err(|e| EdlError::InvalidBootstrapToken(format!("iss is not a valid URL: {e}")))?;
    if claims.component_type != COMPONENT_TYPE {
        return Err(EdlError::InvalidBootstrapToken(format!(
            "unexpected component_type: {}",
            claims.component_type
        )));
    }
    Ok(claims)
}

#[derive(Debug, Serialize)]
struct BootstrapRequest<'a> {
    bootstrap_token: &'a str,
    component_type: &'a str,
    component_version: &'a str,
    machine_id: &'a str,
    scopes: [&'static str; 2],
}

#[derive(Debug, Clone, Deserialize)]
struct BootstrapResponseBody {
    access_token: String,
    expires_in_seconds: i64,
    config_url: String,
    logs_url: Option<String>,
}

/// Outcome of a bootstrap (or refresh) attempt against the control plane.
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub config_url: String,
    pub logs_url: Option<String>,
}

#[derive(Clone)]
struct TokenState {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Invoked by the token manager after every successful refresh, carrying
/// that refresh's outcome (including the config URL it returned) so the
/// re-check always queries the config URL paired with the access token
/// that can authenticate against it.
#[async_trait]
pub trait ConfigRecheck: Send + Sync {
    async fn recheck(&self, outcome: &BootstrapOutcome);
}

pub struct TokenManager {
    client: reqwest::Client,
    issuer: String,
    bootstrap_token: String,
    machine_id: String,
    state: RwLock<Option<TokenState>>,
}

impl TokenManager {
    /// Validates the bootstrap token and derives the issuer URL. Does not
    /// perform the bootstrap HTTP call itself, see [`Self::bootstrap`].
    pub fn new(
        client: reqwest::Client,
        bootstrap_token: impl Into<String>,
        machine_id: impl Into<String>,
    ) -> Result<Self, EdlError> {
        let bootstrap_token = bootstrap_token.into();
        let claims = decode_bootstrap_token(&bootstrap_token)?;
        Ok(Self {
            client,
            issuer: strip_trailing_slash(&claims.iss),
            bootstrap_token,
            machine_id: machine_id.into(),
            state: RwLock::new(None),
        })
    }

    /// `POST {issuer}/api/v1/edl/bootstrap`.
    pub async fn bootstrap(&self) -> Result<BootstrapOutcome, EdlError> {
        let url = format!("{}/api/v1/edl/bootstrap", self.issuer);
        let body = BootstrapRequest {
            bootstrap_token: &self.bootstrap_token,
            component_type: COMPONENT_TYPE,
            component_version: COMPONENT_VERSION,
            machine_id: &self.machine_id,
            scopes: ["edl_config", "edl_logs"],
        };
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();

        if status.as_u16() == 410 {
            return Err(EdlError::PermanentlyDeleted);
        }
        if status.as_u16() == 403 {
            let body = truncate_body(&resp.text().await.unwrap_or_default());
            return Err(EdlError::TemporarilyDisabled { body });
        }
        if !status.is_success() {
            let body = truncate_body(&resp.text().await.unwrap_or_default());
            return Err(EdlError::Bootstrap {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: BootstrapResponseBody = resp.json().await?;
        let expires_at = Utc::now() + chrono::Duration::seconds(parsed.expires_in_seconds);

        let mut state = self.state.write().await;
        *state = Some(TokenState {
            access_token: parsed.access_token.clone(),
            expires_at,
        });

        Ok(BootstrapOutcome {
            access_token: parsed.access_token,
            expires_at,
            config_url: parsed.config_url,
            logs_url: parsed.logs_url,
        })
    }

    /// Current bearer token, or empty string if never bootstrapped. Callers
    /// treat an empty token as an immediate shipment failure.
    pub async fn access_token(&self) -> String {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_default()
    }

    fn next_refresh_delay(expires_at: DateTime<Utc>) -> Duration {
        let remaining = expires_at - Utc::now();
        let remaining_secs = remaining.num_milliseconds().max(0) as f64 / 1000.0;
        let scheduled = Duration::from_secs_f64((0.8 * remaining_secs).max(0.0));
        scheduled.max(REFRESH_MIN_DELAY)
    }

    /// Background refresh loop. Runs until `shutdown` fires or
    /// `deployment_deleted` reports `true`.
    pub async fn run_refresh_loop(
        self: Arc<Self>,
        recheck: Arc<dyn ConfigRecheck>,
        deployment_deleted: impl Fn() -> bool + Send + 'static,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("token refresh loop started");
        loop {
            if *shutdown.borrow() || deployment_deleted() {
                break;
            }

            let delay = {
                let state = self.state.read().await;
                match state.as_ref() {
                    Some(s) => Self::next_refresh_delay(s.expires_at),
                    None => REFRESH_MIN_DELAY,
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() || deployment_deleted() {
                break;
            }

            match self.bootstrap().await {
                Ok(outcome) => {
                    tracing::debug!("token refreshed successfully");
                    recheck.recheck(&outcome).await;
                }
                Err(EdlError::PermanentlyDeleted) => {
                    tracing::warn!("token refresh observed permanent deletion, stopping loop");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "token refresh failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(REFRESH_FAILURE_BACKOFF) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        tracing::info!("token refresh loop stopped");
    }
}

fn strip_trailing_slash(s: &str) -> String {
    s.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_token(iss: &str, component_type: &str) -> String {
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let payload = serde_json::json!({
            "iss": iss,
            "component_type": component_type,
            "deployment_id": "dep-123",
        });
        let payload_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(payload.to_string().as_bytes());
        format!("{header}.{payload_b64}.sig-is-not-checked")
    }

    #[test]
    fn decodes_valid_bootstrap_token() {
        let token = make_token("https://issuer.example/", COMPONENT_TYPE);
        let claims = decode_bootstrap_token(&token).unwrap();
        assert_eq!(claims.iss, "https://issuer.example/");
        assert_eq!(claims.deployment_id.as_deref(), Some("dep-123"));
    }

    #[test]
    fn rejects_wrong_component_type() {
        let token = make_token("https://issuer.example", "something_else");
        assert!(decode_bootstrap_token(&token).is_err());
    }

    #[test]
    fn rejects_malformed_segments() {
        assert!(decode_bootstrap_token("only.two").is_err());
        assert!(decode_bootstrap_token("not-a-jwt-at-all").is_err());
    }

    #[test]
    fn strips_trailing_slash_from_issuer() {
        assert_eq!(strip_trailing_slash("https://x.example/"), "https://x.example");
        assert_eq!(strip_trailing_slash("https://x.example"), "https://x.example");
    }

    #[test]
    fn refresh_delay_is_clamped_to_minimum() {
        let soon = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(TokenManager::next_refresh_delay(soon), REFRESH_MIN_DELAY);
    }

    #[test]
    fn refresh_delay_is_eighty_percent_of_remaining() {
        let later = Utc::now() + chrono::Duration::seconds(1000);
        let delay = TokenManager::next_refresh_delay(later);
        assert!(delay.as_secs() >= 790 && delay.as_secs() <= 800);
    }
}
