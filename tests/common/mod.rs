//! Shared fake control-plane harness for the integration tests. Mirrors
//! `sem_os_server/tests/authoring_http_integration.rs`'s pattern of
//! standing up a real in-process `axum` server and driving requests
//! against it, rather than mocking at the `reqwest` layer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde_json::json;

pub struct ControlPlaneConfig {
    /// 200 for a normal bootstrap, 410/403 to exercise the degraded paths.
    pub bootstrap_status: u16,
    pub purpose: &'static str,
    pub frequency_secs: i64,
    pub trie_bytes: Vec<u8>,
}

struct Shared {
    cfg: ControlPlaneConfig,
    base_url: String,
}

pub async fn spawn_fake_control_plane(
    cfg: ControlPlaneConfig,
) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shared = Arc::new(Shared {
        cfg,
        base_url: format!("http://{addr}"),
    });

    let app = Router::new()
        .route("/api/v1/edl/bootstrap", post(bootstrap_handler))
        .route("/config", get(config_handler))
        .route("/trie", get(trie_handler))
        .with_state(shared);

    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    (addr, handle)
}

async fn bootstrap_handler(State(shared): State<Arc<Shared>>) -> impl IntoResponse {
    match shared.cfg.bootstrap_status {
        410 => (StatusCode::GONE, "deployment deleted").into_response(),
        403 => (StatusCode::FORBIDDEN, "deployment disabled").into_response(),
        _ => Json(json!({
            "access_token": "test-access-token",
            "expires_in_seconds": 3600,
            "config_url": format!("{}/config", shared.base_url),
            "logs_url": serde_json::Value::Null,
        }))
        .into_response(),
    }
}

async fn config_handler(State(shared): State<Arc<Shared>>) -> impl IntoResponse {
    Json(json!({
        "deployment_id": "dep-test",
        "purpose": shared.cfg.purpose,
        "update_frequency_seconds": shared.cfg.frequency_secs,
        "urls": { "combined": [format!("{}/trie", shared.base_url)] },
    }))
}

async fn trie_handler(State(shared): State<Arc<Shared>>) -> impl IntoResponse {
    shared.cfg.trie_bytes.clone()
}

pub fn make_bootstrap_token(issuer: &str) -> String {
    let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
    let payload = json!({
        "iss": issuer,
        "component_type": "ellio_traefik_middleware_plugin",
    });
    let payload_b64 =
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{payload_b64}.sig")
}
