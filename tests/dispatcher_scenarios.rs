//! End-to-end dispatcher scenarios, driven against a real in-process fake
//! control plane and a real `edl_guard::EdlGuardLayer` wrapping a trivial
//! handler, via `tower::util::ServiceExt::oneshot`.

mod common;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use edl_guard::config::IpStrategy;
use edl_guard::trie::{encode, v4};
use edl_guard::{EdlGuardConfig, EdlGuardLayer, Manager};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use common::{make_bootstrap_token, spawn_fake_control_plane, ControlPlaneConfig};

fn app() -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .layer(EdlGuardLayer::new())
}

fn request_from(peer: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri("/");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let peer_addr: std::net::SocketAddr = format!("{peer}:12345").parse().unwrap();
    builder
        .extension(ConnectInfo(peer_addr))
        .body(Body::empty())
        .unwrap()
}

/// Scenarios 1, 2, 4, 5 all share one manager: a blocklist trie over
/// `203.0.113.0/24`, `xff` strategy, with `10.0.0.0/8` as the only trusted
/// proxy range. Untrusted peers always decide on their own address
/// regardless of what they claim via `X-Forwarded-For`.
#[tokio::test]
async fn blocklist_and_forwarded_header_scenarios() {
    let trie_bytes = encode(&[v4(203, 0, 113, 0, 24)]);
    let (addr, _server) = spawn_fake_control_plane(ControlPlaneConfig {
        bootstrap_status: 200,
        purpose: "blocklist",
        frequency_secs: 300,
        trie_bytes,
    })
    .await;

    let issuer = format!("http://{addr}");
    let token = make_bootstrap_token(&issuer);
    let config = EdlGuardConfig::new(token)
        .with_ip_strategy(IpStrategy::XForwardedFor, "")
        .with_trusted_proxies(vec!["10.0.0.0/8".to_string()]);

    let manager = Manager::get_or_init(config).await.expect("manager init");
    assert!(manager.is_enabled().await);

    let svc = app();

    // 1. Blocklist match: untrusted peer 203.0.113.9 (strategy irrelevant
    //    since it isn't a trusted proxy) -> 403.
    let resp = svc
        .clone()
        .oneshot(request_from("203.0.113.9", &[]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("Access Denied"));

    // 2. Blocklist miss: untrusted peer 198.51.100.7 -> pass-through.
    let resp = svc
        .clone()
        .oneshot(request_from("198.51.100.7", &[]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // 4. Untrusted forwarded header is ignored: peer 192.0.2.1 (not in
    //    10.0.0.0/8) claims 203.0.113.9 via X-Forwarded-For, but the
    //    decision must use the peer address, which isn't blocklisted.
    let resp = svc
        .clone()
        .oneshot(request_from(
            "192.0.2.1",
            &[("x-forwarded-for", "203.0.113.9")],
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // 5. Chained XFF from a trusted peer: 10.0.0.1 is trusted, so the
    //    first token of X-Forwarded-For is used as the client IP.
    let resp = svc
        .clone()
        .oneshot(request_from(
            "10.0.0.1",
            &[("x-forwarded-for", "203.0.113.1, 10.0.0.2")],
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let snapshot = manager.snapshot().await;
    assert_eq!(snapshot.deployment_state, edl_guard::manager::DeploymentState::Enabled);
    assert_eq!(snapshot.update_count, 1);
}
