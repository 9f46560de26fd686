//! Request Dispatcher (C8): the `tower::Layer`/`tower::Service` pair that
//! sits in front of the protected upstream handler.
//!
//! Shaped like `sem_os_server::middleware::jwt::jwt_auth`'s "inspect,
//! decide, then call `next`" flow, but expressed as a real `tower::Service`
//! rather than an `axum::middleware::from_fn` closure so it composes with
//! any `tower` stack, not just axum's. Panic recovery is intentionally
//! **not** implemented here: compose `tower_http::catch_panic::CatchPanicLayer`
//! alongside this layer, e.g.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/", get(handler))
//!     .layer(EdlGuardLayer::new())
//!     .layer(CatchPanicLayer::new());
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service};

use crate::block_event::{ClientFields, RequestFields};
use crate::manager::{Manager, Mode};
use crate::trusted_proxy::extract_client_ip;

const BLOCK_PAGE_BODY: &str = include_str!("block_page.html");

/// Marker a TLS-terminating host can insert into request extensions so the
/// dispatcher can tell scheme without relying solely on
/// `X-Forwarded-Proto`: scheme is `https` iff the request was TLS or
/// carried `X-Forwarded-Proto: https`.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionIsTls(pub bool);

#[derive(Clone, Default)]
pub struct EdlGuardLayer;

impl EdlGuardLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for EdlGuardLayer {
    type Service = EdlGuardService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        EdlGuardService { inner }
    }
}

#[derive(Clone)]
pub struct EdlGuardService<S> {
    inner: S,
}

impl<S> Service<Request> for EdlGuardService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Standard tower middleware trick: swap in a ready clone so the
        // service being polled is always the one actually invoked.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { dispatch(&mut inner, req).await })
    }
}

async fn dispatch<S>(inner: &mut S, req: Request) -> Result<Response, S::Error>
where
    S: Service<Request, Response = Response>,
{
    let manager = match Manager::get() {
        Some(m) => m,
        None => return inner.call(req).await,
    };

    if !manager.is_enabled().await {
        return inner.call(req).await;
    }

    let direct = match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ci) => ci.0,
        None => return Ok(bad_request("client address unavailable")),
    };

    let client_ip = extract_client_ip(
        direct,
        req.headers(),
        manager.ip_strategy(),
        manager.trusted_set(),
        manager.trusted_header(),
    );
    let ip_text = client_ip.to_string();

    match manager.is_ip_allowed(&ip_text).await {
        Ok(true) => inner.call(req).await,
        Ok(false) => {
            let mode = match manager.mode().await {
                Mode::Allowlist => "allowlist",
                Mode::Blocklist => "blocklist",
            };
            let direct_ip_text = direct.ip().to_string();
            let event_request = RequestFields {
                method: req.method().as_str(),
                host: header_str(&req, header::HOST).unwrap_or(""),
                path: req.uri().path(),
                scheme: determine_scheme(&req),
            };
            let event_client = ClientFields {
                ip: &ip_text,
                direct_ip: &direct_ip_text,
                user_agent: header_str(&req, header::USER_AGENT),
            };
            let event = manager.pool().acquire(event_request, event_client, mode);
            let _ = manager.submit_block_event(event).await;
            Ok(block_page())
        }
        Err(_) => Ok(bad_request("invalid client IP")),
    }
}

fn header_str(req: &Request, name: header::HeaderName) -> Option<&str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn determine_scheme(req: &Request) -> &'static str {
    let is_tls = req
        .extensions()
        .get::<ConnectionIsTls>()
        .map(|c| c.0)
        .unwrap_or(false);
    if is_tls {
        return "https";
    }
    match header_str(req, header::HeaderName::from_static("x-forwarded-proto")) {
        Some(v) if v.eq_ignore_ascii_case("https") => "https",
        _ => "http",
    }
}

fn block_page() -> Response {
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        BLOCK_PAGE_BODY,
    )
        .into_response()
}

fn bad_request(message: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}
