use crate::broker::RequestOrchestrator;
use anyhow::Result;
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    routing::get,
};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, debug_span, info};
use ulid::Ulid;

pub mod handlers;
mod openapi;

pub use self::openapi::openapi;

use self::handlers::{health, test_db, user_show};

/// Shared by every handler.
pub struct ApiState {
    pub orchestrator: Arc<RequestOrchestrator>,
    /// Header carrying the delegated credential cache locator.
    pub ccache_header: HeaderName,
    pub request_timeout: Duration,
}

/// Build the router with request ids, tracing and the shared state.
#[must_use]
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health::health).options(health::health))
        .route("/user_show", get(user_show::user_show))
        .route("/test_db", get(test_db::test_db))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(Arc::new(state))),
        )
}

/// Serve on `[::]:port` until ctrl-c.
/// # Errors
/// Returns an error if the listener cannot be bound or the server fails
pub async fn new(port: u16, state: ApiState) -> Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let path = request.uri().path();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    // headers are left out: one of them points at a credential cache
    debug_span!("http-request", path, request_id)
}
