//! HTTP API of docpipe.
//!
//! Users submit documents for extraction or text for summarization, follow their jobs through
//! polling or a live event stream, and cancel them. Workers report back through the webhook
//! and poll for cancellation, authenticated by a shared secret.
use axum::{
    body::Body,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, Method, Request,
    },
    middleware, Router,
};
use docpipe::ingress::WORKER_SECRET_HEADER;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::error::{finish_error_response, ApiError};

pub mod auth;
pub mod config;
pub mod error;
pub mod notifier;
mod routes;
pub mod state;

pub use state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static(WORKER_SECRET_HEADER),
        ]);

    let layers = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            let request_id = request
                .headers()
                .get("x-request-id")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            tracing::info_span!(
                "request",
                method = %request.method(),
                uri = %request.uri(),
                request_id,
            )
        }))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(cors)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            finish_error_response,
        ));

    Router::new()
        .nest("/api/v1", routes::router())
        .fallback(|| async { ApiError::NotFound("Route not found".to_owned()) })
        .layer(layers)
        .with_state(state)
}
