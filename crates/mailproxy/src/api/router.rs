use std::any::Any;

use axum::{
    Json, Router,
    extract::{Request, State},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use axum_prometheus::PrometheusMetricLayer;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    catch_panic::CatchPanicLayer,
    sensitive_headers::SetSensitiveHeadersLayer,
    timeout::TimeoutLayer,
    trace::{self, TraceLayer},
};

use crate::{
    CONFIG, CancellationToken,
    api::{ErrorModel, InnerError},
    request_tracing::{MakeRequestUuid7, RestMakeSpan},
    service::{
        ProxyState,
        pipeline::{self, ProxyOperation},
    },
};

#[derive(Debug, Clone, Copy, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Create the proxy router. `/health` is not authenticated.
pub fn new_full_router(
    state: ProxyState,
    metrics_layer: Option<PrometheusMetricLayer<'static>>,
) -> Router {
    let router = Router::new()
        .route("/{version}/users/{mailbox}", any(user_mailbox))
        .route("/{version}/users/{mailbox}/{*rest}", any(user_mailbox))
        .route("/{version}/subscriptions", any(subscriptions))
        .with_state(state)
        .route(
            "/health",
            get(|| async { Json(HealthResponse { status: "ok" }) }),
        )
        .layer(
            ServiceBuilder::new()
                .set_x_request_id(MakeRequestUuid7)
                .layer(SetSensitiveHeadersLayer::new([
                    axum::http::header::AUTHORIZATION,
                ]))
                .layer(
                    TraceLayer::new_for_http()
                        .on_failure(())
                        .make_span_with(RestMakeSpan::new(tracing::Level::INFO))
                        .on_response(trace::DefaultOnResponse::new().level(tracing::Level::DEBUG)),
                )
                .layer(TimeoutLayer::with_status_code(
                    http::StatusCode::REQUEST_TIMEOUT,
                    CONFIG.max_request_time,
                ))
                .layer(CatchPanicLayer::custom(panic_response))
                .propagate_x_request_id(),
        );

    if let Some(metrics_layer) = metrics_layer {
        router.layer(metrics_layer)
    } else {
        router
    }
}

async fn user_mailbox(State(state): State<ProxyState>, request: Request) -> Response {
    pipeline::run(&state, ProxyOperation::user_mailbox(), request).await
}

async fn subscriptions(State(state): State<ProxyState>, request: Request) -> Response {
    pipeline::run(&state, ProxyOperation::subscription(), request).await
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "Unknown panic message".to_string()
    };

    ErrorModel::proxy_error(
        "Proxy operation ended with 'Panic' error",
        InnerError {
            r#type: "Panic".to_string(),
            message,
        },
        None,
    )
    .into_response()
}

/// Serve the given router on the given listener
///
/// # Errors
/// Fails if the webserver panics
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    let cancellation_future = async move {
        cancellation_token.cancelled().await;
        tracing::info!("HTTP server shutdown requested (cancellation token)");
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(cancellation_future)
        .await
        .map_err(|e| anyhow::anyhow!(e).context("error running HTTP server"))
}
