use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{Router, routing::get};
use axum_prometheus::PrometheusMetricLayer;

use crate::{
    CONFIG, CancellationToken, DynAppConfig,
    api::router::{new_full_router, serve as service_serve},
    service::{
        ProxyState,
        authn::JwtAuthenticator,
        authz::MailboxAccessAuthorizer,
        credentials::{ClientSecretCredential, UpstreamCredentialProvider},
        entitlements::{EntitlementStore, FileEntitlementSource},
        forward::ReqwestForwarder,
    },
};

#[must_use]
pub fn entitlement_store_from_config(config: &DynAppConfig) -> Arc<EntitlementStore> {
    let source = FileEntitlementSource::new(config.mailbox_access_file.clone());
    Arc::new(EntitlementStore::new(
        Arc::new(source),
        config.entitlement_cache_ttl,
    ))
}

/// Assemble the collaborators from configuration.
///
/// # Errors
/// Fails if authentication is not configured or an HTTP client cannot be built.
pub fn proxy_state_from_config(
    config: &DynAppConfig,
    store: Arc<EntitlementStore>,
) -> anyhow::Result<ProxyState> {
    let openid = config.openid.as_ref().context(
        "OpenID provider is not configured. \
         Set MAILPROXY__OPENID__PROVIDER_URI and MAILPROXY__OPENID__CLIENT_ID",
    )?;
    let authenticator = JwtAuthenticator::new(openid)
        .context("Failed to create HTTP client for the OpenID provider")?;

    let credentials = config
        .upstream_auth
        .as_ref()
        .map(|upstream_auth| {
            ClientSecretCredential::new(upstream_auth)
                .map(|c| Arc::new(c) as Arc<dyn UpstreamCredentialProvider>)
        })
        .transpose()
        .context("Failed to set up upstream client credentials")?;
    if credentials.is_none() {
        tracing::info!("No upstream credentials configured, caller tokens are forwarded");
    }

    let forwarder = ReqwestForwarder::new(config.upstream_timeout, credentials)
        .context("Failed to create upstream HTTP client")?;

    Ok(ProxyState {
        authenticator: Arc::new(authenticator),
        authorizer: Arc::new(MailboxAccessAuthorizer::new(store)),
        forwarder: Arc::new(forwarder),
        upstream: config.upstream_url.clone(),
        max_body_size: config.max_request_body_size,
    })
}

/// Serve the proxy on `bind_addr` and Prometheus metrics on the configured
/// metrics port until `cancellation_token` is cancelled.
///
/// # Errors
/// Fails if the configuration is incomplete or a listener cannot be bound.
pub async fn serve(
    bind_addr: SocketAddr,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    let store = entitlement_store_from_config(&CONFIG);
    let state = proxy_state_from_config(&CONFIG, store.clone())?;

    // Mailbox access problems are reported per request. A broken file at
    // startup is logged but does not prevent serving.
    if let Err(e) = store.table().await {
        tracing::warn!(
            error = %e,
            path = %CONFIG.mailbox_access_file.display(),
            "Mailbox access file cannot be loaded at startup"
        );
    }

    let (layer, metric_handle) = PrometheusMetricLayer::pair();
    let router = new_full_router(state, Some(layer));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    let metrics_addr = SocketAddr::from((CONFIG.bind_ip, CONFIG.metrics_port));
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener to {metrics_addr}"))?;
    let metrics_router = Router::new().route(
        "/metrics",
        get(|| async move { metric_handle.render() }),
    );

    tracing::info!(%bind_addr, %metrics_addr, upstream = %CONFIG.upstream_url, "Mailbox proxy listening");

    let metrics_server = tokio::spawn(service_serve(
        metrics_listener,
        metrics_router,
        cancellation_token.clone(),
    ));
    let result = service_serve(listener, router, cancellation_token.clone()).await;

    cancellation_token.cancel();
    match metrics_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = ?e, "Metrics server failed"),
        Err(e) => tracing::error!(error = %e, "Metrics server task panicked"),
    }

    result
}

/// Cancels the returned token on SIGINT or SIGTERM.
#[must_use]
pub fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        let signal = wait_for_shutdown_signal().await;
        tracing::info!("Received {signal}, shutting down gracefully");
        cancel.cancel();
    });
    token
}

async fn wait_for_shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => "SIGINT",
        () = terminate => "SIGTERM",
    }
}
