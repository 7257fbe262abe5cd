use std::time::Duration;

use mailproxy::{CONFIG, tracing};

/// Query `/health` of a proxy running on this host with the current
/// configuration.
pub(crate) async fn health() -> anyhow::Result<()> {
    check_health(&format!("http://127.0.0.1:{}/health", CONFIG.listen_port)).await
}

async fn check_health(url: &str) -> anyhow::Result<()> {
    tracing::info!(%url, "Checking server health");

    let response = reqwest::Client::new()
        .get(url)
        .timeout(Duration::from_secs(5))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(%status, %body, "Server is not healthy");
        anyhow::bail!("Server at {url} is not healthy: {status}");
    }

    tracing::info!(%status, "Server is healthy");
    Ok(())
}
