use std::{
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

use axum_prometheus::metrics;
use moka::future::Cache;
use tokio::sync::{Mutex, RwLock};

use super::{ConfigurationError, EntitlementSource, EntitlementTable};
use crate::service::{ApplicationId, MailboxSet};

const METRIC_ENTITLEMENT_CACHE_HITS: &str = "mailproxy_entitlement_cache_hits_total";
const METRIC_ENTITLEMENT_CACHE_MISSES: &str = "mailproxy_entitlement_cache_misses_total";
const METRIC_ENTITLEMENT_RELOADS: &str = "mailproxy_entitlement_reloads_total";
const METRIC_ENTITLEMENT_RELOAD_DURATION: &str = "mailproxy_entitlement_reload_duration_seconds";
const METRIC_ENTITLEMENT_APPLICATIONS: &str = "mailproxy_entitlement_applications";

static METRICS_INITIALIZED: LazyLock<()> = LazyLock::new(|| {
    metrics::describe_counter!(
        METRIC_ENTITLEMENT_CACHE_HITS,
        "Total number of entitlement lookups served from a valid table"
    );
    metrics::describe_counter!(
        METRIC_ENTITLEMENT_CACHE_MISSES,
        "Total number of entitlement lookups that found the table expired"
    );
    metrics::describe_counter!(
        METRIC_ENTITLEMENT_RELOADS,
        "Total number of mailbox access file reloads by result"
    );
    metrics::describe_histogram!(
        METRIC_ENTITLEMENT_RELOAD_DURATION,
        "Duration of mailbox access file reloads"
    );
    metrics::describe_gauge!(
        METRIC_ENTITLEMENT_APPLICATIONS,
        "Number of applications in the current entitlement table"
    );
});

/// Holds the current [`EntitlementTable`] for a bounded time.
///
/// Once the table expired, the next lookup reloads it from the source. While a
/// reload is running, other lookups are answered from the previous table. Only
/// lookups that find no previous table wait for the reload. If a reload fails
/// the previous table is kept and only the lookup that triggered the reload
/// sees the error.
pub struct EntitlementStore {
    source: Arc<dyn EntitlementSource>,
    fresh: Cache<(), Arc<EntitlementTable>>,
    stale: RwLock<Option<Arc<EntitlementTable>>>,
    reload: Mutex<()>,
    ttl: Duration,
}

impl std::fmt::Debug for EntitlementStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementStore")
            .field("source", &"EntitlementSource")
            .field("ttl", &self.ttl)
            .field("fresh", &self.fresh.entry_count())
            .finish_non_exhaustive()
    }
}

impl EntitlementStore {
    #[must_use]
    pub fn new(source: Arc<dyn EntitlementSource>, ttl: Duration) -> Self {
        Self {
            source,
            fresh: Cache::builder().max_capacity(1).time_to_live(ttl).build(),
            stale: RwLock::new(None),
            reload: Mutex::new(()),
            ttl,
        }
    }

    /// Mailboxes owned by `app_id`. Unknown applications get an empty set.
    pub async fn resolve(
        &self,
        app_id: ApplicationId,
    ) -> Result<Arc<MailboxSet>, ConfigurationError> {
        Ok(self.table().await?.mailboxes(app_id))
    }

    /// The table that was loaded last, regardless of its age.
    pub async fn snapshot(&self) -> Option<Arc<EntitlementTable>> {
        self.stale.read().await.clone()
    }

    pub async fn table(&self) -> Result<Arc<EntitlementTable>, ConfigurationError> {
        let () = &*METRICS_INITIALIZED;

        if let Some(table) = self.fresh.get(&()).await {
            metrics::counter!(METRIC_ENTITLEMENT_CACHE_HITS).increment(1);
            return Ok(table);
        }
        metrics::counter!(METRIC_ENTITLEMENT_CACHE_MISSES).increment(1);

        let _reload_guard = if let Ok(guard) = self.reload.try_lock() {
            guard
        } else {
            if let Some(stale) = self.snapshot().await {
                tracing::debug!("Entitlement reload in progress, serving previous table");
                return Ok(stale);
            }
            self.reload.lock().await
        };

        // Someone else may have finished a reload while we waited for the lock.
        if let Some(table) = self.fresh.get(&()).await {
            return Ok(table);
        }

        let started = Instant::now();
        let loaded = self.source.load().await;
        metrics::histogram!(METRIC_ENTITLEMENT_RELOAD_DURATION)
            .record(started.elapsed().as_secs_f64());

        match loaded {
            Ok(table) => {
                let table = Arc::new(table);
                self.fresh.insert((), table.clone()).await;
                *self.stale.write().await = Some(table.clone());
                metrics::counter!(METRIC_ENTITLEMENT_RELOADS, "result" => "success").increment(1);
                #[allow(clippy::cast_precision_loss)]
                metrics::gauge!(METRIC_ENTITLEMENT_APPLICATIONS)
                    .set(table.application_count() as f64);
                tracing::info!(
                    applications = table.application_count(),
                    "Loaded mailbox access configuration"
                );
                Ok(table)
            }
            Err(e) => {
                metrics::counter!(METRIC_ENTITLEMENT_RELOADS, "result" => "failure").increment(1);
                let has_previous_table = self.stale.read().await.is_some();
                tracing::error!(
                    error = %e,
                    has_previous_table,
                    "Failed to load mailbox access configuration"
                );
                Err(e)
            }
        }
    }
}
