//! Harvester plugin and job runner.
//!
//! [`Harvester`] binds one [`CatalogApi`] to the host seams and exposes the
//! gather/fetch/import contract the host calls. [`Harvester::run_job`] drives
//! all three stages for a job with:
//! - Per-object import timeouts via `tokio`
//! - Structured logging via `tracing`
//! - Per-job statistics in [`HarvestStats`]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{validate_config, ConfigError};
use crate::fetch::RemoteFetcher;
use crate::harvest::gather::gather;
use crate::harvest::import::{import, mark_errored};
use crate::harvest::traits::CatalogApi;
use crate::model::{
    HarvestJob, HarvestObject, HarvesterInfo, ImportOutcome, ObjectId, RemoteRecord,
};
use crate::traits::{CatalogActions, ErrorStage, HarvestStore, LogoResolver};

// ============================================================================
// Stage Context
// ============================================================================

/// Borrowed view of everything a stage needs.
pub struct StageContext<'a, A: ?Sized> {
    pub api: &'a A,
    pub fetcher: &'a dyn RemoteFetcher,
    pub store: &'a dyn HarvestStore,
    pub catalog: &'a dyn CatalogActions,
    pub logos: Option<&'a dyn LogoResolver>,
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics about one harvest job.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HarvestStats {
    /// Harvest objects created by the gather stage
    pub objects_gathered: usize,

    /// Objects imported into a new or updated package
    pub imported: usize,

    /// Objects whose content matched the previous harvest
    pub unchanged: usize,

    /// Objects that failed to fetch or import
    pub failed: usize,

    /// Time spent in the gather stage (milliseconds)
    pub gather_duration_ms: u64,

    /// Time spent fetching and importing objects (milliseconds)
    pub import_duration_ms: u64,

    /// Total time spent on the job (milliseconds)
    pub total_duration_ms: u64,
}

// ============================================================================
// Harvester
// ============================================================================

/// A harvester for one remote catalog type.
///
/// # Thread Safety
///
/// The harvester is `Send + Sync` and can be shared across tasks behind an
/// `Arc`, see [`HarvestExecutor`](crate::executor::HarvestExecutor).
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use std::time::Duration;
/// use catalog_harvester::harvest::{Geonorge, Harvester};
///
/// let harvester = Harvester::new(Geonorge, fetcher, store, catalog)
///     .with_import_timeout(Duration::from_secs(60));
/// let stats = harvester.run_job(&job).await;
/// println!("imported {} datasets", stats.imported);
/// ```
pub struct Harvester<A: CatalogApi> {
    api: A,
    fetcher: Arc<dyn RemoteFetcher>,
    store: Arc<dyn HarvestStore>,
    catalog: Arc<dyn CatalogActions>,
    logos: Option<Arc<dyn LogoResolver>>,
    import_timeout: Option<Duration>,
}

impl<A: CatalogApi> Harvester<A> {
    /// Creates a harvester without logo lookup or import timeout.
    pub fn new(
        api: A,
        fetcher: Arc<dyn RemoteFetcher>,
        store: Arc<dyn HarvestStore>,
        catalog: Arc<dyn CatalogActions>,
    ) -> Self {
        Self {
            api,
            fetcher,
            store,
            catalog,
            logos: None,
            import_timeout: None,
        }
    }

    /// Looks up logos of newly created organizations lacking one.
    pub fn with_logo_resolver(mut self, resolver: Arc<dyn LogoResolver>) -> Self {
        self.logos = Some(resolver);
        self
    }

    /// Sets the maximum duration of a single object import.
    pub fn with_import_timeout(mut self, timeout: Duration) -> Self {
        self.import_timeout = Some(timeout);
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn context(&self) -> StageContext<'_, A> {
        StageContext {
            api: &self.api,
            fetcher: self.fetcher.as_ref(),
            store: self.store.as_ref(),
            catalog: self.catalog.as_ref(),
            logos: self.logos.as_deref(),
        }
    }

    pub fn info(&self) -> HarvesterInfo {
        self.api.info()
    }

    /// Validates a source configuration, returning its normalized JSON form
    /// when valid.
    pub fn validate_config(&self, raw: Option<&str>) -> Result<Option<String>, ConfigError> {
        validate_config(raw)
    }

    /// Discovers remote datasets and creates one harvest object per dataset.
    ///
    /// `None` means no objects: either the stage failed (a gather error is
    /// recorded) or nothing changed since the last error-free job.
    pub async fn gather_stage(&self, job: &HarvestJob) -> Option<Vec<ObjectId>> {
        gather(&self.context(), job).await
    }

    /// Content is captured during gather, so there is nothing left to fetch.
    pub async fn fetch_stage(&self, _object: &HarvestObject) -> bool {
        true
    }

    pub async fn import_stage(&self, object: &HarvestObject) -> ImportOutcome {
        import(&self.context(), object).await
    }

    /// URL of the remote document behind a harvest object.
    pub async fn get_original_url(&self, object_id: &str) -> Option<String> {
        let object = match self.store.object(object_id).await {
            Ok(Some(object)) => object,
            Ok(None) => return None,
            Err(e) => {
                warn!(object = object_id, error = %e, "Could not load harvest object");
                return None;
            }
        };
        let job = self.store.job(&object.job_id).await.ok().flatten()?;
        let record: Option<RemoteRecord> = object
            .content
            .as_deref()
            .and_then(|c| serde_json::from_str::<Value>(c).ok())
            .and_then(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            });
        Some(
            self.api
                .original_url(&job.source.url, &object.guid, record.as_ref()),
        )
    }

    async fn save_object_error(&self, object_id: &str, message: &str, stage: ErrorStage) {
        error!(object = object_id, %stage, "{message}");
        if let Err(e) = self.store.save_object_error(object_id, message, stage).await {
            error!(object = object_id, error = %e, "Could not save object error");
        }
    }

    /// Runs gather, fetch and import for every object of `job`.
    ///
    /// Object failures are recorded in the store and counted; they never
    /// abort the job.
    #[instrument(skip(self, job), fields(job = %job.id, harvester = %self.api.info().name))]
    pub async fn run_job(&self, job: &HarvestJob) -> HarvestStats {
        let start = Instant::now();
        let mut stats = HarvestStats::default();

        // ====================================================================
        // Stage 1: Gather
        // ====================================================================

        info!(source = %job.source.url, "Starting gather stage");
        let object_ids = self.gather_stage(job).await.unwrap_or_default();
        stats.objects_gathered = object_ids.len();
        stats.gather_duration_ms = start.elapsed().as_millis() as u64;
        info!(
            duration_ms = stats.gather_duration_ms,
            objects = stats.objects_gathered,
            "Gather completed"
        );

        // ====================================================================
        // Stage 2 + 3: Fetch and import, one object at a time
        // ====================================================================

        let import_start = Instant::now();
        for object_id in &object_ids {
            let object = match self.store.object(object_id).await {
                Ok(Some(object)) => object,
                Ok(None) => {
                    let message = "Harvest object disappeared before import";
                    self.save_object_error(object_id, message, ErrorStage::Fetch)
                        .await;
                    stats.failed += 1;
                    continue;
                }
                Err(e) => {
                    let message = format!("Could not load harvest object: {e}");
                    self.save_object_error(object_id, &message, ErrorStage::Fetch)
                        .await;
                    stats.failed += 1;
                    continue;
                }
            };

            if !self.fetch_stage(&object).await {
                self.save_object_error(object_id, "Fetch stage failed", ErrorStage::Fetch)
                    .await;
                stats.failed += 1;
                continue;
            }

            let outcome = match self.import_timeout {
                Some(limit) => match timeout(limit, self.import_stage(&object)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let message =
                            format!("Import timed out after {}s", limit.as_secs_f32());
                        error!(object = %object_id, "{message}");
                        mark_errored(self.store.as_ref(), &object, &message).await
                    }
                },
                None => self.import_stage(&object).await,
            };
            debug!(object = %object_id, ?outcome, "Object processed");

            match outcome {
                ImportOutcome::Done => stats.imported += 1,
                ImportOutcome::Unchanged => stats.unchanged += 1,
                ImportOutcome::Failed => stats.failed += 1,
            }
        }

        stats.import_duration_ms = import_start.elapsed().as_millis() as u64;
        stats.total_duration_ms = start.elapsed().as_millis() as u64;
        info!(
            imported = stats.imported,
            unchanged = stats.unchanged,
            failed = stats.failed,
            duration_ms = stats.total_duration_ms,
            "Harvest job completed"
        );
        stats
    }
}

// ============================================================================
// Tests
// ============================================================================
