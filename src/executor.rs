use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

use crate::harvest::traits::CatalogApi;
use crate::harvest::{HarvestStats, Harvester};
use crate::model::HarvestJob;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Semaphore error: {0}")]
    Closed(String),

    #[error("Harvest task failed: {0}")]
    Join(String),
}

/// Runs harvest jobs with bounded concurrency.
pub struct HarvestExecutor {
    semaphore: Arc<Semaphore>,
}

impl HarvestExecutor {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
        }
    }

    #[instrument(skip(self, harvester, job), fields(job = %job.id))]
    pub async fn execute<A>(
        &self,
        harvester: Arc<Harvester<A>>,
        job: HarvestJob,
    ) -> Result<HarvestStats, ExecutorError>
    where
        A: CatalogApi + 'static,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| ExecutorError::Closed(e.to_string()))?;

        info!("Starting harvest for source: {}", job.source.url);
        let stats = harvester.run_job(&job).await;
        info!("Finished harvest for source: {}", job.source.url);
        Ok(stats)
    }

    /// Runs every job concurrently, returning results in input order.
    pub async fn execute_all<A>(
        &self,
        harvester: Arc<Harvester<A>>,
        jobs: Vec<HarvestJob>,
    ) -> Vec<Result<HarvestStats, ExecutorError>>
    where
        A: CatalogApi + 'static,
    {
        let total = jobs.len();
        let mut set = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let semaphore = Arc::clone(&self.semaphore);
            let harvester = Arc::clone(&harvester);
            set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => Ok(harvester.run_job(&job).await),
                    Err(e) => Err(ExecutorError::Closed(e.to_string())),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<HarvestStats, ExecutorError>>> =
            (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!(error = %e, "Harvest task panicked"),
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(ExecutorError::Join("task aborted".to_string()))))
            .collect()
    }
}
