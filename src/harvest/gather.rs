//! Gather stage: discover remote datasets and materialize harvest objects.

use std::collections::HashSet;

use chrono::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SourceConfig;
use crate::harvest::changes::filter_unchanged;
use crate::harvest::filters::{expand, FilterTerms};
use crate::harvest::pipeline::StageContext;
use crate::harvest::search::search;
use crate::harvest::traits::{CatalogApi, RecordField, SearchError};
use crate::model::{
    HarvestJob, JobStatus, NewHarvestObject, ObjectId, RemoteRecord, ReportStatus,
};
use crate::traits::{HarvestStore, StoreError};

/// Safety margin against clock drift between us and the remote.
const CHANGE_MARGIN_HOURS: i64 = 1;

/// Latest finished job of the same source that completed without errors.
///
/// A job qualifies when it has no gather errors and each of its objects
/// is either current or was reported as not modified.
pub async fn last_error_free_job(
    store: &dyn HarvestStore,
    job: &HarvestJob,
) -> Result<Option<HarvestJob>, StoreError> {
    let mut jobs: Vec<HarvestJob> = store
        .jobs_for_source(&job.source.id)
        .await?
        .into_iter()
        .filter(|j| {
            j.id != job.id && j.status == JobStatus::Finished && j.gather_started.is_some()
        })
        .collect();
    jobs.sort_by(|a, b| b.gather_started.cmp(&a.gather_started));

    for candidate in jobs {
        if store.has_gather_errors(&candidate.id).await? {
            continue;
        }
        let objects = store.objects_for_job(&candidate.id).await?;
        let clean = objects
            .iter()
            .all(|o| o.current || o.report_status == Some(ReportStatus::NotModified));
        if clean {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Drops records sharing a de-duplication key with an earlier one.
///
/// Duplicates usually come from datasets changing while we page through
/// the remote search.
pub fn deduplicate<A: CatalogApi + ?Sized>(
    api: &A,
    records: Vec<RemoteRecord>,
) -> Vec<(String, RemoteRecord)> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(records.len());

    for record in records {
        let Some(key) = api.dedup_key(&record) else {
            warn!("Discarding remote dataset without identifier");
            continue;
        };
        if !seen.insert(key.clone()) {
            info!(guid = %key, "Discarding duplicate dataset");
            continue;
        }
        unique.push((key, record));
    }
    unique
}

fn record_values<A: CatalogApi + ?Sized>(
    api: &A,
    record: &RemoteRecord,
    field: RecordField,
) -> Vec<String> {
    match field {
        RecordField::Organization => api.record_organization(record).into_iter().collect(),
        RecordField::Theme => api.record_themes(record),
        RecordField::Keyword => api.record_keywords(record),
    }
}

fn matches_any(values: &[String], wanted: &[String]) -> bool {
    values
        .iter()
        .any(|v| wanted.iter().any(|w| w.eq_ignore_ascii_case(v)))
}

/// Applies the inclusion lists the remote cannot filter on and the
/// exclusion lists.
pub fn apply_record_filters<A: CatalogApi + ?Sized>(
    api: &A,
    config: &SourceConfig,
    records: Vec<(String, RemoteRecord)>,
) -> Vec<(String, RemoteRecord)> {
    let families = [
        (RecordField::Organization, config.exclude_organizations.as_ref()),
        (RecordField::Theme, config.exclude_themes.as_ref()),
        (RecordField::Keyword, config.exclude_keywords.as_ref()),
    ];

    let rules: Vec<(RecordField, Vec<String>, Vec<String>)> = families
        .into_iter()
        .map(|(field, exclude)| {
            let include: Vec<String> = api
                .client_side_filters()
                .iter()
                .filter(|(_, f)| *f == field)
                .filter_map(|(key, _)| config.filter(key))
                .flatten()
                .collect();
            let exclude = exclude.map(|e| e.values()).unwrap_or_default();
            (field, include, exclude)
        })
        .filter(|(_, include, exclude)| !include.is_empty() || !exclude.is_empty())
        .collect();

    if rules.is_empty() {
        return records;
    }

    records
        .into_iter()
        .filter(|(guid, record)| {
            let keep = rules.iter().all(|(field, include, exclude)| {
                let values = record_values(api, record, *field);
                (include.is_empty() || matches_any(&values, include))
                    && !matches_any(&values, exclude)
            });
            if !keep {
                debug!(%guid, "Dataset filtered out by configuration");
            }
            keep
        })
        .collect()
}

async fn search_all<A: CatalogApi + ?Sized>(
    ctx: &StageContext<'_, A>,
    base_url: &str,
    combinations: &[FilterTerms],
) -> Result<Vec<RemoteRecord>, SearchError> {
    let mut records = Vec::new();
    for terms in combinations {
        records.extend(search(ctx.api, ctx.fetcher, base_url, terms).await?);
    }
    Ok(records)
}

async fn record_gather_error(store: &dyn HarvestStore, job: &HarvestJob, message: &str) {
    error!(job = %job.id, "{message}");
    if let Err(e) = store.save_gather_error(&job.id, message).await {
        error!(job = %job.id, error = %e, "Could not save gather error");
    }
}

/// Runs the gather stage for `job`.
///
/// Returns the ids of the created harvest objects, or `None` when the stage
/// was aborted (a gather error is then recorded) or nothing changed since
/// the last error-free job.
#[instrument(skip(ctx, job), fields(job = %job.id, source = %job.source.url))]
pub async fn gather<A: CatalogApi + ?Sized>(
    ctx: &StageContext<'_, A>,
    job: &HarvestJob,
) -> Option<Vec<ObjectId>> {
    debug!("In {} gather stage", ctx.api.info().name);

    let config = match SourceConfig::parse(job.source.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            record_gather_error(ctx.store, job, &format!("Invalid configuration: {e}")).await;
            return None;
        }
    };

    let base_url = job.source.url.trim_end_matches('/');
    let combinations = expand(ctx.api, &config);
    debug!(searches = combinations.len(), "filter combinations built");

    let previous = match last_error_free_job(ctx.store, job).await {
        Ok(previous) => previous,
        Err(e) => {
            warn!(error = %e, "Could not look up previous jobs, harvesting everything");
            None
        }
    };

    let mut records = None;
    let since = previous
        .filter(|_| !config.force_all)
        .and_then(|p| p.gather_started)
        .map(|started| started - Duration::hours(CHANGE_MARGIN_HOURS));

    if let Some(since) = since {
        info!(%since, "Searching for datasets modified since");
        let changed = match search_all(ctx, base_url, &combinations).await {
            Ok(candidates) => {
                filter_unchanged(ctx.api, ctx.fetcher, candidates, base_url, since).await
            }
            Err(e) => Err(e),
        };
        match changed {
            Ok(changed) if changed.is_empty() => {
                info!("No datasets have been updated on the remote since the last harvest job");
                return None;
            }
            Ok(changed) => records = Some(changed),
            Err(e) => {
                info!(error = %e, "Change search failed, falling back to all datasets");
            }
        }
    }

    let records = match records {
        Some(records) => records,
        None => match search_all(ctx, base_url, &combinations).await {
            Ok(records) => records,
            Err(e) => {
                let message = format!(
                    "Unable to search remote catalog for datasets: {e} url: {base_url} terms: {combinations:?}"
                );
                record_gather_error(ctx.store, job, &message).await;
                return None;
            }
        },
    };

    if records.is_empty() {
        record_gather_error(ctx.store, job, &format!("No datasets found at {base_url}")).await;
        return None;
    }

    let unique = deduplicate(ctx.api, records);
    let selected = apply_record_filters(ctx.api, &config, unique);

    let mut object_ids = Vec::with_capacity(selected.len());
    for (guid, record) in selected {
        let content = match serde_json::to_string(&record) {
            Ok(content) => content,
            Err(e) => {
                record_gather_error(ctx.store, job, &format!("Cannot serialize {guid}: {e}")).await;
                return None;
            }
        };
        debug!(%guid, "Creating harvest object");

        let object = NewHarvestObject {
            guid,
            job_id: job.id.clone(),
            source_id: job.source.id.clone(),
            content,
        };
        // Objects created before a failure stay in the store; the host owns cleanup
        match ctx.store.create_object(object).await {
            Ok(object) => object_ids.push(object.id),
            Err(e) => {
                record_gather_error(ctx.store, job, &e.to_string()).await;
                return None;
            }
        }
    }

    info!(objects = object_ids.len(), "Gather stage completed");
    Some(object_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::formats::{DataNorge, Geonorge};
    use crate::memory::{MemoryCatalog, MemoryStore};
    use crate::model::{HarvestObject, HarvestSource};
    use crate::testing::{finished_job, geonorge_page, job, RouteFetcher};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record(value: serde_json::Value) -> RemoteRecord {
        value.as_object().cloned().unwrap()
    }

    fn context<'a>(
        fetcher: &'a RouteFetcher,
        store: &'a MemoryStore,
        catalog: &'a MemoryCatalog,
    ) -> StageContext<'a, Geonorge> {
        StageContext {
            api: &Geonorge,
            fetcher,
            store,
            catalog,
            logos: None,
        }
    }

    #[test]
    fn test_deduplicate_keeps_first() {
        let records = vec![
            record(json!({"Uuid": "a", "Title": "first"})),
            record(json!({"Uuid": "b", "Title": "other"})),
            record(json!({"Uuid": "a", "Title": "second"})),
            record(json!({"Title": "no id"})),
        ];

        let unique = deduplicate(&Geonorge, records);

        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].0, "a");
        assert_eq!(unique[0].1["Title"], json!("first"));
    }

    #[test]
    fn test_record_filters() {
        let config = SourceConfig::parse(Some(
            r#"{"organizations": ["statens vegvesen"], "exclude_keywords": "intern"}"#,
        ))
        .unwrap();
        let records = vec![
            (
                "1".to_string(),
                record(json!({"id": "1", "publisher": {"name": "Statens vegvesen"}})),
            ),
            (
                "2".to_string(),
                record(json!({"id": "2", "publisher": {"name": "Kartverket"}})),
            ),
            (
                "3".to_string(),
                record(json!({
                    "id": "3",
                    "publisher": {"name": "Statens vegvesen"},
                    "keyword": ["Intern"]
                })),
            ),
        ];

        let kept = apply_record_filters(&DataNorge, &config, records);

        let guids: Vec<_> = kept.iter().map(|(g, _)| g.as_str()).collect();
        assert_eq!(guids, vec!["1"]);
    }

    #[tokio::test]
    async fn test_last_error_free_job_skips_failed_jobs() {
        let store = MemoryStore::new();
        let current = job("current", "src", None);
        let t = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();

        let clean = finished_job("clean", "src", t(1));
        let errored = finished_job("errored", "src", t(2));
        let with_failed_object = finished_job("failed-object", "src", t(3));
        for j in [&current, &clean, &errored, &with_failed_object] {
            store.add_job(j.clone());
        }
        store.save_gather_error("errored", "boom").await.unwrap();
        let object = store
            .create_object(NewHarvestObject {
                guid: "x".to_string(),
                job_id: "failed-object".to_string(),
                source_id: "src".to_string(),
                content: "{}".to_string(),
            })
            .await
            .unwrap();
        assert!(!object.current);

        let found = last_error_free_job(&store, &current).await.unwrap();

        assert_eq!(found.map(|j| j.id), Some("clean".to_string()));
    }

    #[tokio::test]
    async fn test_gather_creates_one_object_per_unique_dataset() {
        let fetcher = RouteFetcher::new()
            .route(&["/api/search/", "offset=11"], geonorge_page(&[]))
            .route(&["/api/search/", "offset=1"], geonorge_page(&["a", "b", "a"]));
        let store = MemoryStore::new();
        let catalog = MemoryCatalog::new();
        let job = job("j1", "src", None);
        store.add_job(job.clone());

        let ids = gather(&context(&fetcher, &store, &catalog), &job)
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        let objects = store.objects_for_job("j1").await.unwrap();
        let guids: Vec<_> = objects.iter().map(|o| o.guid.as_str()).collect();
        assert_eq!(guids, vec!["a", "b"]);
        assert!(objects.iter().all(|o| o.content.is_some()));
    }

    #[tokio::test]
    async fn test_gather_without_results_records_error() {
        let fetcher = RouteFetcher::new().route(&["/api/search/"], geonorge_page(&[]));
        let store = MemoryStore::new();
        let catalog = MemoryCatalog::new();
        let job = job("j1", "src", None);
        store.add_job(job.clone());

        let ids = gather(&context(&fetcher, &store, &catalog), &job).await;

        assert!(ids.is_none());
        assert!(store.has_gather_errors("j1").await.unwrap());
        assert!(store.objects_for_job("j1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gather_search_failure_records_error() {
        let fetcher = RouteFetcher::new();
        let store = MemoryStore::new();
        let catalog = MemoryCatalog::new();
        let job = job("j1", "src", None);
        store.add_job(job.clone());

        assert!(gather(&context(&fetcher, &store, &catalog), &job).await.is_none());
        let errors = store.gather_errors("j1");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Unable to search remote catalog"));
    }

    async fn seed_clean_previous_job(store: &MemoryStore, source: &HarvestSource) {
        let started = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let mut previous = finished_job("previous", &source.id, started);
        previous.source = source.clone();
        store.add_job(previous);
        let object = store
            .create_object(NewHarvestObject {
                guid: "old".to_string(),
                job_id: "previous".to_string(),
                source_id: source.id.clone(),
                content: "{}".to_string(),
            })
            .await
            .unwrap();
        store
            .update_object(&HarvestObject {
                current: true,
                ..object
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_incremental_gather_excludes_unchanged() {
        let fetcher = RouteFetcher::new()
            .route(&["/api/search/", "offset=11"], geonorge_page(&[]))
            .route(&["/api/search/", "offset=1"], geonorge_page(&["old", "new"]))
            .route(
                &["/api/getdata/old"],
                json!({"Uuid": "old", "DateMetadataUpdated": "2023-12-01T00:00:00"}).to_string(),
            )
            .route(
                &["/api/getdata/new"],
                json!({"Uuid": "new", "DateMetadataUpdated": "2024-02-01T00:00:00"}).to_string(),
            );
        let store = MemoryStore::new();
        let catalog = MemoryCatalog::new();
        let job = job("j2", "src", None);
        seed_clean_previous_job(&store, &job.source).await;
        store.add_job(job.clone());

        let ids = gather(&context(&fetcher, &store, &catalog), &job)
            .await
            .unwrap();

        assert_eq!(ids.len(), 1);
        let objects = store.objects_for_job("j2").await.unwrap();
        assert_eq!(objects[0].guid, "new");
    }

    #[tokio::test]
    async fn test_incremental_nothing_changed_returns_none_without_error() {
        let fetcher = RouteFetcher::new()
            .route(&["/api/search/", "offset=11"], geonorge_page(&[]))
            .route(&["/api/search/", "offset=1"], geonorge_page(&["old"]))
            .route(
                &["/api/getdata/old"],
                json!({"Uuid": "old", "DateMetadataUpdated": "2023-12-01T00:00:00"}).to_string(),
            );
        let store = MemoryStore::new();
        let catalog = MemoryCatalog::new();
        let job = job("j2", "src", None);
        seed_clean_previous_job(&store, &job.source).await;
        store.add_job(job.clone());

        assert!(gather(&context(&fetcher, &store, &catalog), &job).await.is_none());
        assert!(!store.has_gather_errors("j2").await.unwrap());
    }

    #[tokio::test]
    async fn test_incremental_failure_falls_back_to_full_search() {
        // No getdata routes: the change detector fails and everything is harvested
        let fetcher = RouteFetcher::new()
            .route(&["/api/search/", "offset=11"], geonorge_page(&[]))
            .route(&["/api/search/", "offset=1"], geonorge_page(&["old", "new"]));
        let store = MemoryStore::new();
        let catalog = MemoryCatalog::new();
        let job = job("j2", "src", None);
        seed_clean_previous_job(&store, &job.source).await;
        store.add_job(job.clone());

        let ids = gather(&context(&fetcher, &store, &catalog), &job)
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert!(!store.has_gather_errors("j2").await.unwrap());
    }

    #[tokio::test]
    async fn test_force_all_skips_change_detection() {
        let fetcher = RouteFetcher::new()
            .route(&["/api/search/", "offset=11"], geonorge_page(&[]))
            .route(&["/api/search/", "offset=1"], geonorge_page(&["old"]));
        let store = MemoryStore::new();
        let catalog = MemoryCatalog::new();
        let job = job("j2", "src", Some(r#"{"force_all": true}"#));
        seed_clean_previous_job(&store, &job.source).await;
        store.add_job(job.clone());

        let ids = gather(&context(&fetcher, &store, &catalog), &job)
            .await
            .unwrap();

        assert_eq!(ids.len(), 1);
        assert!(fetcher.requests().iter().all(|u| !u.contains("getdata")));
    }
}
