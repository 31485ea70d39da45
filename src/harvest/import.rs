//! Import stage: reconcile one harvest object with the local catalog.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, OrgPolicy, SourceConfig};
use crate::harvest::munge::munge_tag;
use crate::harvest::pipeline::StageContext;
use crate::harvest::traits::{CatalogApi, MappedDataset, RemoteResourceError};
use crate::model::{
    EntityState, Extra, GroupRef, HarvestObject, HarvestSource, ImportOutcome, LocalPackage,
    NewOrganization, RemoteOrganization, RemoteRecord, ReportStatus, Tag,
};
use crate::traits::{ActionError, ErrorStage, HarvestStore, OrganizationPatch, StoreError};

/// Extra holding the JSON-encoded provenance chain of a package.
pub const PROVENANCE_KEY: &str = "metadata_provenance";

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Empty content for object {0}")]
    EmptyContent(String),

    #[error("Harvest job {0} not found")]
    MissingJob(String),

    #[error("Could not parse object content: {0}")]
    Content(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Remote(#[from] RemoteResourceError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One entry of a package's provenance chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub activity_occurred: String,
    /// `harvest` the first time a dataset is seen, `reharvest` afterwards
    pub activity: String,
    pub harvest_source_url: String,
    pub harvest_source_title: String,
    pub harvest_source_type: String,
    pub harvested_guid: String,
}

/// Appends a record for this run to `previous`.
pub fn provenance_chain(
    previous: Option<Vec<Value>>,
    source: &HarvestSource,
    guid: &str,
    now: DateTime<Utc>,
) -> Vec<Value> {
    let activity = if previous.is_some() { "reharvest" } else { "harvest" };
    let record = ProvenanceRecord {
        activity_occurred: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        activity: activity.to_string(),
        harvest_source_url: source.url.trim_end_matches('/').to_string(),
        harvest_source_title: source.title.clone(),
        harvest_source_type: source.source_type.clone(),
        harvested_guid: guid.to_string(),
    };

    let mut chain = previous.unwrap_or_default();
    // Serializing a struct of strings cannot fail
    if let Ok(value) = serde_json::to_value(record) {
        chain.push(value);
    }
    chain
}

/// Adds default tags, optionally cleans every tag, and drops duplicates.
fn merge_tags(package: &mut LocalPackage, config: &SourceConfig) {
    for tag in config.default_tags() {
        if !package.has_tag(&tag) {
            package.tags.push(Tag::new(tag));
        }
    }

    let mut seen = HashSet::new();
    package.tags = std::mem::take(&mut package.tags)
        .into_iter()
        .map(|tag| {
            if config.clean_tags {
                Tag::new(munge_tag(&tag.name))
            } else {
                tag
            }
        })
        .filter(|tag| !tag.name.is_empty() && seen.insert(tag.name.clone()))
        .collect();
}

fn build_extras(
    existing: Option<&LocalPackage>,
    config: &SourceConfig,
    provenance: &[Value],
) -> Vec<Extra> {
    let mut extras: Vec<Extra> = Vec::new();

    if config.keep_local_extras {
        if let Some(existing) = existing {
            extras.extend(
                existing
                    .extras
                    .iter()
                    .filter(|e| e.key != PROVENANCE_KEY)
                    .cloned(),
            );
        }
    }

    for (key, value) in config.default_extras() {
        if key == PROVENANCE_KEY || extras.iter().any(|e| e.key == key) {
            continue;
        }
        extras.push(Extra { key, value });
    }

    extras.push(Extra {
        key: PROVENANCE_KEY.to_string(),
        value: Value::Array(provenance.to_vec()).to_string(),
    });
    extras
}

/// Looks up a local organization, reactivating it when deleted.
async fn find_local_org<A: CatalogApi + ?Sized>(
    ctx: &StageContext<'_, A>,
    remote: &RemoteOrganization,
) -> Result<Option<String>, ActionError> {
    match ctx.catalog.organization_show(&remote.name).await {
        Ok(org) => {
            if org.state == EntityState::Deleted {
                let patch = OrganizationPatch {
                    state: Some(EntityState::Active),
                    ..Default::default()
                };
                ctx.catalog.organization_patch(&org.id, &patch).await?;
                info!(organization = %org.name, "Reactivated deleted organization");
            }
            Ok(Some(org.id))
        }
        Err(ActionError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn create_org<A: CatalogApi + ?Sized>(
    ctx: &StageContext<'_, A>,
    remote: &RemoteOrganization,
) -> Result<String, ImportError> {
    if remote.name.is_empty() {
        return Err(RemoteResourceError::Malformed {
            field: "organization",
            reason: format!("no usable name in {:?}", remote.title),
        }
        .into());
    }

    let image_url = match (&remote.logo_url, ctx.logos, &remote.landing_page) {
        (Some(url), _, _) => Some(url.clone()),
        (None, Some(resolver), Some(page)) => resolver.resolve_logo(page).await,
        _ => None,
    };

    let org = ctx
        .catalog
        .organization_create(&NewOrganization {
            name: remote.name.clone(),
            title: remote.title.clone(),
            image_url,
        })
        .await?;
    info!(organization = %org.name, "Organization created");
    Ok(org.id)
}

/// Picks the owning organization; any failure falls back to the source's.
async fn resolve_owner_org<A: CatalogApi + ?Sized>(
    ctx: &StageContext<'_, A>,
    config: &SourceConfig,
    source: &HarvestSource,
    remote: Option<&RemoteOrganization>,
) -> Option<String> {
    let fallback = source.owner_org.clone();
    let policy = config.org_policy();
    let Some(remote) = remote.filter(|_| policy != OrgPolicy::SourceOrg) else {
        return fallback;
    };

    match find_local_org(ctx, remote).await {
        Ok(Some(id)) => Some(id),
        Ok(None) if policy == OrgPolicy::Create => match create_org(ctx, remote).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(organization = %remote.name, error = %e, "Could not create organization");
                fallback
            }
        },
        Ok(None) => {
            debug!(organization = %remote.name, "Organization not available locally");
            fallback
        }
        Err(e) => {
            warn!(organization = %remote.name, error = %e, "Organization lookup failed");
            fallback
        }
    }
}

/// Makes `object` the current one for its guid.
async fn mark_current(
    store: &dyn HarvestStore,
    object: &HarvestObject,
    previous: Vec<HarvestObject>,
    package_id: String,
    status: ReportStatus,
) -> Result<(), StoreError> {
    for mut old in previous {
        if old.id == object.id {
            continue;
        }
        old.current = false;
        store.update_object(&old).await?;
    }
    let updated = HarvestObject {
        current: true,
        report_status: Some(status),
        package_id: Some(package_id),
        ..object.clone()
    };
    store.update_object(&updated).await
}

async fn reconcile<A: CatalogApi + ?Sized>(
    ctx: &StageContext<'_, A>,
    object: &HarvestObject,
) -> Result<ImportOutcome, ImportError> {
    let content = object
        .content
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ImportError::EmptyContent(object.id.clone()))?;
    let job = ctx
        .store
        .job(&object.job_id)
        .await?
        .ok_or_else(|| ImportError::MissingJob(object.job_id.clone()))?;
    let source = &job.source;
    let config = SourceConfig::parse(source.config.as_deref())?;
    let record: RemoteRecord = serde_json::from_str(content)?;

    if ctx.api.is_harvest_source(&record) {
        info!("Remote dataset is a harvest source, ignoring...");
        return Ok(ImportOutcome::Done);
    }

    let previous = ctx
        .store
        .current_objects_for_guid(&source.id, &object.guid)
        .await?;

    let same_content = previous
        .iter()
        .filter(|p| p.id != object.id && p.content.as_deref() == Some(content))
        .find_map(|p| p.package_id.clone());
    if let Some(package_id) = same_content {
        if ctx.catalog.package_show(&package_id).await.is_ok() {
            mark_current(ctx.store, object, previous, package_id, ReportStatus::NotModified)
                .await?;
            info!("Dataset unchanged since last harvest");
            return Ok(ImportOutcome::Unchanged);
        }
    }

    let MappedDataset {
        mut package,
        organization,
    } = ctx.api.map_record(&record, &config)?;

    merge_tags(&mut package, &config);
    let groups = config.default_groups();
    if !groups.is_empty() {
        package.groups = groups.into_iter().map(|name| GroupRef { name }).collect();
    }
    package.owner_org = resolve_owner_org(ctx, &config, source, organization.as_ref()).await;

    let existing = match ctx.catalog.package_show(&package.id).await {
        Ok(existing) => Some(existing),
        Err(ActionError::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };

    let prior_chain = existing
        .as_ref()
        .and_then(|p| p.extra(PROVENANCE_KEY))
        .and_then(|raw| serde_json::from_str::<Vec<Value>>(raw).ok())
        .or_else(|| ctx.api.harvested_provenance(&record));
    let chain = provenance_chain(prior_chain, source, &object.guid, Utc::now());
    package.extras = build_extras(existing.as_ref(), &config, &chain);

    let (saved, status) = match existing {
        Some(_) => {
            debug!(package = %package.id, "Updating package");
            (ctx.catalog.package_update(&package).await?, ReportStatus::Updated)
        }
        None => {
            debug!(package = %package.id, "Creating package");
            (ctx.catalog.package_create(&package).await?, ReportStatus::Added)
        }
    };

    mark_current(ctx.store, object, previous, saved.id.clone(), status).await?;
    info!(package = %saved.id, ?status, "Dataset imported");
    Ok(ImportOutcome::Done)
}

/// Runs the import stage for one object.
///
/// Failures never propagate: they are saved as object errors and reported
/// as [`ImportOutcome::Failed`], so one bad dataset does not stop the job.
#[instrument(skip(ctx, object), fields(object = %object.id, guid = %object.guid))]
pub async fn import<A: CatalogApi + ?Sized>(
    ctx: &StageContext<'_, A>,
    object: &HarvestObject,
) -> ImportOutcome {
    debug!("In {} import stage", ctx.api.info().name);

    let err = match reconcile(ctx, object).await {
        Ok(outcome) => return outcome,
        Err(err) => err,
    };

    let message = match &err {
        ImportError::Action(ActionError::Validation(detail)) => {
            format!("Invalid package with GUID {}: {}", object.guid, detail)
        }
        other => other.to_string(),
    };
    error!(%message, "Import failed");
    mark_errored(ctx.store, object, &message).await
}

/// Saves an import error for `object` and flags it errored and not current.
pub(crate) async fn mark_errored(
    store: &dyn HarvestStore,
    object: &HarvestObject,
    message: &str,
) -> ImportOutcome {
    if let Err(e) = store
        .save_object_error(&object.id, message, ErrorStage::Import)
        .await
    {
        error!(object = %object.id, error = %e, "Could not save object error");
    }
    let errored = HarvestObject {
        current: false,
        report_status: Some(ReportStatus::Errored),
        ..object.clone()
    };
    if let Err(e) = store.update_object(&errored).await {
        error!(object = %object.id, error = %e, "Could not flag object as errored");
    }
    ImportOutcome::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::formats::Geonorge;
    use crate::memory::{MemoryCatalog, MemoryStore};
    use crate::model::{NewHarvestObject, Organization};
    use crate::testing::{geonorge_record, job, RouteFetcher, StaticLogo};
    use crate::traits::CatalogActions;
    use serde_json::json;

    struct Fixture {
        fetcher: RouteFetcher,
        store: MemoryStore,
        catalog: MemoryCatalog,
    }

    impl Fixture {
        fn new(config: Option<&str>) -> Self {
            let store = MemoryStore::new();
            let mut job = job("j1", "src", config);
            job.source.owner_org = Some("source-org".to_string());
            store.add_job(job);
            let catalog = MemoryCatalog::new();
            catalog.add_organization(Organization {
                id: "source-org".to_string(),
                name: "source-org".to_string(),
                title: "Source".to_string(),
                image_url: None,
                state: EntityState::Active,
            });
            Self {
                fetcher: RouteFetcher::new(),
                store,
                catalog,
            }
        }

        fn ctx(&self) -> StageContext<'_, Geonorge> {
            StageContext {
                api: &Geonorge,
                fetcher: &self.fetcher,
                store: &self.store,
                catalog: &self.catalog,
                logos: None,
            }
        }

        async fn object(&self, job_id: &str, guid: &str, content: &str) -> HarvestObject {
            self.store
                .create_object(NewHarvestObject {
                    guid: guid.to_string(),
                    job_id: job_id.to_string(),
                    source_id: "src".to_string(),
                    content: content.to_string(),
                })
                .await
                .unwrap()
        }
    }

    fn provenance(package: &LocalPackage) -> Vec<Value> {
        serde_json::from_str(package.extra(PROVENANCE_KEY).unwrap()).unwrap()
    }

    #[test]
    fn test_provenance_chain_appends() {
        let source = job("j", "src", None).source;
        let now = Utc::now();

        let first = provenance_chain(None, &source, "g", now);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0]["activity"], json!("harvest"));
        assert_eq!(first[0]["harvested_guid"], json!("g"));

        let second = provenance_chain(Some(first), &source, "g", now);
        assert_eq!(second.len(), 2);
        assert_eq!(second[1]["activity"], json!("reharvest"));
    }

    #[test]
    fn test_merge_tags_cleans_and_dedups() {
        let config = SourceConfig::parse(Some(
            r#"{"default_tags": ["Kart", "geodata"], "clean_tags": true}"#,
        ))
        .unwrap();
        let mut package = LocalPackage {
            tags: vec![Tag::new("Kart"), Tag::new("Miljø og klima")],
            ..Default::default()
        };

        merge_tags(&mut package, &config);

        let names: Vec<_> = package.tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["kart", "miljoe-og-klima", "geodata"]);
    }

    #[tokio::test]
    async fn test_import_creates_package_with_org() {
        let fx = Fixture::new(None);
        let content = geonorge_record("a1", "Kartverket").to_string();
        let object = fx.object("j1", "a1", &content).await;

        let outcome = import(&fx.ctx(), &object).await;

        assert_eq!(outcome, ImportOutcome::Done);
        let package = fx.catalog.package_show("a1").await.unwrap();
        let org = fx.catalog.organization_show("kartverket").await.unwrap();
        assert_eq!(package.owner_org.as_deref(), Some(org.id.as_str()));
        assert_eq!(provenance(&package).len(), 1);

        let stored = fx.store.object(&object.id).await.unwrap().unwrap();
        assert!(stored.current);
        assert_eq!(stored.report_status, Some(ReportStatus::Added));
        assert_eq!(stored.package_id.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn test_reimport_is_idempotent() {
        let fx = Fixture::new(None);
        let content = geonorge_record("a1", "Kartverket").to_string();
        let object = fx.object("j1", "a1", &content).await;

        assert_eq!(import(&fx.ctx(), &object).await, ImportOutcome::Done);
        let object = fx.store.object(&object.id).await.unwrap().unwrap();
        assert_eq!(import(&fx.ctx(), &object).await, ImportOutcome::Done);

        assert_eq!(fx.catalog.packages().len(), 1);
        let package = fx.catalog.package_show("a1").await.unwrap();
        assert_eq!(provenance(&package).len(), 2);
        let stored = fx.store.object(&object.id).await.unwrap().unwrap();
        assert_eq!(stored.report_status, Some(ReportStatus::Updated));
    }

    #[tokio::test]
    async fn test_unchanged_content_is_not_reimported() {
        let fx = Fixture::new(None);
        fx.store.add_job(job("j2", "src", None));
        let content = geonorge_record("a1", "Kartverket").to_string();
        let first = fx.object("j1", "a1", &content).await;
        assert_eq!(import(&fx.ctx(), &first).await, ImportOutcome::Done);

        let second = fx.object("j2", "a1", &content).await;
        let outcome = import(&fx.ctx(), &second).await;

        assert_eq!(outcome, ImportOutcome::Unchanged);
        assert_eq!(fx.catalog.update_count(), 0);
        let first = fx.store.object(&first.id).await.unwrap().unwrap();
        let second = fx.store.object(&second.id).await.unwrap().unwrap();
        assert!(!first.current);
        assert!(second.current);
        assert_eq!(second.report_status, Some(ReportStatus::NotModified));
    }

    #[tokio::test]
    async fn test_deleted_org_is_reactivated() {
        let fx = Fixture::new(None);
        fx.catalog.add_organization(Organization {
            id: "org-kv".to_string(),
            name: "kartverket".to_string(),
            title: "Kartverket".to_string(),
            image_url: None,
            state: EntityState::Deleted,
        });
        let content = geonorge_record("a1", "Kartverket").to_string();
        let object = fx.object("j1", "a1", &content).await;

        assert_eq!(import(&fx.ctx(), &object).await, ImportOutcome::Done);

        let org = fx.catalog.organization_show("kartverket").await.unwrap();
        assert_eq!(org.state, EntityState::Active);
        let package = fx.catalog.package_show("a1").await.unwrap();
        assert_eq!(package.owner_org.as_deref(), Some("org-kv"));
    }

    #[tokio::test]
    async fn test_only_local_orgs_falls_back_to_source_org() {
        let fx = Fixture::new(Some(r#"{"remote_orgs": "only_local"}"#));
        let content = geonorge_record("a1", "Ukjent etat").to_string();
        let object = fx.object("j1", "a1", &content).await;

        assert_eq!(import(&fx.ctx(), &object).await, ImportOutcome::Done);

        let package = fx.catalog.package_show("a1").await.unwrap();
        assert_eq!(package.owner_org.as_deref(), Some("source-org"));
        assert!(fx.catalog.organization_show("ukjent-etat").await.is_err());
    }

    #[tokio::test]
    async fn test_logo_resolved_from_landing_page() {
        let fx = Fixture::new(None);
        let logos = StaticLogo("https://example.no/logo.png".to_string());
        let ctx = StageContext {
            logos: Some(&logos),
            ..fx.ctx()
        };
        let mut record = geonorge_record("a1", "Miljødirektoratet");
        record.as_object_mut().unwrap().remove("OrganizationLogo");
        let object = fx.object("j1", "a1", &record.to_string()).await;

        assert_eq!(import(&ctx, &object).await, ImportOutcome::Done);

        let org = fx.catalog.organization_show("miljoedirektoratet").await.unwrap();
        assert_eq!(org.image_url.as_deref(), Some("https://example.no/logo.png"));
    }

    #[tokio::test]
    async fn test_keep_local_extras() {
        let fx = Fixture::new(Some(
            r#"{"keep_local_extras": true, "default_extras": {"kilde": "geonorge"}}"#,
        ));
        fx.catalog
            .package_create(&LocalPackage {
                id: "a1".to_string(),
                name: "a1".to_string(),
                title: "Lokal".to_string(),
                extras: vec![Extra {
                    key: "lokal".to_string(),
                    value: "ja".to_string(),
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        let content = geonorge_record("a1", "Kartverket").to_string();
        let object = fx.object("j1", "a1", &content).await;

        assert_eq!(import(&fx.ctx(), &object).await, ImportOutcome::Done);

        let package = fx.catalog.package_show("a1").await.unwrap();
        assert_eq!(package.extra("lokal"), Some("ja"));
        assert_eq!(package.extra("kilde"), Some("geonorge"));
        assert!(package.extra(PROVENANCE_KEY).is_some());
    }

    #[tokio::test]
    async fn test_empty_content_is_object_error() {
        let fx = Fixture::new(None);
        let object = fx.object("j1", "a1", "  ").await;

        assert_eq!(import(&fx.ctx(), &object).await, ImportOutcome::Failed);

        let errors = fx.store.object_errors(&object.id);
        assert_eq!(errors, vec![format!("Empty content for object {}", object.id)]);
    }

    #[tokio::test]
    async fn test_validation_error_is_isolated() {
        let fx = Fixture::new(None);
        fx.catalog.reject_package("bad");
        let bad = fx
            .object("j1", "bad", &geonorge_record("bad", "Kartverket").to_string())
            .await;
        let good = fx
            .object("j1", "good", &geonorge_record("good", "Kartverket").to_string())
            .await;

        assert_eq!(import(&fx.ctx(), &bad).await, ImportOutcome::Failed);
        assert_eq!(import(&fx.ctx(), &good).await, ImportOutcome::Done);

        let errors = fx.store.object_errors(&bad.id);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Invalid package with GUID bad: "));
        assert!(fx.catalog.package_show("good").await.is_ok());
    }

    #[tokio::test]
    async fn test_harvest_source_records_are_skipped() {
        let fx = Fixture::new(None);
        let mut record = geonorge_record("h1", "Kartverket");
        record["Type"] = json!("harvest");
        let object = fx.object("j1", "h1", &record.to_string()).await;

        assert_eq!(import(&fx.ctx(), &object).await, ImportOutcome::Done);
        assert!(fx.catalog.packages().is_empty());
    }
}
