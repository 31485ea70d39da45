//! Seams towards the host catalog.
//!
//! The harvester never touches the host's database or action layer directly.
//! Everything it needs goes through [`HarvestStore`] (harvest jobs, objects
//! and their errors) and [`CatalogActions`] (packages and organizations).

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    EntityState, HarvestJob, HarvestObject, LocalPackage, NewHarvestObject, NewOrganization,
    Organization,
};

/// Field-level validation detail reported by the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationErrors(pub BTreeMap<String, serde_json::Value>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string(&self.0).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(ValidationErrors),
    #[error("Action failed: {0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No such record: {0}")]
    NotFound(String),
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Stage an object error is reported against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorStage {
    Fetch,
    Import,
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStage::Fetch => f.write_str("Fetch"),
            ErrorStage::Import => f.write_str("Import"),
        }
    }
}

/// Partial update of an organization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<EntityState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Host action API used for every side effect on the local catalog.
///
/// Implementations run with an elevated (site user) context: harvesting
/// happens outside any user request. Create/update must accept an explicit
/// package id and ignore fields unknown to the package schema.
#[async_trait]
pub trait CatalogActions: Send + Sync {
    async fn package_show(&self, id: &str) -> Result<LocalPackage, ActionError>;

    async fn package_create(&self, package: &LocalPackage) -> Result<LocalPackage, ActionError>;

    async fn package_update(&self, package: &LocalPackage) -> Result<LocalPackage, ActionError>;

    async fn organization_show(&self, id: &str) -> Result<Organization, ActionError>;

    async fn organization_create(&self, org: &NewOrganization)
        -> Result<Organization, ActionError>;

    async fn organization_patch(
        &self,
        id: &str,
        patch: &OrganizationPatch,
    ) -> Result<Organization, ActionError>;
}

/// Persistence of harvest jobs and objects, owned by the host.
#[async_trait]
pub trait HarvestStore: Send + Sync {
    async fn job(&self, id: &str) -> Result<Option<HarvestJob>, StoreError>;

    /// All jobs of a source, in no particular order.
    async fn jobs_for_source(&self, source_id: &str) -> Result<Vec<HarvestJob>, StoreError>;

    async fn has_gather_errors(&self, job_id: &str) -> Result<bool, StoreError>;

    async fn objects_for_job(&self, job_id: &str) -> Result<Vec<HarvestObject>, StoreError>;

    async fn object(&self, id: &str) -> Result<Option<HarvestObject>, StoreError>;

    /// Persists a new object and returns it with its assigned id.
    async fn create_object(&self, object: NewHarvestObject) -> Result<HarvestObject, StoreError>;

    async fn update_object(&self, object: &HarvestObject) -> Result<(), StoreError>;

    /// Objects of a source flagged `current` for the given guid.
    async fn current_objects_for_guid(
        &self,
        source_id: &str,
        guid: &str,
    ) -> Result<Vec<HarvestObject>, StoreError>;

    async fn save_gather_error(&self, job_id: &str, message: &str) -> Result<(), StoreError>;

    async fn save_object_error(
        &self,
        object_id: &str,
        message: &str,
        stage: ErrorStage,
    ) -> Result<(), StoreError>;
}

/// Best-effort lookup of an organization logo from a web page.
///
/// `None` covers every failure (unreachable page, unparseable HTML, no
/// matching element); logo lookups never fail an import.
#[async_trait]
pub trait LogoResolver: Send + Sync {
    async fn resolve_logo(&self, page_url: &str) -> Option<String>;
}
