use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw dataset record as returned by a remote catalog API.
///
/// Field names depend on the remote API (`Uuid`/`Title` for Geonorge,
/// `id`/`title` for Data Norge), so the record stays an untyped JSON map
/// until a [`CatalogApi`](crate::harvest::CatalogApi) maps it.
pub type RemoteRecord = serde_json::Map<String, serde_json::Value>;

pub type JobId = String;
pub type ObjectId = String;

/// A configured remote endpoint owned by the host catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestSource {
    pub id: String,
    pub url: String,
    pub title: String,
    /// Harvester name, e.g. `"geonorge"`
    pub source_type: String,
    /// Free-form JSON configuration entered by the catalog admin
    pub config: Option<String>,
    /// Local organization owning the harvest source
    pub owner_org: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    New,
    Running,
    Finished,
}

/// One harvest run against a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestJob {
    pub id: JobId,
    pub source: HarvestSource,
    pub gather_started: Option<DateTime<Utc>>,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Added,
    Updated,
    NotModified,
    Errored,
}

/// One job's view of one remote dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestObject {
    pub id: ObjectId,
    /// Remote identifier, also the de-duplication key within a job
    pub guid: String,
    pub job_id: JobId,
    pub source_id: String,
    /// JSON snapshot of the remote record taken during gather
    pub content: Option<String>,
    /// Whether this object holds the latest successful local representation
    pub current: bool,
    pub report_status: Option<ReportStatus>,
    pub package_id: Option<String>,
}

/// Harvest object as created by the gather stage, before the store assigns an id.
#[derive(Debug, Clone)]
pub struct NewHarvestObject {
    pub guid: String,
    pub job_id: JobId,
    pub source_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub url: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extra {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub name: String,
}

/// Dataset in the shape of the local catalog's package schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalPackage {
    pub id: String,
    pub name: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub isopen: bool,
    pub tags: Vec<Tag>,
    pub resources: Vec<Resource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_org: Option<String>,
    pub extras: Vec<Extra>,
    pub groups: Vec<GroupRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl LocalPackage {
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    #[default]
    Active,
    Deleted,
}

/// Organization in the local catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub state: EntityState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrganization {
    pub name: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Owning organization as described by the remote record.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOrganization {
    /// Local name derived from the remote title
    pub name: String,
    pub title: String,
    pub logo_url: Option<String>,
    /// Page that may be scraped for a logo when none is given
    pub landing_page: Option<String>,
}

/// Descriptors the host shows for a harvester type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvesterInfo {
    pub name: String,
    pub title: String,
    pub description: String,
}

/// Result of importing one harvest object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Done,
    Unchanged,
    Failed,
}
