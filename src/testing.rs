//! Shared fixtures for unit tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::fetch::{FetchError, RemoteFetcher};
use crate::model::{HarvestJob, HarvestSource, JobStatus};
use crate::traits::LogoResolver;

/// Fetcher answering from a route table; the first route whose patterns
/// all occur in the URL wins, anything else is a 404.
#[derive(Default)]
pub struct RouteFetcher {
    routes: Vec<(Vec<String>, String)>,
    requests: Mutex<Vec<String>>,
}

impl RouteFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, patterns: &[&str], body: impl Into<String>) -> Self {
        let patterns = patterns.iter().map(|p| p.to_string()).collect();
        self.routes.push((patterns, body.into()));
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteFetcher for RouteFetcher {
    async fn fetch(&self, url: &str, _body: Option<&Value>) -> Result<Vec<u8>, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        self.routes
            .iter()
            .find(|(patterns, _)| patterns.iter().all(|p| url.contains(p.as_str())))
            .map(|(_, body)| body.clone().into_bytes())
            .ok_or_else(|| FetchError::ContentNotFound {
                url: url.to_string(),
            })
    }
}

pub struct StaticLogo(pub String);

#[async_trait]
impl LogoResolver for StaticLogo {
    async fn resolve_logo(&self, _page_url: &str) -> Option<String> {
        Some(self.0.clone())
    }
}

pub fn source(source_id: &str, config: Option<&str>) -> HarvestSource {
    HarvestSource {
        id: source_id.to_string(),
        url: "http://geo.test".to_string(),
        title: "Geo test".to_string(),
        source_type: "geonorge".to_string(),
        config: config.map(str::to_string),
        owner_org: None,
    }
}

/// A running job.
pub fn job(id: &str, source_id: &str, config: Option<&str>) -> HarvestJob {
    HarvestJob {
        id: id.to_string(),
        source: source(source_id, config),
        gather_started: Some(Utc::now()),
        status: JobStatus::Running,
    }
}

pub fn finished_job(id: &str, source_id: &str, started: DateTime<Utc>) -> HarvestJob {
    HarvestJob {
        id: id.to_string(),
        source: source(source_id, None),
        gather_started: Some(started),
        status: JobStatus::Finished,
    }
}

/// A complete Geonorge search hit.
pub fn geonorge_record(uuid: &str, organization: &str) -> Value {
    json!({
        "Uuid": uuid,
        "Title": format!("Datasett {uuid}"),
        "Abstract": "Beskrivelse",
        "ShowDetailsUrl": format!("https://kartkatalog.geonorge.no/metadata/{uuid}"),
        "IsOpenData": true,
        "Theme": "Samferdsel",
        "Organization": organization,
        "OrganizationLogo": "https://register.geonorge.no/logo.png",
        "DistributionProtocol": "WWW:DOWNLOAD-1.0-http--download",
        "DistributionUrl": format!("https://example.no/{uuid}.zip"),
        "Type": "dataset"
    })
}

pub fn geonorge_page_of(results: Vec<Value>) -> String {
    json!({"NumFound": results.len(), "Results": results}).to_string()
}

/// A search page with minimal hits for the given uuids.
pub fn geonorge_page(uuids: &[&str]) -> String {
    geonorge_page_of(
        uuids
            .iter()
            .map(|uuid| json!({"Uuid": uuid, "Title": format!("Datasett {uuid}")}))
            .collect(),
    )
}
