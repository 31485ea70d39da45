//! Core traits and types for the harvest pipeline.
//!
//! This module defines what varies between remote catalogs:
//! - Remote API descriptions via [`CatalogApi`]
//! - Paging and change-detection strategies ([`Paging`], [`ChangeSource`])
//! - The mapped output of one remote record ([`MappedDataset`])
//! - Standardized error types for search and remote metadata

use serde_json::Value;
use thiserror::Error;

use crate::config::SourceConfig;
use crate::fetch::FetchError;
use crate::harvest::filters::FilterTerms;
use crate::model::{HarvesterInfo, LocalPackage, RemoteOrganization, RemoteRecord};

// ============================================================================
// Remote API Trait
// ============================================================================

/// Description of one remote catalog API.
///
/// The harvester itself is generic; everything that differs between remote
/// catalogs (endpoints, paging, filter encoding, field names) lives in an
/// implementation of this trait. Implementations are stateless tables and
/// must be `Send + Sync`.
pub trait CatalogApi: Send + Sync {
    /// Descriptors shown by the host for this harvester type.
    fn info(&self) -> HarvesterInfo;

    /// Path of the search endpoint, appended to the source URL.
    fn search_path(&self) -> &'static str;

    /// Paging scheme of the search endpoint.
    fn paging(&self) -> Paging;

    /// Key of the result list in a search response.
    fn results_key(&self) -> &'static str;

    /// Filter fields the search endpoint understands.
    fn filter_fields(&self) -> &'static [FilterField];

    /// Filters applied when the configuration leaves a field unset.
    fn default_filters(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    /// Turns one filter combination into query parameters.
    ///
    /// The default sends every field as its own parameter.
    fn encode_filters(&self, terms: &FilterTerms) -> Vec<(String, String)> {
        terms.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// How the last modification time of a record is found.
    fn change_source(&self) -> ChangeSource;

    /// Identifier of the record on the remote side.
    fn remote_id(&self, record: &RemoteRecord) -> Option<String>;

    /// De-duplication key, stored as the harvest object guid.
    ///
    /// Defaults to the remote identifier.
    fn dedup_key(&self, record: &RemoteRecord) -> Option<String> {
        self.remote_id(record)
    }

    fn record_organization(&self, record: &RemoteRecord) -> Option<String>;

    fn record_themes(&self, record: &RemoteRecord) -> Vec<String>;

    fn record_keywords(&self, record: &RemoteRecord) -> Vec<String>;

    /// Config keys the search endpoint cannot filter on, applied to records
    /// after the search. Each maps to the record field family it matches.
    fn client_side_filters(&self) -> &'static [(&'static str, RecordField)] {
        &[]
    }

    /// Records describing a harvest source rather than a dataset are skipped.
    fn is_harvest_source(&self, record: &RemoteRecord) -> bool {
        ["type", "Type"]
            .iter()
            .any(|k| record.get(*k).and_then(Value::as_str) == Some("harvest"))
    }

    /// Provenance chain carried by the remote record itself, if any.
    fn harvested_provenance(&self, record: &RemoteRecord) -> Option<Vec<Value>> {
        match record.get("metadata_provenance")? {
            Value::Array(items) => Some(items.clone()),
            Value::String(s) => serde_json::from_str::<Vec<Value>>(s).ok(),
            _ => None,
        }
    }

    /// Maps a remote record into the local package schema.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteResourceError`] if required fields are missing.
    fn map_record(
        &self,
        record: &RemoteRecord,
        config: &SourceConfig,
    ) -> Result<MappedDataset, RemoteResourceError>;

    /// URL of the original remote document for error reports.
    fn original_url(&self, base_url: &str, guid: &str, record: Option<&RemoteRecord>) -> String;
}

// ============================================================================
// Strategies
// ============================================================================

/// Paging scheme of a search endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paging {
    /// `offset` starting at `start`, advanced by `limit`
    Offset { start: u64, limit: u64 },
    /// `page` counter starting at `start`, with an optional `size` parameter
    Page { start: u64, size: Option<u64> },
}

/// Where the last modification time of a record comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// A per-record detail endpoint at `{base}{path}{remote_id}` holding `field`
    DetailEndpoint {
        path: &'static str,
        field: &'static str,
    },
    /// A field of the search result itself
    RecordField(&'static str),
}

/// One filterable field: config keys accepted for it and the search field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterField {
    pub config_keys: &'static [&'static str],
    pub field: &'static str,
}

/// Record attribute family matched by client-side filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordField {
    Organization,
    Theme,
    Keyword,
}

// ============================================================================
// Mapping Output
// ============================================================================

/// A remote record mapped into local terms.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedDataset {
    pub package: LocalPackage,
    /// Owning organization as described remotely
    pub organization: Option<RemoteOrganization>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while searching a remote catalog.
///
/// The gather stage catches these to fall back from incremental to full
/// search, or to record a gather error.
#[derive(Error, Debug)]
pub enum SearchError {
    /// Request towards the remote failed
    #[error("Error sending request to remote {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },

    /// Response body was not JSON
    #[error("Response from {url} was not JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// Response was JSON but not shaped as expected
    #[error("Unexpected response from {url}: {reason}")]
    Unexpected { url: String, reason: String },
}

/// Remote metadata is incomplete or unusable.
#[derive(Error, Debug)]
pub enum RemoteResourceError {
    #[error("Remote record lacks required field '{0}'")]
    MissingField(&'static str),

    #[error("Remote field '{field}' is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },
}
