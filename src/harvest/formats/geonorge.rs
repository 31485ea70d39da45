//! Geonorge (kartkatalog) API.
//!
//! Search: `{base}/api/search/?offset=1&limit=10&facets[0]name=theme&facets[0]value=..`
//! Detail: `{base}/api/getdata/{Uuid}` carrying `DateMetadataUpdated`.

use serde_json::Value;

use crate::config::SourceConfig;
use crate::harvest::filters::FilterTerms;
use crate::harvest::munge::{munge_name, munge_org_name};
use crate::harvest::traits::{
    CatalogApi, ChangeSource, FilterField, MappedDataset, Paging, RecordField,
    RemoteResourceError,
};
use crate::model::{HarvesterInfo, LocalPackage, RemoteOrganization, RemoteRecord, Resource, Tag};

const DOWNLOAD_BASE_URL: &str = "http://nedlasting.geonorge.no";
const CAPABILITIES_PATH: &str = "/api/capabilities/";
const DOWNLOAD_PROTOCOL: &str = "GEONORGE:DOWNLOAD";

const FILTER_FIELDS: &[FilterField] = &[
    FilterField {
        config_keys: &["text"],
        field: "text",
    },
    FilterField {
        config_keys: &["title"],
        field: "title",
    },
    FilterField {
        config_keys: &["uuid"],
        field: "uuid",
    },
    FilterField {
        config_keys: &["datatypes", "type"],
        field: "type",
    },
    FilterField {
        config_keys: &["organizations", "organization"],
        field: "organization",
    },
    FilterField {
        config_keys: &["themes", "theme"],
        field: "theme",
    },
];

const CLIENT_SIDE_FILTERS: &[(&str, RecordField)] = &[("keyword", RecordField::Keyword)];

#[derive(Debug, Clone, Copy, Default)]
pub struct Geonorge;

fn str_field<'a>(record: &'a RemoteRecord, key: &str) -> Option<&'a str> {
    record
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

impl CatalogApi for Geonorge {
    fn info(&self) -> HarvesterInfo {
        HarvesterInfo {
            name: "geonorge".to_string(),
            title: "Geonorge Server".to_string(),
            description: "Harvests from Geonorge instances.".to_string(),
        }
    }

    fn search_path(&self) -> &'static str {
        "/api/search/"
    }

    fn paging(&self) -> Paging {
        Paging::Offset { start: 1, limit: 10 }
    }

    fn results_key(&self) -> &'static str {
        "Results"
    }

    fn filter_fields(&self) -> &'static [FilterField] {
        FILTER_FIELDS
    }

    fn default_filters(&self) -> &'static [(&'static str, &'static str)] {
        &[("type", "dataset")]
    }

    /// Free text goes in `text`, every other field becomes a numbered facet.
    fn encode_filters(&self, terms: &FilterTerms) -> Vec<(String, String)> {
        let mut params = Vec::with_capacity(terms.len() * 2);
        let mut facet = 0;
        for (field, value) in terms {
            if field == "text" {
                params.push(("text".to_string(), value.clone()));
                continue;
            }
            params.push((format!("facets[{facet}]name"), field.clone()));
            params.push((format!("facets[{facet}]value"), value.clone()));
            facet += 1;
        }
        params
    }

    fn change_source(&self) -> ChangeSource {
        ChangeSource::DetailEndpoint {
            path: "/api/getdata/",
            field: "DateMetadataUpdated",
        }
    }

    fn remote_id(&self, record: &RemoteRecord) -> Option<String> {
        str_field(record, "Uuid").map(str::to_string)
    }

    fn record_organization(&self, record: &RemoteRecord) -> Option<String> {
        str_field(record, "Organization").map(str::to_string)
    }

    fn record_themes(&self, record: &RemoteRecord) -> Vec<String> {
        str_field(record, "Theme")
            .map(|t| vec![t.to_string()])
            .unwrap_or_default()
    }

    fn record_keywords(&self, record: &RemoteRecord) -> Vec<String> {
        match record.get("Keywords") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn client_side_filters(&self) -> &'static [(&'static str, RecordField)] {
        CLIENT_SIDE_FILTERS
    }

    fn map_record(
        &self,
        record: &RemoteRecord,
        config: &SourceConfig,
    ) -> Result<MappedDataset, RemoteResourceError> {
        let id = self
            .remote_id(record)
            .ok_or(RemoteResourceError::MissingField("Uuid"))?;
        let title = str_field(record, "Title").ok_or(RemoteResourceError::MissingField("Title"))?;

        let mut package = LocalPackage {
            name: munge_name(&id),
            id: id.clone(),
            title: title.to_string(),
            notes: str_field(record, "Abstract").map(str::to_string),
            url: str_field(record, "ShowDetailsUrl").map(str::to_string),
            isopen: record
                .get("IsOpenData")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ..Default::default()
        };

        package.tags = self
            .record_themes(record)
            .into_iter()
            .chain(self.record_keywords(record))
            .map(Tag::new)
            .collect();

        let downloadable = str_field(record, "DistributionProtocol") == Some(DOWNLOAD_PROTOCOL);
        if downloadable && config.get_files() {
            package.resources.push(Resource {
                url: format!("{DOWNLOAD_BASE_URL}{CAPABILITIES_PATH}{id}"),
                name: "Geonorge download API".to_string(),
                format: Some("application/json".to_string()),
                mimetype: None,
            });
        } else if let Some(url) = str_field(record, "DistributionUrl") {
            package.resources.push(Resource {
                url: url.to_string(),
                name: "Download page".to_string(),
                format: Some("HTML".to_string()),
                mimetype: Some("text/html".to_string()),
            });
        }

        let organization = self.record_organization(record).map(|title| RemoteOrganization {
            name: munge_org_name(&title),
            logo_url: str_field(record, "OrganizationLogo").map(str::to_string),
            landing_page: package.url.clone(),
            title,
        });

        Ok(MappedDataset {
            package,
            organization,
        })
    }

    fn original_url(&self, base_url: &str, guid: &str, _record: Option<&RemoteRecord>) -> String {
        format!("{}/metadata/uuid/{guid}", base_url.trim_end_matches('/'))
    }
}
