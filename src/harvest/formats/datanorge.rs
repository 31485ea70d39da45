//! Data Norge (data.norge.no) DCAT search API.
//!
//! Records follow DCAT-AP-NO: text fields are either plain strings or
//! language maps (`{"nb": .., "en": ..}`), identifiers are URIs.

use serde_json::Value;
use uuid::Uuid;

use crate::config::SourceConfig;
use crate::harvest::munge::munge_org_name;
use crate::harvest::traits::{
    CatalogApi, ChangeSource, FilterField, MappedDataset, Paging, RecordField,
    RemoteResourceError,
};
use crate::model::{HarvesterInfo, LocalPackage, RemoteOrganization, RemoteRecord, Resource, Tag};

const LANGUAGES: &[&str] = &["nb", "no", "nn", "en"];

const FILTER_FIELDS: &[FilterField] = &[FilterField {
    config_keys: &["text", "q"],
    field: "q",
}];

const CLIENT_SIDE_FILTERS: &[(&str, RecordField)] = &[
    ("organizations", RecordField::Organization),
    ("organization", RecordField::Organization),
    ("themes", RecordField::Theme),
    ("theme", RecordField::Theme),
    ("keyword", RecordField::Keyword),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct DataNorge;

/// Text of a plain or language-mapped field, preferring Norwegian.
fn localized(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => LANGUAGES
            .iter()
            .find_map(|lang| map.get(*lang).and_then(Value::as_str))
            .or_else(|| map.values().find_map(Value::as_str)),
        Value::Array(items) => return items.iter().find_map(localized),
        _ => None,
    }?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn localized_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(localized).collect(),
        Some(other) => localized(other).into_iter().collect(),
        None => Vec::new(),
    }
}

fn field(record: &RemoteRecord, key: &str) -> Option<String> {
    record.get(key).and_then(localized)
}

/// Theme label: a localized title, or the last segment of a theme URI.
fn theme_label(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map
            .get("title")
            .and_then(localized)
            .or_else(|| map.get("uri").and_then(Value::as_str).and_then(last_segment)),
        Value::String(s) if s.contains('/') => last_segment(s),
        other => localized(other),
    }
}

fn last_segment(uri: &str) -> Option<String> {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl CatalogApi for DataNorge {
    fn info(&self) -> HarvesterInfo {
        HarvesterInfo {
            name: "datanorge".to_string(),
            title: "Data Norge Server".to_string(),
            description: "Harvests from Data Norge instances.".to_string(),
        }
    }

    fn search_path(&self) -> &'static str {
        "/api/datasets/search"
    }

    fn paging(&self) -> Paging {
        Paging::Page {
            start: 1,
            size: Some(100),
        }
    }

    fn results_key(&self) -> &'static str {
        "datasets"
    }

    fn filter_fields(&self) -> &'static [FilterField] {
        FILTER_FIELDS
    }

    fn change_source(&self) -> ChangeSource {
        ChangeSource::RecordField("modified")
    }

    fn remote_id(&self, record: &RemoteRecord) -> Option<String> {
        record
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// Identifiers are URIs; the local id is a UUID derived from them.
    fn dedup_key(&self, record: &RemoteRecord) -> Option<String> {
        let id = self.remote_id(record)?;
        let uuid = Uuid::parse_str(&id)
            .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_URL, id.as_bytes()));
        Some(uuid.to_string())
    }

    fn record_organization(&self, record: &RemoteRecord) -> Option<String> {
        match record.get("publisher")? {
            Value::Object(publisher) => publisher.get("name").and_then(localized),
            other => localized(other),
        }
    }

    fn record_themes(&self, record: &RemoteRecord) -> Vec<String> {
        match record.get("theme") {
            Some(Value::Array(items)) => items.iter().filter_map(theme_label).collect(),
            Some(other) => theme_label(other).into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn record_keywords(&self, record: &RemoteRecord) -> Vec<String> {
        localized_list(record.get("keyword"))
    }

    fn client_side_filters(&self) -> &'static [(&'static str, RecordField)] {
        CLIENT_SIDE_FILTERS
    }

    fn map_record(
        &self,
        record: &RemoteRecord,
        _config: &SourceConfig,
    ) -> Result<MappedDataset, RemoteResourceError> {
        let id = self
            .dedup_key(record)
            .ok_or(RemoteResourceError::MissingField("id"))?;
        let title = field(record, "title").ok_or(RemoteResourceError::MissingField("title"))?;
        let landing_page = field(record, "landingPage");

        let mut package = LocalPackage {
            name: id.clone(),
            id,
            title,
            notes: field(record, "description"),
            url: landing_page.clone(),
            isopen: record
                .get("accessRights")
                .and_then(localized)
                .map(|rights| rights.eq_ignore_ascii_case("PUBLIC") || rights.ends_with("/PUBLIC"))
                .unwrap_or(false),
            ..Default::default()
        };
        package.tags = self
            .record_themes(record)
            .into_iter()
            .chain(self.record_keywords(record))
            .map(Tag::new)
            .collect();

        if let Some(distributions) = record.get("distribution") {
            let distributions = match distributions {
                Value::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            for (index, dist) in distributions.into_iter().enumerate() {
                let Value::Object(dist) = dist else {
                    return Err(RemoteResourceError::Malformed {
                        field: "distribution",
                        reason: format!("entry {index} is not an object"),
                    });
                };
                let Some(url) = ["accessURL", "downloadURL"]
                    .iter()
                    .find_map(|k| dist.get(*k).and_then(localized))
                else {
                    continue;
                };
                let format = dist.get("format").and_then(localized);
                let name = dist
                    .get("title")
                    .and_then(localized)
                    .or_else(|| format.clone())
                    .unwrap_or_else(|| format!("Distribution {}", index + 1));
                package.resources.push(Resource {
                    url,
                    name,
                    format,
                    mimetype: dist.get("mediaType").and_then(localized),
                });
            }
        }

        let organization = self.record_organization(record).map(|title| RemoteOrganization {
            name: munge_org_name(&title),
            logo_url: None,
            landing_page,
            title,
        });

        Ok(MappedDataset {
            package,
            organization,
        })
    }

    fn original_url(&self, base_url: &str, guid: &str, record: Option<&RemoteRecord>) -> String {
        record
            .and_then(|r| field(r, "landingPage"))
            .unwrap_or_else(|| format!("{}/datasets/{guid}", base_url.trim_end_matches('/')))
    }
}
