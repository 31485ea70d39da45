//! Per-source harvester configuration.
//!
//! Catalog admins enter a JSON object in the harvest source form. It is
//! validated once by [`validate_config`] when saved and parsed again by every
//! stage through [`SourceConfig::parse`]; no stage keeps it around.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Keys that take a string or a list of strings.
pub const STRING_OR_LIST_KEYS: &[&str] = &[
    "text",
    "q",
    "title",
    "uuid",
    "type",
    "datatypes",
    "organizations",
    "organization",
    "themes",
    "theme",
    "keyword",
    "default_tags",
    "default_groups",
    "exclude_organizations",
    "exclude_themes",
    "exclude_keywords",
];

const BOOL_KEYS: &[&str] = &[
    "force_all",
    "create_orgs",
    "get_files",
    "clean_tags",
    "keep_local_extras",
];

const DEFAULT_API_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration must be a JSON object")]
    NotAnObject,

    #[error("{field} {reason}")]
    InvalidField { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn values(&self) -> Vec<String> {
        match self {
            StringOrList::One(s) => vec![s.clone()],
            StringOrList::Many(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOrgs {
    Create,
    OnlyLocal,
}

/// How the owning organization of an imported package is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrgPolicy {
    /// Always the harvest source's own organization
    SourceOrg,
    /// Remote organization if it already exists locally
    OnlyLocal,
    /// Remote organization, created locally when missing
    Create,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub force_all: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_orgs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_orgs: Option<RemoteOrgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_tags: Option<StringOrList>,
    pub default_extras: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_groups: Option<StringOrList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_organizations: Option<StringOrList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_themes: Option<StringOrList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_keywords: Option<StringOrList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get_files: Option<bool>,
    pub clean_tags: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub keep_local_extras: bool,
    /// Search filters and any key this crate does not know about
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl SourceConfig {
    /// Parses a source configuration; an absent or blank string is the
    /// default configuration.
    pub fn parse(raw: Option<&str>) -> Result<Self, ConfigError> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(raw) => {
                let value: Value = serde_json::from_str(raw)?;
                let value = normalize(value)?;
                Ok(serde_json::from_value(value)?)
            }
        }
    }

    /// Values configured for a string-or-list filter field.
    pub fn filter(&self, key: &str) -> Option<Vec<String>> {
        match self.fields.get(key)? {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn default_tags(&self) -> Vec<String> {
        self.default_tags
            .as_ref()
            .map(StringOrList::values)
            .unwrap_or_default()
    }

    pub fn default_groups(&self) -> Vec<String> {
        self.default_groups
            .as_ref()
            .map(StringOrList::values)
            .unwrap_or_default()
    }

    /// Default extras rendered as strings, the way the package schema stores them.
    pub fn default_extras(&self) -> Vec<(String, String)> {
        self.default_extras
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }

    pub fn org_policy(&self) -> OrgPolicy {
        match (self.remote_orgs, self.create_orgs) {
            (Some(RemoteOrgs::Create), _) => OrgPolicy::Create,
            (Some(RemoteOrgs::OnlyLocal), _) => OrgPolicy::OnlyLocal,
            (None, Some(false)) => OrgPolicy::SourceOrg,
            (None, _) => OrgPolicy::Create,
        }
    }

    pub fn api_version(&self) -> u32 {
        self.api_version.unwrap_or(DEFAULT_API_VERSION)
    }

    pub fn get_files(&self) -> bool {
        self.get_files.unwrap_or(true)
    }
}

/// Checks field types and coerces `api_version` given as a numeric string.
fn normalize(value: Value) -> Result<Value, ConfigError> {
    let Value::Object(mut map) = value else {
        return Err(ConfigError::NotAnObject);
    };

    for key in STRING_OR_LIST_KEYS {
        match map.get(*key) {
            None | Some(Value::String(_)) => {}
            Some(Value::Array(items)) => {
                if let Some(bad) = items.iter().find(|v| !v.is_string()) {
                    return Err(ConfigError::invalid(
                        key,
                        format!("must be a string or a list of strings, {bad} is neither"),
                    ));
                }
            }
            Some(other) => {
                return Err(ConfigError::invalid(
                    key,
                    format!("must be a string or a list of strings, {other} is neither"),
                ))
            }
        }
    }

    for key in BOOL_KEYS {
        if let Some(v) = map.get(*key) {
            if !v.is_boolean() {
                return Err(ConfigError::invalid(
                    key,
                    "must be a boolean, either true or false",
                ));
            }
        }
    }

    if let Some(v) = map.get("remote_orgs") {
        if !matches!(v.as_str(), Some("create") | Some("only_local")) {
            return Err(ConfigError::invalid(
                "remote_orgs",
                "must be either \"create\" or \"only_local\"",
            ));
        }
    }

    if let Some(v) = map.get("default_extras") {
        if !v.is_object() {
            return Err(ConfigError::invalid(
                "default_extras",
                "must be an object of key/value pairs",
            ));
        }
    }

    if let Some(v) = map.get("api_key") {
        if !v.is_string() {
            return Err(ConfigError::invalid("api_key", "must be a string"));
        }
    }

    if let Some(v) = map.get("api_version").cloned() {
        let version = match &v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        match version.and_then(|n| u32::try_from(n).ok()) {
            Some(n) => {
                map.insert("api_version".to_string(), Value::from(n));
            }
            None => return Err(ConfigError::invalid("api_version", "must be an integer")),
        }
    }

    Ok(Value::Object(map))
}

/// Validates the configuration entered for a harvest source.
///
/// Returns the string to store: blank input unchanged, otherwise the
/// normalized JSON.
pub fn validate_config(raw: Option<&str>) -> Result<Option<String>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(Some(raw.to_string()));
    }

    let value: Value = serde_json::from_str(raw)?;
    let value = normalize(value)?;
    // Make sure the typed view accepts it too
    let _: SourceConfig = serde_json::from_value(value.clone())?;
    Ok(Some(value.to_string()))
}
