//! Incremental change detection.
//!
//! Once a source has had an error-free job, only records modified since that
//! job need to be harvested again.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::fetch::RemoteFetcher;
use crate::harvest::traits::{CatalogApi, ChangeSource, SearchError};
use crate::model::RemoteRecord;

/// Parses a last-modified value as sent by remote catalogs.
///
/// Accepts RFC 3339, naive ISO-8601 date-times (taken as UTC) and plain dates.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ts.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

/// Whether a record last modified at `modified` predates `since`.
///
/// Missing or unparseable values count as modified.
fn is_unchanged(modified: Option<&Value>, since: DateTime<Utc>) -> bool {
    modified
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .is_some_and(|ts| ts < since)
}

/// Drops the candidates not modified since `since`.
///
/// Runs one detail request per candidate, strictly in sequence, when the API
/// keeps modification times behind a detail endpoint.
///
/// # Errors
///
/// Returns [`SearchError`] if a detail request or its decoding fails; the
/// caller falls back to a full search.
#[instrument(skip(api, fetcher, candidates), fields(candidates = candidates.len()))]
pub async fn filter_unchanged<A: CatalogApi + ?Sized>(
    api: &A,
    fetcher: &dyn RemoteFetcher,
    candidates: Vec<RemoteRecord>,
    base_url: &str,
    since: DateTime<Utc>,
) -> Result<Vec<RemoteRecord>, SearchError> {
    let base_url = base_url.trim_end_matches('/');
    let mut changed = Vec::with_capacity(candidates.len());

    for record in candidates {
        let unchanged = match api.change_source() {
            ChangeSource::RecordField(field) => is_unchanged(record.get(field), since),
            ChangeSource::DetailEndpoint { path, field } => {
                let Some(id) = api.remote_id(&record) else {
                    changed.push(record);
                    continue;
                };
                let url = format!("{base_url}{path}{id}");
                let content = fetcher
                    .fetch(&url, None)
                    .await
                    .map_err(|source| SearchError::Fetch {
                        url: url.clone(),
                        source,
                    })?;
                let detail: Value = serde_json::from_slice(&content)
                    .map_err(|source| SearchError::Decode { url, source })?;
                is_unchanged(detail.get(field), since)
            }
        };

        if unchanged {
            debug!(
                id = api.remote_id(&record).unwrap_or_default(),
                "dataset is up to date, skipping"
            );
        } else {
            changed.push(record);
        }
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use crate::harvest::formats::{DataNorge, Geonorge};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;

    struct DetailFetcher {
        details: HashMap<String, Value>,
    }

    #[async_trait]
    impl RemoteFetcher for DetailFetcher {
        async fn fetch(
            &self,
            url: &str,
            _body: Option<&serde_json::Value>,
        ) -> Result<Vec<u8>, FetchError> {
            match self.details.get(url) {
                Some(v) => Ok(v.to_string().into_bytes()),
                None => Err(FetchError::ContentNotFound {
                    url: url.to_string(),
                }),
            }
        }
    }

    fn record(value: Value) -> RemoteRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01T12:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T13:30:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T12:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T12:30:00.000"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-03-01"),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[tokio::test]
    async fn test_detail_endpoint_drops_old_records() {
        let mut details = HashMap::new();
        details.insert(
            "http://geo.test/api/getdata/old".to_string(),
            json!({"Uuid": "old", "DateMetadataUpdated": "2023-01-01T00:00:00"}),
        );
        details.insert(
            "http://geo.test/api/getdata/new".to_string(),
            json!({"Uuid": "new", "DateMetadataUpdated": "2024-06-01T00:00:00"}),
        );
        details.insert(
            "http://geo.test/api/getdata/unknown".to_string(),
            json!({"Uuid": "unknown"}),
        );
        let fetcher = DetailFetcher { details };
        let candidates = vec![
            record(json!({"Uuid": "old"})),
            record(json!({"Uuid": "new"})),
            record(json!({"Uuid": "unknown"})),
        ];
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let changed = filter_unchanged(&Geonorge, &fetcher, candidates, "http://geo.test/", since)
            .await
            .unwrap();

        let ids: Vec<_> = changed.iter().map(|r| r["Uuid"].clone()).collect();
        assert_eq!(ids, vec![json!("new"), json!("unknown")]);
    }

    #[tokio::test]
    async fn test_detail_failure_is_search_error() {
        let fetcher = DetailFetcher {
            details: HashMap::new(),
        };
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let err = filter_unchanged(
            &Geonorge,
            &fetcher,
            vec![record(json!({"Uuid": "gone"}))],
            "http://geo.test",
            since,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SearchError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_record_field_needs_no_requests() {
        let fetcher = DetailFetcher {
            details: HashMap::new(),
        };
        let candidates = vec![
            record(json!({"id": "https://data.norge.no/a", "modified": "2020-05-01"})),
            record(json!({"id": "https://data.norge.no/b", "modified": "2024-05-01"})),
        ];
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let changed = filter_unchanged(&DataNorge, &fetcher, candidates, "http://dn.test", since)
            .await
            .unwrap();

        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0]["id"], json!("https://data.norge.no/b"));
    }
}
