//! Paged search against a remote catalog.

use serde_json::Value;
use tracing::{debug, instrument};
use url::form_urlencoded;

use crate::fetch::RemoteFetcher;
use crate::harvest::filters::FilterTerms;
use crate::harvest::traits::{CatalogApi, Paging, SearchError};
use crate::model::RemoteRecord;

/// Paging position of a running search.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    paging: Paging,
    position: u64,
}

impl Cursor {
    fn new(paging: Paging) -> Self {
        let position = match paging {
            Paging::Offset { start, .. } | Paging::Page { start, .. } => start,
        };
        Self { paging, position }
    }

    fn params(&self) -> Vec<(String, String)> {
        match self.paging {
            Paging::Offset { limit, .. } => vec![
                ("offset".to_string(), self.position.to_string()),
                ("limit".to_string(), limit.to_string()),
            ],
            Paging::Page { size, .. } => {
                let mut params = vec![("page".to_string(), self.position.to_string())];
                if let Some(size) = size {
                    params.push(("size".to_string(), size.to_string()));
                }
                params
            }
        }
    }

    fn advance(&mut self) {
        self.position += match self.paging {
            Paging::Offset { limit, .. } => limit,
            Paging::Page { .. } => 1,
        };
    }
}

/// Builds a URL with its query parameters sorted by key.
pub fn build_url(base: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let mut query = form_urlencoded::Serializer::new(String::new());
    for (key, value) in sorted {
        query.append_pair(key, value);
    }
    let query = query.finish();

    if query.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{query}")
    }
}

/// Result list of one search response page.
///
/// A response without the result key counts as an empty page.
fn page_results(url: &str, response: Value, key: &str) -> Result<Vec<RemoteRecord>, SearchError> {
    let Value::Object(mut response) = response else {
        return Err(SearchError::Unexpected {
            url: url.to_string(),
            reason: "response is not a JSON object".to_string(),
        });
    };

    match response.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(record) => Some(record),
                _ => None,
            })
            .collect()),
        Some(_) => Err(SearchError::Unexpected {
            url: url.to_string(),
            reason: format!("'{key}' is not a list"),
        }),
    }
}

/// Searches `base_url` with one filter combination, following pages until
/// an empty one comes back.
///
/// # Errors
///
/// Returns [`SearchError`] if a page cannot be fetched or decoded; pages
/// already collected for this combination are discarded.
#[instrument(skip(api, fetcher, terms), fields(terms = ?terms))]
pub async fn search<A: CatalogApi + ?Sized>(
    api: &A,
    fetcher: &dyn RemoteFetcher,
    base_url: &str,
    terms: &FilterTerms,
) -> Result<Vec<RemoteRecord>, SearchError> {
    let endpoint = format!("{}{}", base_url.trim_end_matches('/'), api.search_path());
    let filter_params = api.encode_filters(terms);
    let mut cursor = Cursor::new(api.paging());
    let mut records = Vec::new();

    loop {
        let mut params = filter_params.clone();
        params.extend(cursor.params());
        let url = build_url(&endpoint, &params);
        debug!(%url, "searching remote catalog");

        let content = fetcher
            .fetch(&url, None)
            .await
            .map_err(|source| SearchError::Fetch {
                url: url.clone(),
                source,
            })?;
        let response: Value =
            serde_json::from_slice(&content).map_err(|source| SearchError::Decode {
                url: url.clone(),
                source,
            })?;

        let page = page_results(&url, response, api.results_key())?;
        if page.is_empty() {
            break;
        }
        records.extend(page);
        cursor.advance();
    }

    debug!(count = records.len(), "search finished");
    Ok(records)
}
