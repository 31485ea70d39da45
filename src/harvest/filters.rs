//! Filter combination builder.
//!
//! Remote search endpoints take one value per filter field, while a source
//! configuration may list several values per field. Every combination is
//! searched separately.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::config::SourceConfig;
use crate::harvest::traits::CatalogApi;

/// One single-valued filter combination, keyed by search field.
pub type FilterTerms = BTreeMap<String, String>;

/// Cartesian product of multi-valued fields.
///
/// Fields with no values are ignored. No populated field at all yields one
/// empty combination, which stands for an unfiltered search.
pub fn combinations(fields: &BTreeMap<String, Vec<String>>) -> Vec<FilterTerms> {
    let populated: Vec<(&String, &Vec<String>)> =
        fields.iter().filter(|(_, values)| !values.is_empty()).collect();

    if populated.is_empty() {
        return vec![FilterTerms::new()];
    }

    populated
        .iter()
        .map(|(_, values)| values.iter())
        .multi_cartesian_product()
        .map(|combo| {
            populated
                .iter()
                .map(|(field, _)| (*field).clone())
                .zip(combo.into_iter().cloned())
                .collect()
        })
        .collect()
}

/// Expands the filter fields `api` recognizes in `config` into combinations.
pub fn expand<A: CatalogApi + ?Sized>(api: &A, config: &SourceConfig) -> Vec<FilterTerms> {
    let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for filter in api.filter_fields() {
        let values: Vec<String> = filter
            .config_keys
            .iter()
            .filter_map(|key| config.filter(key))
            .flatten()
            .unique()
            .collect();
        if !values.is_empty() {
            fields.insert(filter.field.to_string(), values);
        }
    }

    for (field, value) in api.default_filters() {
        fields
            .entry(field.to_string())
            .or_insert_with(|| vec![value.to_string()]);
    }

    combinations(&fields)
}
