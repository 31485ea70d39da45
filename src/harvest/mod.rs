//! Harvest module - remote catalog harvesting pipeline.
//!
//! This module provides the harvesting stages and their building blocks:
//! - **APIs**: [`CatalogApi`] descriptions of remote catalogs, see [`formats`]
//! - **Gather**: paged [`search`], filter [`filters`] expansion and incremental
//!   [`changes`] detection feeding the [`gather`] stage
//! - **Import**: reconciliation with the local catalog in [`import`]
//! - **Pipeline**: the [`Harvester`] plugin and job runner

pub mod changes;
pub mod filters;
pub mod formats;
pub mod gather;
pub mod import;
pub mod logo;
pub mod munge;
pub mod pipeline;
pub mod search;
pub mod traits;

// Re-export commonly used types
pub use traits::{
    CatalogApi, ChangeSource, FilterField, MappedDataset, Paging, RecordField,
    RemoteResourceError, SearchError,
};

pub use formats::{DataNorge, Geonorge};
pub use import::{ImportError, ProvenanceRecord, PROVENANCE_KEY};
pub use logo::HtmlLogoResolver;
pub use pipeline::{HarvestStats, Harvester, StageContext};
