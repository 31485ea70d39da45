//! Remote catalog API implementations.
//!
//! Each module implements [`CatalogApi`](crate::harvest::CatalogApi) for one
//! remote catalog:
//! - `geonorge` - Geonorge kartkatalog search/getdata API
//! - `datanorge` - Data Norge DCAT dataset search

mod datanorge;
mod geonorge;

pub use datanorge::DataNorge;
pub use geonorge::Geonorge;
