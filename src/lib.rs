pub mod ckan;
pub mod config;
pub mod executor;
pub mod fetch;
pub mod harvest;
pub mod logging;
pub mod memory;
pub mod model;
pub mod traits;

#[cfg(test)]
mod testing;

// Re-export common types for convenience
pub use executor::*;
pub use model::*;
pub use traits::*;
