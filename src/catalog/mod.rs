//! Catalog Resolver and Catalog Reloader (§4.5, §4.9).

pub mod reloader;
pub mod resolver;

pub use reloader::{ApplyResult, CatalogDiff, CatalogReloader, ReloadError};
pub use resolver::{CatalogResolver, ResolvedTool};
