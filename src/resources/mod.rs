// src/resources/mod.rs
// Content-addressed resource summaries with bidirectional mention links

mod loader;
mod summary;

pub use loader::{ResourceLoader, VaultLoader};
pub use summary::{Mention, ResourceStore, ResourceSummary, ensure_resource_summary};
