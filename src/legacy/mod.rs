//! One-time import of the legacy JSON document and transcript files.

pub mod log_name;
pub mod migrator;
pub mod store;

pub use migrator::{CategoryReport, LegacyMigrator, MigrationCategory, MigrationSummary};
pub use store::{JsonDocStore, LegacyStore, MemoryLegacyStore};
