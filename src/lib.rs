//! Aavegotchi wearable supply audit
//!
//! Cross-checks item circulation between the core subgraph, the diamond
//! contract and a local metadata export, and maintains that export.
//! Shared by the `items_check`, `fetch_metadata` and `find_gotchi` binaries.

pub mod catalog;
pub mod config;
pub mod fetcher;
pub mod logging;
pub mod models;
pub mod persist;
pub mod reconcile;
pub mod scheduler;
pub mod shutdown;
pub mod snapshot;
pub mod sources;

pub use catalog::{ItemCatalog, ItemType};
pub use config::AuditConfig;
pub use reconcile::{ItemOutcome, ReconciliationEngine};
pub use scheduler::{BatchScheduler, RunSummary};
