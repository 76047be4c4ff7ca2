//! Scoped configuration engine.
//!
//! [`ConfigService`] combines a [`scopecfg_core::store::ConfigStore`] with a
//! definitions cache, a TTL-bounded resolution cache and a per-tuple write
//! coordinator. Construct one per store and clone it freely.
//!
//! ```rust,ignore
//! let service = ConfigService::new(Arc::new(store), EngineConfig::default());
//! let theme = service
//!   .get_value("ui.theme.primaryColor", &ScopeContext::persona("rachel"))
//!   .await?;
//! ```

pub mod bulk;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod registry;
pub mod service;
pub mod transfer;

pub use bulk::BulkItem;
pub use cache::CacheStats;
pub use config::{CacheConfig, EngineConfig};
pub use scopecfg_core::{Error, Result};
pub use service::{ConfigService, PutValue};
pub use transfer::{ExportDocument, ExportFilter, ImportMode};

#[cfg(test)]
mod tests;
