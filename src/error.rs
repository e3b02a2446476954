//! Top-level error for fallible construction.
//!
//! Once an orchestrator is running, store failures are reported through the
//! journal and return values instead; this type only surfaces from setup.

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::storage::traits::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The entity catalog is inconsistent. Fatal at startup.
    #[error("invalid entity catalog: {0}")]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
