//! Function registry: name → {image, runtime}
//!
//! The registry is the only shared mutable state in the platform. Writers
//! insert complete records; readers always observe either no record or a
//! whole one.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PlatformConfig;
use crate::types::{FunctionSpec, RegistryError};

pub use memory::InMemoryRegistry;
pub use sqlite::SqliteRegistry;

/// Storage for registered functions
#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    /// Insert a new function. Names are unique: a second `put` for an existing
    /// name fails with [`RegistryError::AlreadyExists`] and leaves the first
    /// record untouched.
    async fn put(&self, spec: FunctionSpec) -> Result<(), RegistryError>;

    /// Look up a function by name
    async fn get(&self, name: &str) -> Result<FunctionSpec, RegistryError>;
}

/// Open the registry selected by configuration
pub fn open(config: &PlatformConfig) -> Result<Arc<dyn FunctionRegistry>, RegistryError> {
    if config.uses_memory_registry() {
        tracing::info!("Using in-memory function registry");
        return Ok(Arc::new(InMemoryRegistry::new()));
    }

    tracing::info!("Opening function registry at {}", config.db_path.display());
    Ok(Arc::new(SqliteRegistry::open(&config.db_path)?))
}
