//! Per-run services handed to every stage.

use crate::config::PipelineConfig;
use crate::ids::UuidIdGenerator;
use crate::storage::{CatalogBackend, StorageContext};
use std::sync::Arc;
use tracing::debug;

/// Services shared by all stages of one run.
///
/// Owns the connection pool. Dropping the context releases every cached
/// connection, whether the run completed or failed.
pub struct RunContext {
    storage: StorageContext,
}

impl RunContext {
    pub fn new(storage: StorageContext) -> Self {
        Self { storage }
    }

    /// The default backend and identifier source, with generated tables
    /// named after `config.table_prefix`.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let storage = StorageContext::new(Arc::new(CatalogBackend), Arc::new(UuidIdGenerator))
            .with_table_prefix(config.table_prefix.clone());
        Self::new(storage)
    }

    pub fn storage(&self) -> &StorageContext {
        &self.storage
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(StorageContext::default())
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        let released = self.storage.pool().release();
        if released > 0 {
            debug!("Released {} pooled connections", released);
        }
    }
}
