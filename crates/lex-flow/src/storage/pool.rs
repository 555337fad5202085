//! Connection reuse and generated-table bookkeeping.

use crate::error::{Result, ResultExt};
use crate::ids::{IdGenerator, UuidIdGenerator};
use crate::storage::catalog::CatalogBackend;
use crate::storage::relational::{ConnParams, Connection, RelationalBackend};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    url: String,
    params: ConnParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GeneratedTable {
    key: PoolKey,
    table: String,
}

/// Caches one connection per (URL, parameters) pair.
///
/// The pool also remembers which tables were created on behalf of the
/// pipeline so they can be dropped once nothing refers to them.
pub struct ConnectionPool {
    backend: Arc<dyn RelationalBackend>,
    connections: Mutex<HashMap<PoolKey, Arc<dyn Connection>>>,
    generated: Mutex<Vec<GeneratedTable>>,
}

impl ConnectionPool {
    pub fn new(backend: Arc<dyn RelationalBackend>) -> Self {
        Self {
            backend,
            connections: Mutex::new(HashMap::new()),
            generated: Mutex::new(Vec::new()),
        }
    }

    /// Return the cached connection for `db_url`/`params`, opening one if needed.
    pub fn acquire(&self, db_url: &str, params: &ConnParams) -> Result<Arc<dyn Connection>> {
        let key = PoolKey {
            url: db_url.to_string(),
            params: params.clone(),
        };
        let mut connections = self.connections.lock();
        if let Some(conn) = connections.get(&key) {
            return Ok(conn.clone());
        }
        let conn = self
            .backend
            .connect(db_url, params)
            .context(format!("Failed to connect to {db_url}"))?;
        debug!("Opened connection to {}", db_url);
        connections.insert(key, conn.clone());
        Ok(conn)
    }

    /// Number of cached connections.
    pub fn open_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Remember that `table` was created by the pipeline and may be dropped.
    /// Recording the same table twice has no effect.
    pub fn record_generated(&self, db_url: &str, params: &ConnParams, table: &str) {
        let entry = GeneratedTable {
            key: PoolKey {
                url: db_url.to_string(),
                params: params.clone(),
            },
            table: table.to_string(),
        };
        let mut generated = self.generated.lock();
        if !generated.contains(&entry) {
            generated.push(entry);
        }
    }

    /// Tables recorded as pipeline-generated, as `(db_url, table)` pairs.
    pub fn generated_tables(&self) -> Vec<(String, String)> {
        self.generated
            .lock()
            .iter()
            .map(|g| (g.key.url.clone(), g.table.clone()))
            .collect()
    }

    /// Drop every pipeline-generated table that still exists.
    ///
    /// Returns the number of tables dropped. A table that cannot be dropped
    /// stays recorded so a later call can retry it; the remaining tables are
    /// still processed and the first failure is returned at the end.
    pub fn drop_generated_tables(&self) -> Result<usize> {
        let generated = std::mem::take(&mut *self.generated.lock());
        let mut dropped = 0;
        let mut failed = Vec::new();
        let mut first_error = None;
        for entry in generated {
            match self.drop_one(&entry) {
                Ok(true) => dropped += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to drop generated table {}: {}", entry.table, e);
                    failed.push(entry);
                    first_error.get_or_insert(e);
                }
            }
        }
        debug!("Dropped {} generated tables", dropped);

        if !failed.is_empty() {
            let mut generated = self.generated.lock();
            for entry in failed {
                if !generated.contains(&entry) {
                    generated.push(entry);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(dropped),
        }
    }

    fn drop_one(&self, entry: &GeneratedTable) -> Result<bool> {
        let conn = self.acquire(&entry.key.url, &entry.key.params)?;
        if !conn.has_table(&entry.table) {
            return Ok(false);
        }
        conn.drop_table(&entry.table)?;
        Ok(true)
    }

    /// Drop every cached connection. Returns how many were released.
    pub fn release(&self) -> usize {
        let mut connections = self.connections.lock();
        let released = connections.len();
        connections.clear();
        released
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(Arc::new(CatalogBackend))
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        let pending = self.generated.lock().len();
        if pending > 0 {
            debug!(
                "Releasing connection pool with {} generated tables left in place",
                pending
            );
        }
    }
}

/// Storage services shared by intermediate values during a run.
pub struct StorageContext {
    pool: ConnectionPool,
    ids: Arc<dyn IdGenerator>,
    table_prefix: String,
}

impl StorageContext {
    pub fn new(backend: Arc<dyn RelationalBackend>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            pool: ConnectionPool::new(backend),
            ids,
            table_prefix: "tmp".to_string(),
        }
    }

    /// Use `prefix` for generated table names (`{prefix}_{id}`).
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn ids(&self) -> &dyn IdGenerator {
        self.ids.as_ref()
    }

    /// A fresh table name that no other generated table shares.
    pub fn generated_table_name(&self) -> String {
        format!("{}_{}", self.table_prefix, self.ids.next_id())
    }

    /// Drop the tables the pipeline generated. See [`ConnectionPool::drop_generated_tables`].
    pub fn drop_generated_tables(&self) -> Result<usize> {
        self.pool.drop_generated_tables()
    }
}

impl Default for StorageContext {
    fn default() -> Self {
        Self::new(Arc::new(CatalogBackend), Arc::new(UuidIdGenerator))
    }
}
