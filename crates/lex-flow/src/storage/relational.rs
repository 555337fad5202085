//! Relational backend contracts.
//!
//! A backend resolves a database URL plus connection parameters into a
//! [`Connection`]. Connections move whole tables in and out of columnar form
//! and execute SQL text; they never see intermediate values.

use crate::error::{FlowError, Result};
use polars::prelude::DataFrame;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Connection parameters, passed through to the backend untouched.
pub type ConnParams = BTreeMap<String, String>;

/// Parsed form of the database URLs understood by the built-in catalog backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DbUrl {
    /// `memory://<name>`: a named catalog living for the rest of the process.
    Memory(String),
    /// `parquet://<dir>`: a durable catalog with one Parquet file per table.
    Parquet(PathBuf),
}

impl DbUrl {
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(name) = url.strip_prefix("memory://") {
            if name.is_empty() {
                return Err(FlowError::backing_store(format!(
                    "Database URL '{url}' does not name a catalog"
                )));
            }
            return Ok(Self::Memory(name.to_string()));
        }
        if let Some(dir) = url.strip_prefix("parquet://") {
            if dir.is_empty() {
                return Err(FlowError::backing_store(format!(
                    "Database URL '{url}' does not name a directory"
                )));
            }
            return Ok(Self::Parquet(PathBuf::from(dir)));
        }
        Err(FlowError::backing_store(format!(
            "Unsupported database URL '{url}' (expected memory:// or parquet://)"
        )))
    }
}

impl fmt::Display for DbUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(name) => write!(f, "memory://{name}"),
            Self::Parquet(dir) => write!(f, "parquet://{}", dir.display()),
        }
    }
}

/// A live handle onto one database.
pub trait Connection: Send + Sync {
    /// The URL this connection was opened with.
    fn url(&self) -> &str;

    /// Names of all tables, sorted.
    fn table_names(&self) -> Vec<String>;

    fn has_table(&self, name: &str) -> bool {
        self.table_names().iter().any(|t| t == name)
    }

    /// Pull every row of `name` into columnar form.
    fn read_table(&self, name: &str) -> Result<DataFrame>;

    /// Create `name` from `df`. Fails if the table already exists.
    fn write_table(&self, name: &str, df: &DataFrame) -> Result<()>;

    fn drop_table(&self, name: &str) -> Result<()>;

    /// Execute one SQL statement.
    ///
    /// Returns the result set for queries and `None` for statements that only
    /// create or drop tables.
    fn execute(&self, sql: &str) -> Result<Option<DataFrame>>;
}

/// Opens connections for database URLs.
pub trait RelationalBackend: Send + Sync {
    fn connect(&self, db_url: &str, params: &ConnParams) -> Result<Arc<dyn Connection>>;
}

/// Everything a stage needs to address a relational table.
#[derive(Clone)]
pub struct SqlTableInfo {
    /// Table name inside the database.
    pub table: String,
    /// Connection through which the table can be accessed.
    pub conn: Arc<dyn Connection>,
    pub db_url: String,
    pub conn_params: ConnParams,
}

impl fmt::Debug for SqlTableInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlTableInfo")
            .field("table", &self.table)
            .field("db_url", &self.db_url)
            .field("conn_params", &self.conn_params)
            .finish_non_exhaustive()
    }
}
