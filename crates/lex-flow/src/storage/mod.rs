//! Storage backends consumed by intermediate values.
//!
//! - [`relational`]: backend/connection contracts and table references
//! - [`catalog`]: the built-in Polars SQL catalog (`memory://`, `parquet://`)
//! - [`pool`]: connection reuse keyed by URL and parameters

pub mod catalog;
pub mod pool;
pub mod relational;

pub use catalog::{CatalogBackend, SqlCatalog, validate_table_name};
pub use pool::{ConnectionPool, StorageContext};
pub use relational::{ConnParams, Connection, DbUrl, RelationalBackend, SqlTableInfo};
