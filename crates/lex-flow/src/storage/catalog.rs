//! Built-in relational backend backed by the Polars SQL engine.
//!
//! A [`SqlCatalog`] is a set of named tables. In-memory catalogs are shared by
//! every connection to the same `memory://` URL for the life of the process;
//! directory catalogs additionally mirror each table to `<dir>/<table>.parquet`
//! so a later process can reopen them.

use crate::error::{FlowError, Result, ResultExt};
use crate::storage::relational::{ConnParams, Connection, DbUrl, RelationalBackend};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use polars::prelude::*;
use polars::sql::SQLContext;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex: identifier"));

/// Target of a `CREATE [OR REPLACE] TABLE [IF NOT EXISTS] <name>` statement.
static CREATE_TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bCREATE\s+(OR\s+REPLACE\s+)?TABLE\s+(IF\s+NOT\s+EXISTS\s+)?([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("Invalid regex: create target")
});

/// Catalogs opened so far, keyed by URL.
static CATALOGS: Lazy<Mutex<HashMap<String, Arc<SqlCatalog>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

const PARQUET_EXTENSION: &str = "parquet";

/// Check that `name` can be used unquoted as a SQL table name.
pub fn validate_table_name(name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(FlowError::backing_store(format!(
            "'{name}' is not a valid table name"
        )))
    }
}

/// The default [`RelationalBackend`]: `memory://` and `parquet://` catalogs.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatalogBackend;

impl CatalogBackend {
    /// Forget a catalog so the next connection starts from scratch (or from
    /// disk, for directory catalogs). Returns whether a catalog was open.
    pub fn forget(db_url: &str) -> bool {
        CATALOGS.lock().remove(db_url).is_some()
    }
}

impl RelationalBackend for CatalogBackend {
    fn connect(&self, db_url: &str, params: &ConnParams) -> Result<Arc<dyn Connection>> {
        let mut catalogs = CATALOGS.lock();
        if let Some(catalog) = catalogs.get(db_url) {
            return Ok(catalog.clone());
        }

        let catalog = match DbUrl::parse(db_url)? {
            DbUrl::Memory(_) => SqlCatalog::in_memory(db_url),
            DbUrl::Parquet(dir) => {
                let create = params.get("create").is_none_or(|v| v != "false");
                SqlCatalog::open_dir(db_url, &dir, create)?
            }
        };
        info!("Opened catalog {}", db_url);
        let catalog = Arc::new(catalog);
        catalogs.insert(db_url.to_string(), catalog.clone());
        Ok(catalog)
    }
}

/// A named set of tables queried through [`SQLContext`].
pub struct SqlCatalog {
    url: String,
    dir: Option<PathBuf>,
    tables: RwLock<BTreeMap<String, DataFrame>>,
}

impl SqlCatalog {
    pub fn in_memory(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            dir: None,
            tables: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open the catalog stored in `dir`, loading every `*.parquet` file in it.
    pub fn open_dir(url: impl Into<String>, dir: &Path, create: bool) -> Result<Self> {
        if !dir.exists() {
            if !create {
                return Err(FlowError::backing_store(format!(
                    "Catalog directory '{}' does not exist",
                    dir.display()
                )));
            }
            std::fs::create_dir_all(dir)
                .context(format!("Failed to create catalog directory '{}'", dir.display()))?;
        }

        let mut tables = BTreeMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PARQUET_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_table_name(name).is_err() {
                debug!("Ignoring non-table file {}", path.display());
                continue;
            }
            let df = ParquetReader::new(File::open(&path)?)
                .finish()
                .context(format!("Failed to read table file '{}'", path.display()))?;
            tables.insert(name.to_string(), df);
        }
        debug!("Loaded {} tables from {}", tables.len(), dir.display());

        Ok(Self {
            url: url.into(),
            dir: Some(dir.to_path_buf()),
            tables: RwLock::new(tables),
        })
    }

    fn table_path(&self, name: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{name}.{PARQUET_EXTENSION}")))
    }

    fn persist(&self, name: &str, df: &DataFrame) -> Result<()> {
        if let Some(path) = self.table_path(name) {
            let mut df = df.clone();
            ParquetWriter::new(File::create(&path)?)
                .finish(&mut df)
                .context(format!("Failed to write table file '{}'", path.display()))?;
        }
        Ok(())
    }

    fn unpersist(&self, name: &str) -> Result<()> {
        if let Some(path) = self.table_path(name)
            && path.exists()
        {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

impl Connection for SqlCatalog {
    fn url(&self) -> &str {
        &self.url
    }

    fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    fn has_table(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    fn read_table(&self, name: &str) -> Result<DataFrame> {
        self.tables.read().get(name).cloned().ok_or_else(|| {
            FlowError::backing_store(format!("Table '{}' not found in {}", name, self.url))
        })
    }

    fn write_table(&self, name: &str, df: &DataFrame) -> Result<()> {
        validate_table_name(name)?;
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(FlowError::backing_store(format!(
                "Table '{}' already exists in {}",
                name, self.url
            )));
        }
        self.persist(name, df)?;
        tables.insert(name.to_string(), df.clone());
        debug!("Wrote table {} ({} rows) to {}", name, df.height(), self.url);
        Ok(())
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.remove(name).is_none() {
            return Err(FlowError::backing_store(format!(
                "Table '{}' not found in {}",
                name, self.url
            )));
        }
        self.unpersist(name)?;
        debug!("Dropped table {} from {}", name, self.url);
        Ok(())
    }

    fn execute(&self, sql: &str) -> Result<Option<DataFrame>> {
        let mut tables = self.tables.write();

        let mut ctx = SQLContext::new();
        for (name, df) in tables.iter() {
            ctx.register(name, df.clone().lazy());
        }
        let before: BTreeSet<String> = tables.keys().cloned().collect();

        // The SQL context overwrites an existing table in place, so its name
        // shows up in neither `created` nor `dropped` below.
        let mut replaced = Vec::new();
        for caps in CREATE_TARGET.captures_iter(sql) {
            let name = &caps[3];
            if !tables.contains_key(name) || caps.get(2).is_some() {
                continue;
            }
            if caps.get(1).is_none() {
                return Err(FlowError::backing_store(format!(
                    "Table '{}' already exists in {}",
                    name, self.url
                )));
            }
            replaced.push(name.to_string());
        }

        let result = ctx
            .execute(sql)
            .and_then(|lf| lf.collect())
            .context(format!("Failed to execute SQL against {}", self.url))?;

        let after: BTreeSet<String> = ctx.get_tables().into_iter().collect();
        let created: Vec<&String> = after.difference(&before).collect();
        let dropped: Vec<&String> = before.difference(&after).collect();

        for name in created.iter().copied().chain(&replaced) {
            validate_table_name(name)?;
            let df = ctx
                .execute(&format!("SELECT * FROM {name}"))
                .and_then(|lf| lf.collect())
                .context(format!("Failed to materialize table '{name}'"))?;
            self.persist(name, &df)?;
            debug!("Created table {} ({} rows) in {}", name, df.height(), self.url);
            tables.insert(name.clone(), df);
        }
        for name in &dropped {
            self.unpersist(name)?;
            tables.remove(*name);
            debug!("Dropped table {} from {}", name, self.url);
        }

        if created.is_empty() && dropped.is_empty() && replaced.is_empty() {
            Ok(Some(result))
        } else {
            Ok(None)
        }
    }
}
