//! The write-once, read-once intermediate value passed along pipeline edges.
//!
//! A [`UObject`] starts in [`Phase::Write`]. Exactly one `from_*` call stores
//! a payload and finalizes it. The producer then hands it on, either in
//! process ([`UObject::promote_to_read`], [`UObject::share`]) or through a
//! container file ([`UObject::persist`], [`UObject::open`]). A Read-phase
//! instance answers exactly one `to_*` call, converting the stored payload to
//! the requested format through the table in [`convert`].
//!
//! ```text
//!   writer() ── from_* ──▶ Write, finalized ── promote_to_read / share / open ──▶ Read
//!                                                                                  │
//!                                                               to_* (once) ◀──────┘
//! ```

mod convert;
pub mod image;
pub mod mapping;
pub mod temporal;

pub use mapping::Mapping;

use crate::error::{FlowError, Result, ResultExt};
use crate::ids::IdGenerator;
use crate::storage::{ConnParams, SqlTableInfo, StorageContext};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File extension of persisted container images.
pub const CONTAINER_EXTENSION: &str = "lfo";

/// Lifecycle phase of a [`UObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Write,
    Read,
}

/// Physical representation held by a finalized [`UObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMethod {
    Columnar,
    Relational,
    External,
}

impl fmt::Display for StorageMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Columnar => "columnar",
            Self::Relational => "relational",
            Self::External => "external",
        };
        f.write_str(name)
    }
}

/// Format requested from a Read-phase [`UObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetFormat {
    Table,
    Relational,
    External,
    Mapping,
    Csv,
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Table => "table",
            Self::Relational => "relational",
            Self::External => "external",
            Self::Mapping => "mapping",
            Self::Csv => "csv",
        };
        f.write_str(name)
    }
}

/// Reference to a table living in a relational database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationalRef {
    pub db_url: String,
    pub conn_params: ConnParams,
    #[serde(rename = "tbl_name")]
    pub table_name: String,
    /// The table was created by the pipeline and may be dropped on cleanup.
    pub pipeline_generated: bool,
}

/// Where [`UObject::to_relational`] should make the table available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationalRequest {
    pub db_url: String,
    pub conn_params: ConnParams,
    /// Materialize under this name. `None` reuses an existing reference in
    /// the same database, or picks a generated name.
    pub table_name: Option<String>,
}

impl RelationalRequest {
    pub fn new(db_url: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
            conn_params: ConnParams::new(),
            table_name: None,
        }
    }

    pub fn with_params(mut self, conn_params: ConnParams) -> Self {
        self.conn_params = conn_params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conn_params.insert(key.into(), value.into());
        self
    }

    pub fn named(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Columnar(DataFrame),
    Relational(RelationalRef),
    External(PathBuf),
}

impl Payload {
    pub(crate) fn method(&self) -> StorageMethod {
        match self {
            Self::Columnar(_) => StorageMethod::Columnar,
            Self::Relational(_) => StorageMethod::Relational,
            Self::External(_) => StorageMethod::External,
        }
    }
}

/// Universal intermediate value.
///
/// In Write phase, `finalized` means a payload has been stored. In Read
/// phase, it means the single read has happened and the payload is gone.
pub struct UObject {
    phase: Phase,
    finalized: bool,
    payload: Option<Payload>,
}

static_assertions::assert_impl_all!(UObject: Send);

impl UObject {
    /// A fresh, empty Write-phase instance.
    pub fn writer() -> Self {
        Self {
            phase: Phase::Write,
            finalized: false,
            payload: None,
        }
    }

    /// A finalized Write-phase instance holding `df`.
    pub fn table(df: DataFrame) -> Self {
        Self {
            phase: Phase::Write,
            finalized: true,
            payload: Some(Payload::Columnar(df)),
        }
    }

    fn reader(payload: Payload) -> Self {
        Self {
            phase: Phase::Read,
            finalized: false,
            payload: Some(payload),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Stored representation, or `None` before the first `from_*` and after
    /// the single read.
    pub fn storage_method(&self) -> Option<StorageMethod> {
        self.payload.as_ref().map(Payload::method)
    }

    // ---- import (Write phase) ----

    fn store(&mut self, operation: &str, payload: Payload) -> Result<()> {
        if self.phase != Phase::Write {
            return Err(FlowError::state(format!(
                "{operation} called on a read-phase value"
            )));
        }
        if self.finalized {
            return Err(FlowError::state(format!(
                "{operation} called on a value that is already finalized"
            )));
        }
        debug!("{} stored {} payload", operation, payload.method());
        self.payload = Some(payload);
        self.finalized = true;
        Ok(())
    }

    pub fn from_table(&mut self, df: DataFrame) -> Result<()> {
        self.store("from_table", Payload::Columnar(df))
    }

    /// Store a reference to `table_name` in the database at `db_url`.
    ///
    /// No rows move. `pipeline_generated` marks tables the pipeline created
    /// and may drop during cleanup.
    pub fn from_relational(
        &mut self,
        db_url: impl Into<String>,
        conn_params: ConnParams,
        table_name: impl Into<String>,
        pipeline_generated: bool,
    ) -> Result<()> {
        let reference = RelationalRef {
            db_url: db_url.into(),
            conn_params,
            table_name: table_name.into(),
            pipeline_generated,
        };
        self.store("from_relational", Payload::Relational(reference))
    }

    pub fn from_external(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.store("from_external", Payload::External(path.into()))
    }

    /// Store `mapping` as a one-row table.
    pub fn from_mapping(&mut self, mapping: &Mapping) -> Result<()> {
        // Check the phase before building the table so misuse reports a state error.
        self.check_writable("from_mapping")?;
        let df = mapping::mapping_to_table(mapping)?;
        self.store("from_mapping", Payload::Columnar(df))
    }

    /// Read a CSV file (with header) into a columnar payload.
    pub fn from_csv(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.check_writable("from_csv")?;
        let path = path.as_ref();
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.to_path_buf()))?
            .finish()
            .context(format!("Failed to read CSV '{}'", path.display()))?;
        self.store("from_csv", Payload::Columnar(df))
    }

    fn check_writable(&self, operation: &str) -> Result<()> {
        if self.phase != Phase::Write || self.finalized {
            let reason = if self.phase != Phase::Write {
                "a read-phase value"
            } else {
                "a value that is already finalized"
            };
            return Err(FlowError::state(format!("{operation} called on {reason}")));
        }
        Ok(())
    }

    // ---- export (Read phase) ----

    /// Run one export. The instance is consumed only when the export succeeds.
    fn consume<T>(&mut self, operation: &str, export: impl FnOnce(&Payload) -> Result<T>) -> Result<T> {
        if self.phase != Phase::Read {
            return Err(FlowError::state(format!(
                "{operation} called on a write-phase value"
            )));
        }
        let payload = match (&self.payload, self.finalized) {
            (Some(payload), false) => payload,
            _ => {
                return Err(FlowError::state(format!(
                    "{operation} called on a value that was already read"
                )));
            }
        };
        let value = export(payload)?;
        self.finalized = true;
        self.payload = None;
        Ok(value)
    }

    pub fn to_table(&mut self, storage: &StorageContext) -> Result<DataFrame> {
        self.consume("to_table", |payload| {
            convert::to_table(payload, TargetFormat::Table, storage)
        })
    }

    /// Make the payload available as a relational table.
    ///
    /// Returns the existing reference when it already lives in the requested
    /// database and no other name was asked for; otherwise the rows are
    /// written to a new table.
    pub fn to_relational(
        &mut self,
        storage: &StorageContext,
        request: &RelationalRequest,
    ) -> Result<SqlTableInfo> {
        self.consume("to_relational", |payload| {
            convert::to_relational(payload, request, storage)
        })
    }

    pub fn to_external(&mut self) -> Result<PathBuf> {
        self.consume("to_external", convert::to_external)
    }

    pub fn to_mapping(&mut self, storage: &StorageContext) -> Result<Mapping> {
        self.consume("to_mapping", |payload| {
            let df = convert::to_table(payload, TargetFormat::Mapping, storage)?;
            mapping::table_to_mapping(&df)
        })
    }

    /// Write the payload to `path` as CSV with a header row.
    pub fn to_csv(&mut self, storage: &StorageContext, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.consume("to_csv", |payload| {
            let mut df = convert::to_table(payload, TargetFormat::Csv, storage)?;
            let file = File::create(path)
                .context(format!("Failed to create CSV '{}'", path.display()))?;
            CsvWriter::new(file)
                .include_header(true)
                .finish(&mut df)
                .context(format!("Failed to write CSV '{}'", path.display()))
        })
    }

    // ---- hand-off ----

    /// Turn a finalized Write-phase instance into a Read-phase instance
    /// carrying the same payload. An unread Read-phase instance is returned
    /// unchanged.
    pub fn promote_to_read(mut self) -> Result<UObject> {
        match (self.phase, self.finalized) {
            (Phase::Write, true) | (Phase::Read, false) => {
                let payload = self.payload.take().ok_or_else(|| {
                    FlowError::state("promote_to_read called on a value without payload")
                })?;
                Ok(Self::reader(payload))
            }
            (Phase::Write, false) => Err(FlowError::state(
                "promote_to_read called on a value that is not finalized",
            )),
            (Phase::Read, true) => Err(FlowError::state(
                "promote_to_read called on a value that was already read",
            )),
        }
    }

    /// An independent Read-phase sibling carrying a copy of the payload.
    ///
    /// Legal on a finalized Write-phase instance or an unread Read-phase one.
    /// Reading the sibling does not affect `self`.
    pub fn share(&self) -> Result<UObject> {
        match (self.phase, self.finalized, &self.payload) {
            (Phase::Write, true, Some(payload)) | (Phase::Read, false, Some(payload)) => {
                Ok(Self::reader(payload.clone()))
            }
            (Phase::Write, _, _) => Err(FlowError::state(
                "share called on a value that is not finalized",
            )),
            (Phase::Read, _, _) => Err(FlowError::state(
                "share called on a value that was already read",
            )),
        }
    }

    /// Hand an unread input on as an output without converting it.
    ///
    /// Consumes the Read-phase instance and returns a finalized Write-phase
    /// instance with the same payload, so pass-through stages move no data.
    pub fn into_output(mut self) -> Result<UObject> {
        match (self.phase, self.finalized, self.payload.take()) {
            (Phase::Read, false, Some(payload)) => Ok(Self {
                phase: Phase::Write,
                finalized: true,
                payload: Some(payload),
            }),
            (Phase::Read, _, _) => Err(FlowError::state(
                "into_output called on a value that was already read",
            )),
            (Phase::Write, _, _) => Err(FlowError::state(
                "into_output called on a write-phase value",
            )),
        }
    }

    // ---- container images ----

    /// Encode a finalized Write-phase instance as a self-contained container.
    pub fn image(&self) -> Result<Vec<u8>> {
        match (self.phase, self.finalized, &self.payload) {
            (Phase::Write, true, Some(payload)) => image::encode(payload),
            (Phase::Write, _, _) => Err(FlowError::state(
                "image called on a value that is not finalized",
            )),
            (Phase::Read, _, _) => Err(FlowError::state("image called on a read-phase value")),
        }
    }

    /// Decode a container produced by [`UObject::image`] into a Read-phase instance.
    pub fn from_image(bytes: &[u8]) -> Result<UObject> {
        Ok(Self::reader(image::decode(bytes)?))
    }

    /// Write the container image to a uniquely named file in `dir`.
    pub fn persist(&self, dir: &Path, ids: &dyn IdGenerator) -> Result<PathBuf> {
        let bytes = self.image()?;
        std::fs::create_dir_all(dir)
            .context(format!("Failed to create directory '{}'", dir.display()))?;
        let path = dir.join(format!("{}.{}", ids.next_id(), CONTAINER_EXTENSION));
        std::fs::write(&path, bytes)
            .context(format!("Failed to write container '{}'", path.display()))?;
        debug!("Persisted value to {}", path.display());
        Ok(path)
    }

    /// Open a container file written by [`UObject::persist`].
    pub fn open(path: &Path) -> Result<UObject> {
        let bytes = std::fs::read(path)
            .context(format!("Failed to read container '{}'", path.display()))?;
        Self::from_image(&bytes).context(format!("Malformed container '{}'", path.display()))
    }
}

impl Default for UObject {
    fn default() -> Self {
        Self::writer()
    }
}

impl fmt::Debug for UObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UObject")
            .field("phase", &self.phase)
            .field("finalized", &self.finalized)
            .field("storage_method", &self.storage_method())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIdGenerator;
    use crate::storage::CatalogBackend;
    use std::sync::Arc;

    fn employees() -> DataFrame {
        df!(
            "id" => &[1i64, 2, 3],
            "last_name" => &["Alvarez", "Baker", "Chen"],
            "salary" => &[52_000.0f64, 61_500.0, 48_250.0],
        )
        .unwrap()
    }

    fn read(uo: UObject) -> UObject {
        uo.promote_to_read().unwrap()
    }

    #[test]
    fn test_write_promote_read_returns_same_table() {
        let storage = StorageContext::default();
        let mut uo = UObject::writer();
        uo.from_table(employees()).unwrap();
        assert!(uo.is_finalized());
        let mut reader = read(uo);
        assert_eq!(reader.phase(), Phase::Read);
        assert!(reader.to_table(&storage).unwrap().equals(&employees()));
    }

    #[test]
    fn test_second_from_is_state_error() {
        let mut uo = UObject::writer();
        uo.from_table(employees()).unwrap();
        assert!(uo.from_external("/tmp/x.csv").unwrap_err().is_state_error());
        assert!(
            uo.from_mapping(&Mapping::new())
                .unwrap_err()
                .is_state_error()
        );
    }

    #[test]
    fn test_export_in_write_phase_is_state_error() {
        let storage = StorageContext::default();
        let mut uo = UObject::table(employees());
        assert!(uo.to_table(&storage).unwrap_err().is_state_error());
        assert!(uo.to_external().unwrap_err().is_state_error());
    }

    #[test]
    fn test_import_in_read_phase_is_state_error() {
        let mut reader = read(UObject::table(employees()));
        assert!(reader.from_table(employees()).unwrap_err().is_state_error());
    }

    #[test]
    fn test_second_read_is_state_error() {
        let storage = StorageContext::default();
        let mut reader = read(UObject::table(employees()));
        reader.to_table(&storage).unwrap();
        assert!(reader.is_finalized());
        assert_eq!(reader.storage_method(), None);
        assert!(reader.to_table(&storage).unwrap_err().is_state_error());
    }

    #[test]
    fn test_promote_requires_finalized() {
        let err = UObject::writer().promote_to_read().unwrap_err();
        assert!(err.is_state_error());
    }

    #[test]
    fn test_unsupported_conversion_keeps_value_readable() {
        let storage = StorageContext::default();
        let mut reader = read(UObject::table(employees()));
        let err = reader.to_external().unwrap_err();
        assert!(err.is_conversion_error());
        assert!(reader.to_table(&storage).is_ok());
    }

    #[test]
    fn test_external_only_exports_as_path() {
        let storage = StorageContext::default();
        let mut uo = UObject::writer();
        uo.from_external("/data/model.bin").unwrap();
        let mut a = uo.share().unwrap();
        let mut b = uo.share().unwrap();
        assert_eq!(a.to_external().unwrap(), PathBuf::from("/data/model.bin"));
        let err = b.to_table(&storage).unwrap_err();
        assert!(matches!(
            err,
            FlowError::Conversion {
                from: StorageMethod::External,
                to: TargetFormat::Table
            }
        ));
    }

    #[test]
    fn test_shared_siblings_are_independent() {
        let storage = StorageContext::default();
        let uo = UObject::table(employees());
        let mut first = uo.share().unwrap();
        let mut second = uo.share().unwrap();
        let a = first.to_table(&storage).unwrap();
        assert!(first.to_table(&storage).is_err());
        let b = second.to_table(&storage).unwrap();
        assert!(a.equals(&b));
    }

    #[test]
    fn test_into_output_forwards_unread_input() {
        let storage = StorageContext::default();
        let forwarded = read(UObject::table(employees())).into_output().unwrap();
        assert_eq!(forwarded.phase(), Phase::Write);
        assert!(forwarded.is_finalized());
        assert!(read(forwarded).to_table(&storage).unwrap().equals(&employees()));

        assert!(UObject::table(employees()).into_output().is_err());
    }

    #[test]
    fn test_mapping_round_trip() {
        let storage = StorageContext::default();
        let mapping = serde_json::json!({"C": 1.0, "kernel": "linear"})
            .as_object()
            .cloned()
            .unwrap();
        let mut uo = UObject::writer();
        uo.from_mapping(&mapping).unwrap();
        assert_eq!(uo.storage_method(), Some(StorageMethod::Columnar));
        assert_eq!(read(uo).to_mapping(&storage).unwrap(), mapping);
    }

    #[test]
    fn test_columnar_to_relational_uses_generated_name() {
        let storage = StorageContext::new(
            Arc::new(CatalogBackend),
            Arc::new(SequentialIdGenerator::default()),
        );
        let request = RelationalRequest::new("memory://uobject_unit_generated");
        let info = read(UObject::table(employees()))
            .to_relational(&storage, &request)
            .unwrap();
        assert_eq!(info.table, "tmp_000000");
        assert!(info.conn.read_table("tmp_000000").unwrap().equals(&employees()));
        assert_eq!(storage.pool().generated_tables().len(), 1);
        assert_eq!(storage.drop_generated_tables().unwrap(), 1);
    }

    #[test]
    fn test_relational_to_relational_reuses_reference() {
        let storage = StorageContext::default();
        let url = "memory://uobject_unit_reuse";
        let conn = storage.pool().acquire(url, &ConnParams::new()).unwrap();
        conn.write_table("employees", &employees()).unwrap();

        let mut uo = UObject::writer();
        uo.from_relational(url, ConnParams::new(), "employees", false)
            .unwrap();
        let info = read(uo)
            .to_relational(&storage, &RelationalRequest::new(url))
            .unwrap();
        assert_eq!(info.table, "employees");
        assert_eq!(conn.table_names(), vec!["employees".to_string()]);
    }

    #[test]
    fn test_relational_copy_under_requested_name() {
        let storage = StorageContext::default();
        let url = "memory://uobject_unit_copy";
        let conn = storage.pool().acquire(url, &ConnParams::new()).unwrap();
        conn.write_table("employees", &employees()).unwrap();

        let mut uo = UObject::writer();
        uo.from_relational(url, ConnParams::new(), "employees", false)
            .unwrap();
        let request = RelationalRequest::new(url).named("staff");
        let info = read(uo).to_relational(&storage, &request).unwrap();
        assert_eq!(info.table, "staff");
        assert!(conn.read_table("staff").unwrap().equals(&employees()));
    }

    #[test]
    fn test_image_round_trip_preserves_dates() {
        let storage = StorageContext::default();
        let hired = Series::new("hired".into(), &[19_000i32, 19_365])
            .cast(&DataType::Date)
            .unwrap();
        let df = DataFrame::new(vec![
            hired.into_column(),
            Column::new("name".into(), &["a", "b"]),
        ])
        .unwrap();

        let bytes = UObject::table(df.clone()).image().unwrap();
        let restored = UObject::from_image(&bytes)
            .unwrap()
            .to_table(&storage)
            .unwrap();
        assert_eq!(restored.column("hired").unwrap().dtype(), &DataType::Date);
        assert!(restored.equals(&df));
    }

    #[test]
    fn test_image_requires_finalized_write() {
        assert!(UObject::writer().image().unwrap_err().is_state_error());
        let reader = read(UObject::table(employees()));
        assert!(reader.image().unwrap_err().is_state_error());
    }

    #[test]
    fn test_persist_and_open() {
        let storage = StorageContext::default();
        let dir = tempfile::tempdir().unwrap();
        let ids = SequentialIdGenerator::new("edge_");
        let path = UObject::table(employees()).persist(dir.path(), &ids).unwrap();
        assert_eq!(path.file_name().unwrap(), "edge_000000.lfo");

        let mut opened = UObject::open(&path).unwrap();
        assert_eq!(opened.phase(), Phase::Read);
        assert!(opened.to_table(&storage).unwrap().equals(&employees()));
    }

    #[test]
    fn test_open_malformed_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.lfo");
        std::fs::write(&path, b"not a container").unwrap();
        assert!(UObject::open(&path).unwrap_err().is_backing_store_error());
    }

    #[test]
    fn test_csv_round_trip() {
        let storage = StorageContext::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("employees.csv");
        read(UObject::table(employees()))
            .to_csv(&storage, &path)
            .unwrap();

        let mut uo = UObject::writer();
        uo.from_csv(&path).unwrap();
        assert!(read(uo).to_table(&storage).unwrap().equals(&employees()));
    }
}
