//! The conversion table between stored payloads and exported formats.
//!
//! | stored \ requested | table            | relational                    | external |
//! |--------------------|------------------|-------------------------------|----------|
//! | columnar           | identity         | write to a new table          | error    |
//! | relational         | read all rows    | same reference, or copy       | error    |
//! | external           | error            | error                         | path     |
//!
//! Mapping and CSV exports go through the table column.

use super::{Payload, RelationalRef, RelationalRequest, TargetFormat};
use crate::error::{FlowError, Result, ResultExt};
use crate::storage::{Connection, SqlTableInfo, StorageContext};
use polars::prelude::DataFrame;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Export as a columnar table. `target` names the format the caller asked
/// for, so errors mention mapping or CSV rather than the table hop.
pub(crate) fn to_table(
    payload: &Payload,
    target: TargetFormat,
    storage: &StorageContext,
) -> Result<DataFrame> {
    match payload {
        Payload::Columnar(df) => Ok(df.clone()),
        Payload::Relational(reference) => {
            let conn = storage
                .pool()
                .acquire(&reference.db_url, &reference.conn_params)?;
            note_generated(reference, storage);
            debug!(
                "Reading table {} from {}",
                reference.table_name, reference.db_url
            );
            conn.read_table(&reference.table_name)
                .context(format!("Failed to read table '{}'", reference.table_name))
        }
        Payload::External(_) => Err(unsupported(payload, target)),
    }
}

pub(crate) fn to_relational(
    payload: &Payload,
    request: &RelationalRequest,
    storage: &StorageContext,
) -> Result<SqlTableInfo> {
    match payload {
        Payload::Columnar(df) => write_new_table(df, request, storage),
        Payload::Relational(reference) => {
            note_generated(reference, storage);
            let same_database =
                reference.db_url == request.db_url && reference.conn_params == request.conn_params;
            let same_table = request
                .table_name
                .as_ref()
                .is_none_or(|name| *name == reference.table_name);
            if same_database && same_table {
                let conn = storage
                    .pool()
                    .acquire(&reference.db_url, &reference.conn_params)?;
                return Ok(table_info(reference.table_name.clone(), conn, request));
            }

            debug!(
                "Copying table {} from {} to {}",
                reference.table_name, reference.db_url, request.db_url
            );
            let source = storage
                .pool()
                .acquire(&reference.db_url, &reference.conn_params)?;
            let df = source.read_table(&reference.table_name)?;
            write_new_table(&df, request, storage)
        }
        Payload::External(_) => Err(unsupported(payload, TargetFormat::Relational)),
    }
}

pub(crate) fn to_external(payload: &Payload) -> Result<PathBuf> {
    match payload {
        Payload::External(path) => Ok(path.clone()),
        _ => Err(unsupported(payload, TargetFormat::External)),
    }
}

fn write_new_table(
    df: &DataFrame,
    request: &RelationalRequest,
    storage: &StorageContext,
) -> Result<SqlTableInfo> {
    let conn = storage
        .pool()
        .acquire(&request.db_url, &request.conn_params)?;
    let (name, generated) = match &request.table_name {
        Some(name) => (name.clone(), false),
        None => (storage.generated_table_name(), true),
    };
    conn.write_table(&name, df)
        .context(format!("Failed to materialize table '{name}'"))?;
    if generated {
        storage
            .pool()
            .record_generated(&request.db_url, &request.conn_params, &name);
    }
    Ok(table_info(name, conn, request))
}

fn table_info(
    table: String,
    conn: Arc<dyn Connection>,
    request: &RelationalRequest,
) -> SqlTableInfo {
    SqlTableInfo {
        table,
        conn,
        db_url: request.db_url.clone(),
        conn_params: request.conn_params.clone(),
    }
}

/// Tables flagged as pipeline-generated become droppable through the
/// reading context's pool.
fn note_generated(reference: &RelationalRef, storage: &StorageContext) {
    if reference.pipeline_generated {
        storage.pool().record_generated(
            &reference.db_url,
            &reference.conn_params,
            &reference.table_name,
        );
    }
}

fn unsupported(payload: &Payload, target: TargetFormat) -> FlowError {
    FlowError::Conversion {
        from: payload.method(),
        to: target,
    }
}
