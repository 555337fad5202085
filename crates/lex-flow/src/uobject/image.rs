//! Self-contained container encoding of a stored payload.
//!
//! ```text
//! +----------------+---------------------+------------------+-------------------+
//! | magic (8 B)    | manifest length     | JSON manifest    | Arrow IPC body    |
//! | "LEXFLOW\x01"  | (u32, little endian)| storage_method.. | (columnar only)   |
//! +----------------+---------------------+------------------+-------------------+
//! ```
//!
//! The manifest is tagged with `storage_method` (`columnar`, `relational` or
//! `external`). Columnar bodies hold the table with temporal columns narrowed
//! to Int64; the manifest's `dt_cols` list says how to widen them back.

use super::temporal::{self, DtColumn};
use super::{Payload, RelationalRef};
use crate::error::{FlowError, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::PathBuf;

const MAGIC: &[u8; 8] = b"LEXFLOW\x01";
const HEADER_LEN: usize = MAGIC.len() + 4;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "storage_method", rename_all = "snake_case")]
enum Manifest {
    Columnar { dt_cols: Vec<DtColumn> },
    Relational(RelationalRef),
    External { filename: PathBuf },
}

pub(crate) fn encode(payload: &Payload) -> Result<Vec<u8>> {
    let (manifest, body) = match payload {
        Payload::Columnar(df) => {
            let (mut narrowed, dt_cols) = temporal::narrow(df)?;
            let mut cursor = Cursor::new(Vec::new());
            IpcWriter::new(&mut cursor).finish(&mut narrowed)?;
            (Manifest::Columnar { dt_cols }, cursor.into_inner())
        }
        Payload::Relational(reference) => (Manifest::Relational(reference.clone()), Vec::new()),
        Payload::External(path) => (
            Manifest::External {
                filename: path.clone(),
            },
            Vec::new(),
        ),
    };

    let manifest = serde_json::to_vec(&manifest)?;
    let manifest_len = u32::try_from(manifest.len())
        .map_err(|_| FlowError::backing_store("Container manifest is too large"))?;

    let mut image = Vec::with_capacity(HEADER_LEN + manifest.len() + body.len());
    image.extend_from_slice(MAGIC);
    image.extend_from_slice(&manifest_len.to_le_bytes());
    image.extend_from_slice(&manifest);
    image.extend_from_slice(&body);
    Ok(image)
}

pub(crate) fn decode(image: &[u8]) -> Result<Payload> {
    if image.len() < HEADER_LEN || &image[..MAGIC.len()] != MAGIC {
        return Err(FlowError::backing_store("Not a lex-flow container image"));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&image[MAGIC.len()..HEADER_LEN]);
    let manifest_len = u32::from_le_bytes(len_bytes) as usize;

    let manifest_end = HEADER_LEN
        .checked_add(manifest_len)
        .filter(|end| *end <= image.len())
        .ok_or_else(|| FlowError::backing_store("Container image is truncated"))?;
    let manifest: Manifest = serde_json::from_slice(&image[HEADER_LEN..manifest_end])?;
    let body = &image[manifest_end..];

    match manifest {
        Manifest::Columnar { dt_cols } => {
            let narrowed = IpcReader::new(Cursor::new(body.to_vec())).finish()?;
            Ok(Payload::Columnar(temporal::widen(narrowed, &dt_cols)?))
        }
        Manifest::Relational(reference) => Ok(Payload::Relational(reference)),
        Manifest::External { filename } => Ok(Payload::External(filename)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ConnParams;

    #[test]
    fn test_columnar_image_round_trip() {
        let df = df!("id" => &[1i64, 2], "name" => &["x", "y"]).unwrap();
        let image = encode(&Payload::Columnar(df.clone())).unwrap();
        assert_eq!(&image[..8], MAGIC);
        match decode(&image).unwrap() {
            Payload::Columnar(restored) => assert!(restored.equals(&df)),
            other => panic!("unexpected payload {:?}", other.method()),
        }
    }

    #[test]
    fn test_zone_aware_datetime_survives_image() {
        let tz = TimeZone::opt_try_new(Some("America/New_York")).unwrap();
        let seen = Int64Chunked::new("seen".into(), &[86_400_000i64, 0])
            .into_datetime(TimeUnit::Milliseconds, tz)
            .into_series();
        let df = DataFrame::new(vec![seen.into_column()]).unwrap();

        let image = encode(&Payload::Columnar(df.clone())).unwrap();
        let len = u32::from_le_bytes(image[MAGIC.len()..HEADER_LEN].try_into().unwrap()) as usize;
        let manifest = std::str::from_utf8(&image[HEADER_LEN..HEADER_LEN + len]).unwrap();
        assert!(manifest.contains(r#""tz":"America/New_York""#));
        match decode(&image).unwrap() {
            Payload::Columnar(restored) => {
                assert_eq!(restored.schema(), df.schema());
                assert!(restored.equals(&df));
            }
            other => panic!("unexpected payload {:?}", other.method()),
        }
    }

    #[test]
    fn test_relational_manifest_is_tagged() {
        let reference = RelationalRef {
            db_url: "memory://image_unit".to_string(),
            conn_params: ConnParams::from([("user".to_string(), "etl".to_string())]),
            table_name: "employees".to_string(),
            pipeline_generated: false,
        };
        let image = encode(&Payload::Relational(reference.clone())).unwrap();
        let manifest = std::str::from_utf8(&image[HEADER_LEN..]).unwrap();
        assert!(manifest.contains(r#""storage_method":"relational""#));
        assert!(manifest.contains(r#""tbl_name":"employees""#));
        match decode(&image).unwrap() {
            Payload::Relational(restored) => assert_eq!(restored, reference),
            other => panic!("unexpected payload {:?}", other.method()),
        }
    }

    #[test]
    fn test_malformed_images_are_backing_store_errors() {
        assert!(decode(b"LEX").unwrap_err().is_backing_store_error());
        assert!(decode(b"NOTLEXFLOW\x00\x00\x00\x00").unwrap_err().is_backing_store_error());

        let mut truncated = MAGIC.to_vec();
        truncated.extend_from_slice(&100u32.to_le_bytes());
        truncated.extend_from_slice(b"{}");
        assert!(decode(&truncated).unwrap_err().is_backing_store_error());

        let mut bad_json = MAGIC.to_vec();
        bad_json.extend_from_slice(&2u32.to_le_bytes());
        bad_json.extend_from_slice(b"{]");
        assert!(decode(&bad_json).unwrap_err().is_backing_store_error());
    }
}
