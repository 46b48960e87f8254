//! C1 — Atomic File Store.
//!
//! `readJSON`/`writeJSON` over crash-safe write-then-rename. A missing file
//! reads back as an empty JSON object, never an error. Used by the port
//! registry (C2), the project registry (C4), and the metrics store (C8).

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read and deserialize `path`. A missing file decodes as `T::default()`'s
/// JSON shape by deserializing `{}`.
pub fn read_json<T>(path: &Path) -> StoreResult<T>
where
    T: DeserializeOwned,
{
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::from_value(
            serde_json::Value::Object(Default::default()),
        )?),
        Err(e) => Err(e.into()),
    }
}

/// Serialize `value` to a sibling temp file, then atomically rename it over
/// `path`. A reader racing this call either sees the whole previous file or
/// the whole new one.
pub fn write_json<T>(path: &Path, value: &T) -> StoreResult<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("store"),
        Uuid::new_v4().simple()
    );
    let tmp_path = path.with_file_name(tmp_name);
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp_path, &bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Default)]
    struct Sample {
        #[serde(default)]
        a: i32,
        #[serde(default)]
        b: String,
    }

    #[test]
    fn round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        let value = Sample {
            a: 7,
            b: "hi".into(),
        };
        write_json(&path, &value).unwrap();
        let loaded: Sample = read_json(&path).unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn missing_file_reads_as_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let loaded: Sample = read_json(&path).unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn overwrite_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        write_json(&path, &Sample { a: 1, b: "x".into() }).unwrap();
        write_json(&path, &Sample { a: 2, b: "y".into() }).unwrap();
        let loaded: Sample = read_json(&path).unwrap();
        assert_eq!(loaded, Sample { a: 2, b: "y".into() });
    }
}
