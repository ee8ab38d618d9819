//! Artifact I/O: atomic JSON writes, gz-aware record streams, digests.
//!
//! Artifacts double as checkpoints, so every write goes through a temporary
//! file and a rename; a partial file never masquerades as a complete one.

use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed record at {path}:{line}: {source}")]
    Record {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> ArtifactError {
    ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(path, e))?;
        }
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(bytes).map_err(|e| io_err(&tmp, e))?;
        file.sync_all().map_err(|e| io_err(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let bytes = serde_json::to_vec(value).map_err(|e| ArtifactError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    write_bytes_atomic(path, &bytes)
}

/// Writes records as JSON Lines, atomically.
pub fn write_jsonl_atomic<T: Serialize>(path: &Path, records: &[T]) -> Result<(), ArtifactError> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record).map_err(|e| ArtifactError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        buf.push(b'\n');
    }
    write_bytes_atomic(path, &buf)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| ArtifactError::Json {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Opens a record stream, transparently decompressing `.gz` files.
pub fn open_maybe_gz(path: &Path) -> Result<Box<dyn BufRead>, ArtifactError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let reader: Box<dyn Read> = if path.extension().and_then(|ext| ext.to_str()) == Some("gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

/// Reads a JSON Lines stream. Blank lines are skipped; a malformed record
/// fails fast with its line number.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, ArtifactError> {
    let reader = open_maybe_gz(path)?;
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| io_err(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| ArtifactError::Record {
            path: path.to_path_buf(),
            line: i + 1,
            source: e,
        })?;
        records.push(record);
    }
    Ok(records)
}

pub fn digest(bytes: &[u8]) -> [u8; 32] {
    *blake3::hash(bytes).as_bytes()
}

pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(digest(bytes))
}

/// Digest of a file's contents, for binding derived artifacts to their
/// input snapshot.
pub fn digest_file(path: &Path) -> Result<[u8; 32], ArtifactError> {
    let bytes = std::fs::read(path).map_err(|e| io_err(path, e))?;
    Ok(digest(&bytes))
}
