//! Payload capture: raw bytes plus a metadata record per inbound chunk
//!
//! Each capture writes `{ip}_{YYYYMMDD_HHMMSS}_{sha256}.bin` into the payload
//! directory and a JSON record with the same stem into the session directory,
//! then scans the bytes for known signatures. Capture is best-effort: write
//! failures are logged and never reach the connection.

pub mod signatures;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::CaptureConfig;
use crate::telemetry::SECURITY;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("cannot create capture directory {path}: {source}")]
    Directory { path: PathBuf, source: io::Error },
    #[error("cannot write payload {path}: {source}")]
    Payload { path: PathBuf, source: io::Error },
    #[error("cannot write metadata {path}: {source}")]
    Metadata { path: PathBuf, source: io::Error },
    #[error("cannot encode metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One stored capture event
#[derive(Debug, Clone)]
pub struct CapturedPayload {
    pub source: SocketAddr,
    pub timestamp: DateTime<Utc>,
    pub content_hash: String,
    pub len: usize,
    pub path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Companion record written next to every payload file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub source_ip: String,
    pub source_port: u16,
    pub timestamp: String,
    pub payload_filename: String,
}

pub struct PayloadCapture {
    payload_dir: PathBuf,
    session_dir: PathBuf,
}

impl PayloadCapture {
    /// Creates both directories if they are missing
    pub fn new(payload_dir: impl Into<PathBuf>, session_dir: impl Into<PathBuf>) -> Result<Self, CaptureError> {
        let payload_dir = payload_dir.into();
        let session_dir = session_dir.into();
        for dir in [&payload_dir, &session_dir] {
            std::fs::create_dir_all(dir).map_err(|source| CaptureError::Directory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self {
            payload_dir,
            session_dir,
        })
    }

    pub fn from_config(config: &CaptureConfig) -> Result<Self, CaptureError> {
        Self::new(&config.payload_dir, &config.session_dir)
    }

    /// Store `data`, write its metadata, run signature analysis.
    /// Returns `None` (after logging) if either write failed.
    pub fn record(&self, source: SocketAddr, data: &[u8]) -> Option<CapturedPayload> {
        match self.try_record(source, data) {
            Ok(captured) => {
                info!(
                    "Captured {} bytes from {} stored in {}",
                    captured.len,
                    captured.source,
                    captured.path.display()
                );
                debug!(
                    "Metadata for capture at {} stored in {}",
                    captured.timestamp.to_rfc3339(),
                    captured.metadata_path.display()
                );
                self.analyze(source, data);
                Some(captured)
            }
            Err(e) => {
                error!("Payload capture from {} failed: {}", source, e);
                None
            }
        }
    }

    fn try_record(&self, source: SocketAddr, data: &[u8]) -> Result<CapturedPayload, CaptureError> {
        let timestamp = Utc::now();
        let content_hash = hex::encode(Sha256::digest(data));
        let stem = format!(
            "{}_{}_{}",
            filename_ip(&source),
            timestamp.format("%Y%m%d_%H%M%S"),
            content_hash
        );

        let (path, stem) = write_new(&self.payload_dir, &stem, "bin", data)
            .map_err(|(path, source)| CaptureError::Payload { path, source })?;

        let metadata = SessionMetadata {
            source_ip: source.ip().to_string(),
            source_port: source.port(),
            timestamp: timestamp.to_rfc3339(),
            payload_filename: path.display().to_string(),
        };
        // A payload without its metadata record is removed again
        let written = serde_json::to_vec(&metadata)
            .map_err(CaptureError::from)
            .and_then(|encoded| {
                write_new(&self.session_dir, &stem, "json", &encoded)
                    .map_err(|(path, source)| CaptureError::Metadata { path, source })
            });
        let metadata_path = match written {
            Ok((metadata_path, _)) => metadata_path,
            Err(e) => {
                discard_orphan(&path);
                return Err(e);
            }
        };
        Ok(CapturedPayload {
            source,
            timestamp,
            content_hash,
            len: data.len(),
            path,
            metadata_path,
        })
    }

    /// Scan `data` against the fixed signature set. Every hit is a security
    /// warning; the session itself is not affected.
    pub fn analyze(&self, source: SocketAddr, data: &[u8]) -> Vec<&'static str> {
        let hits = signatures::scan(data);
        for name in &hits {
            warn!(
                target: SECURITY,
                signature = *name,
                peer = %source,
                "Suspicious pattern detected in payload from {}",
                source
            );
        }
        hits
    }

    pub fn payload_dir(&self) -> &Path {
        &self.payload_dir
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }
}

/// IPv6 colons are not portable in file names
fn filename_ip(addr: &SocketAddr) -> String {
    addr.ip().to_string().replace(':', "-")
}

/// Create `{stem}.{ext}` without overwriting; on a clash within the same
/// second, fall back to `{stem}-1.{ext}`, `{stem}-2.{ext}`, ...
fn write_new(dir: &Path, stem: &str, ext: &str, data: &[u8]) -> Result<(PathBuf, String), (PathBuf, io::Error)> {
    let mut candidate = stem.to_string();
    let mut attempt = 0u32;
    loop {
        let path = dir.join(format!("{}.{}", candidate, ext));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                return match file.write_all(data) {
                    Ok(()) => Ok((path, candidate)),
                    Err(e) => Err((path, e)),
                };
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 1000 => {
                attempt += 1;
                candidate = format!("{}-{}", stem, attempt);
            }
            Err(e) => return Err((path, e)),
        }
    }
}

/// Remove a payload whose metadata could not be written
fn discard_orphan(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            error!("Cannot remove orphaned payload {}: {}", path.display(), e);
            false
        }
    }
}
