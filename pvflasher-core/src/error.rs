//! The crate-wide error type.
//!
//! Every fallible operation in `pvflasher-core` returns [`Result`]. The
//! variants are deliberately fine-grained so that front-ends can react to the
//! category (retry a transport failure, refuse to retry a checksum mismatch,
//! suggest `--force` for a busy device) without string-matching messages.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to parse bmap: {0}")]
    BmapParse(String),

    #[error("bmap integrity check failed: {0}")]
    BmapIntegrity(String),

    #[error("invalid block range '{text}': {reason}")]
    BmapRangeParse { text: String, reason: String },

    #[error("device {device} is mounted at {}; use force to override", .mounts.join(", "))]
    DeviceBusy {
        device: String,
        mounts: Vec<String>,
    },

    #[error("failed to open device {}: {source}", .path.display())]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to lock volume {volume}: {source}")]
    VolumeLock {
        volume: String,
        #[source]
        source: io::Error,
    },

    #[error("read error at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("write error at offset {offset}: {source}")]
    Write {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("seek error at offset {offset}: {source}")]
    Seek {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("device write returned zero bytes at offset {0}")]
    ShortWrite(u64),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("no suitable image found in archive")]
    ArchiveNotFound,

    #[error("download checksum mismatch: expected {expected}, got {actual}")]
    DownloadChecksum { expected: String, actual: String },

    #[error("download failed after {attempts} attempts: {reason}")]
    DownloadTransport { attempts: u32, reason: String },

    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedChecksum(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors that a download loop may retry.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::DownloadTransport { .. })
    }
}
