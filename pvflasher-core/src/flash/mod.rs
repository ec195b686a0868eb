//! Flashing an image onto a device: orchestration, options and progress
//! reporting, plus the post-write verifier in [`verify`].

pub mod flasher;
pub mod verify;

pub use flasher::run;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// Buffer size of the copy and verification loops.
pub(crate) const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Where the pipeline currently is; serialized lowercase on the JSON surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Extracting,
    Writing,
    Syncing,
    Verifying,
    Ejecting,
    Validating,
}

/// One progress tick. Callbacks run on the I/O thread and must not block.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    #[serde(rename = "processed")]
    pub bytes_processed: u64,
    #[serde(rename = "total")]
    pub bytes_total: u64,
    pub percentage: f64,
    /// Bytes per second since the phase started.
    pub speed: f64,
}

impl ProgressEvent {
    pub(crate) fn phase_only(phase: Phase) -> Self {
        Self {
            phase,
            bytes_processed: 0,
            bytes_total: 0,
            percentage: 0.0,
            speed: 0.0,
        }
    }
}

/// Input record of one flash job.
#[derive(Debug, Clone)]
pub struct FlashOptions {
    pub image_path: PathBuf,
    pub device_path: PathBuf,
    /// Explicit bmap; overrides one found inside an archive.
    pub bmap_path: Option<PathBuf>,
    /// Write even when the target has mounted volumes.
    pub force: bool,
    pub no_verify: bool,
    pub no_eject: bool,
}

/// Outcome record of one flash job.
#[derive(Debug, Clone, Serialize)]
pub struct FlashResult {
    pub bytes_written: u64,
    pub blocks_written: u64,
    #[serde(serialize_with = "duration_as_secs")]
    pub duration: Duration,
    pub average_speed: f64,
    pub used_bmap: bool,
    pub verification_done: bool,
    pub device_ejected: bool,
}

fn duration_as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}
