//! Post-write verification.
//!
//! With a bmap, the device is re-read range by range into a streaming digest
//! and compared against the recorded checksums. Without one, the device is
//! compared byte-wise against the (decompressed) source image.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::archive;
use crate::bmap::Bmap;
use crate::error::{Error, Result};
use crate::flash::{Phase, ProgressEvent, COPY_BUFFER_SIZE};
use crate::image::compression;
use crate::image::reader::read_full;
use crate::platform::{self, DeviceIo};

/// What to check the device against.
pub enum VerifySource<'a> {
    /// Per-range digests from a parsed bmap.
    Bmap(&'a Bmap),
    /// Byte-wise comparison against the image. When the image sits inside an
    /// archive, `archive_entry` names it so no re-extraction is needed.
    RawImage {
        image_path: &'a Path,
        archive_entry: Option<&'a str>,
    },
}

/// Re-read the device and check it against the source.
///
/// The device is opened exclusively for the duration, so any handle held by
/// the writer must be dropped first.
pub fn run<F>(
    device_path: &Path,
    source: VerifySource<'_>,
    running: &Arc<AtomicBool>,
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(ProgressEvent),
{
    let mut dev = platform::open_device(device_path)?;
    match source {
        VerifySource::Bmap(bmap) => verify_with_bmap(&mut dev, bmap, running, &mut on_progress),
        VerifySource::RawImage {
            image_path,
            archive_entry,
        } => verify_raw(&mut dev, image_path, archive_entry, running, &mut on_progress),
    }
}

fn verify_with_bmap<F>(
    dev: &mut Box<dyn DeviceIo>,
    bmap: &Bmap,
    running: &Arc<AtomicBool>,
    on_progress: &mut F,
) -> Result<()>
where
    F: FnMut(ProgressEvent),
{
    let started = Instant::now();
    let total = bmap.mapped_byte_count();
    let mut verified: u64 = 0;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    for range in &bmap.ranges {
        check_cancelled(running)?;

        let range_start = range.start * bmap.block_size;
        dev.seek(SeekFrom::Start(range_start))
            .map_err(|source| Error::Seek {
                offset: range_start,
                source,
            })?;

        let mut hasher = bmap.checksum_type.hasher();
        let mut remaining = bmap.range_byte_count(range);
        while remaining > 0 {
            check_cancelled(running)?;

            let want = remaining.min(buf.len() as u64) as usize;
            dev.read_exact(&mut buf[..want]).map_err(|source| Error::Read {
                offset: range_start + (bmap.range_byte_count(range) - remaining),
                source,
            })?;
            hasher.update(&buf[..want]);
            remaining -= want as u64;
            verified += want as u64;
            on_progress(verify_progress(verified, total, started));
        }

        let actual = hasher.finish_hex();
        if actual != range.checksum {
            return Err(Error::Verification(format!(
                "checksum mismatch at range {}-{}: expected {}, got {}",
                range.start, range.end, range.checksum, actual
            )));
        }
    }

    Ok(())
}

fn verify_raw<F>(
    dev: &mut Box<dyn DeviceIo>,
    image_path: &Path,
    archive_entry: Option<&str>,
    running: &Arc<AtomicBool>,
    on_progress: &mut F,
) -> Result<()>
where
    F: FnMut(ProgressEvent),
{
    if archive::is_archive(image_path) {
        let entry = match archive_entry {
            Some(entry) => entry.to_string(),
            None => archive::scan_pair(image_path)?.image_entry,
        };
        // The uncompressed total is unknown for an archived image; progress
        // reports raw counts with no percentage denominator.
        archive::read_entry(image_path, &entry, |reader| {
            let mut image = compression::decompressor(Path::new(&entry), reader)?;
            compare_streams(dev, &mut image, 0, running, on_progress)
        })
    } else {
        let file = File::open(image_path)?;
        let total = file.metadata()?.len();
        let mut image = compression::decompressor(image_path, file)?;
        compare_streams(dev, &mut image, total, running, on_progress)
    }
}

/// Compare the image stream to the device in windows, reporting the first
/// mismatching byte offset.
fn compare_streams<F>(
    dev: &mut Box<dyn DeviceIo>,
    image: &mut dyn Read,
    total: u64,
    running: &Arc<AtomicBool>,
    on_progress: &mut F,
) -> Result<()>
where
    F: FnMut(ProgressEvent),
{
    let started = Instant::now();
    let mut verified: u64 = 0;
    let mut image_buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut device_buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        check_cancelled(running)?;

        let n = read_full(image, &mut image_buf).map_err(|source| Error::Read {
            offset: verified,
            source,
        })?;
        if n == 0 {
            break;
        }

        dev.read_exact(&mut device_buf[..n])
            .map_err(|source| Error::Read {
                offset: verified,
                source,
            })?;

        if image_buf[..n] != device_buf[..n] {
            let first_bad = image_buf[..n]
                .iter()
                .zip(&device_buf[..n])
                .position(|(a, b)| a != b)
                .unwrap_or(0) as u64;
            return Err(Error::Verification(format!(
                "mismatch at byte {}",
                verified + first_bad
            )));
        }

        verified += n as u64;
        on_progress(verify_progress(verified, total, started));
    }

    Ok(())
}

fn check_cancelled(running: &Arc<AtomicBool>) -> Result<()> {
    if !running.load(Ordering::SeqCst) {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn verify_progress(verified: u64, total: u64, started: Instant) -> ProgressEvent {
    let elapsed = started.elapsed().as_secs_f64();
    let speed = if elapsed > 0.0 {
        verified as f64 / elapsed
    } else {
        0.0
    };
    let percentage = if total > 0 {
        verified as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    ProgressEvent {
        phase: Phase::Verifying,
        bytes_processed: verified,
        bytes_total: total,
        percentage,
        speed,
    }
}
