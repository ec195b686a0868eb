//! The copy pipeline: safety check, exclusive open, archive resolution,
//! bmap-driven or raw block copy, sync, verification and eject.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::archive;
use crate::bmap::Bmap;
use crate::device::{self, Device};
use crate::error::{Error, Result};
use crate::flash::verify::{self, VerifySource};
use crate::flash::{FlashOptions, FlashResult, Phase, ProgressEvent, COPY_BUFFER_SIZE};
use crate::image::{compression, reader::CountingReader, reader::ForwardSeeker};
use crate::platform;

/// Write an image to a device.
///
/// Fatal errors during copy, sync and verification abort the job; the
/// partially written device is not rolled back. Eject failures are logged
/// and reflected in the result only. Cancellation is observed between
/// buffers, ranges and phase transitions.
pub fn run<F>(
    opts: &FlashOptions,
    running: &Arc<AtomicBool>,
    mut on_progress: F,
) -> Result<FlashResult>
where
    F: FnMut(ProgressEvent),
{
    check_cancelled(running)?;

    // Safety check: refuse a mounted target unless forced. Enumeration
    // failure is not fatal here; the exclusive open is the backstop.
    if !opts.force {
        match device::list() {
            Ok(devices) => check_device_busy(&devices, &opts.device_path.to_string_lossy())?,
            Err(e) => log::warn!("device enumeration failed, skipping mount check: {}", e),
        }
    }

    platform::prepare_device(&opts.device_path)?;
    let mut dev = platform::open_device(&opts.device_path)?;

    // Resolve the image: archives are extracted to scratch space first, and
    // a bmap found inside is adopted unless the caller supplied one. The
    // scratch directory must outlive verification.
    let mut image_path = opts.image_path.clone();
    let mut bmap_path = opts.bmap_path.clone();
    let mut extracted = None;
    if archive::is_archive(&image_path) {
        check_cancelled(running)?;
        on_progress(ProgressEvent::phase_only(Phase::Extracting));
        let out = archive::extract(&image_path)?;
        image_path = out.image_path.clone();
        if bmap_path.is_none() {
            bmap_path = out.bmap_path.clone();
        }
        extracted = Some(out);
    }

    let image_file = File::open(&image_path)?;
    let source_size = image_file.metadata()?.len();
    let counting = CountingReader::new(image_file);
    let counter = counting.counter();
    let decompressed = compression::decompressor(&image_path, counting)?;
    let mut seeker = ForwardSeeker::new(decompressed);

    let bmap = match &bmap_path {
        Some(path) => Some(Bmap::parse(&std::fs::read(path)?)?),
        None => None,
    };

    // Copy.
    let started = Instant::now();
    let mut written: u64 = 0;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    if let Some(bmap) = &bmap {
        let total = bmap.mapped_byte_count();
        for range in &bmap.ranges {
            check_cancelled(running)?;

            let range_start = range.start * bmap.block_size;
            let count = bmap.range_byte_count(range);

            seeker
                .seek(SeekFrom::Start(range_start))
                .map_err(|source| Error::Seek {
                    offset: range_start,
                    source,
                })?;
            dev.seek(SeekFrom::Start(range_start))
                .map_err(|source| Error::Seek {
                    offset: range_start,
                    source,
                })?;

            let mut remaining = count;
            while remaining > 0 {
                check_cancelled(running)?;

                let want = remaining.min(buf.len() as u64) as usize;
                let offset = range_start + (count - remaining);
                seeker
                    .read_exact(&mut buf[..want])
                    .map_err(|source| Error::Read { offset, source })?;
                write_all_retry(&mut dev, &buf[..want], offset)?;

                remaining -= want as u64;
                written += want as u64;
                on_progress(copy_progress(
                    written,
                    total,
                    counter.load(Ordering::Relaxed),
                    source_size,
                    started,
                ));
            }
        }
    } else {
        // Raw copy of the whole stream. The denominator for progress is the
        // compressed source size, which the counter tracks exactly.
        loop {
            check_cancelled(running)?;

            let n = seeker.read(&mut buf).map_err(|source| Error::Read {
                offset: written,
                source,
            })?;
            if n == 0 {
                break;
            }
            write_all_retry(&mut dev, &buf[..n], written)?;
            written += n as u64;
            on_progress(copy_progress(
                written,
                source_size,
                counter.load(Ordering::Relaxed),
                source_size,
                started,
            ));
        }
    }

    on_progress(ProgressEvent::phase_only(Phase::Syncing));
    dev.sync_data()
        .map_err(|source| Error::Write {
            offset: written,
            source,
        })?;

    // Verification re-opens the device, so our exclusive handle must go
    // first; a reopened handle also ensures no dirty cache masks a failure.
    drop(dev);

    let mut verification_done = false;
    if !opts.no_verify {
        check_cancelled(running)?;
        on_progress(ProgressEvent::phase_only(Phase::Verifying));
        let source = match &bmap {
            Some(bmap) => VerifySource::Bmap(bmap),
            None => VerifySource::RawImage {
                image_path: &image_path,
                archive_entry: None,
            },
        };
        verify::run(&opts.device_path, source, running, &mut on_progress)?;
        verification_done = true;
    }

    let mut device_ejected = false;
    if !opts.no_eject {
        on_progress(ProgressEvent::phase_only(Phase::Ejecting));
        match platform::eject_device(&opts.device_path) {
            Ok(()) => device_ejected = true,
            Err(e) => log::warn!("failed to eject {}: {}", opts.device_path.display(), e),
        }
    }

    drop(extracted);

    let duration = started.elapsed();
    let average_speed = if duration.as_secs_f64() > 0.0 {
        written as f64 / duration.as_secs_f64()
    } else {
        0.0
    };
    let blocks_written = match &bmap {
        Some(bmap) => bmap.mapped_blocks_count,
        None => written.div_ceil(crate::bmap::DEFAULT_BLOCK_SIZE),
    };

    Ok(FlashResult {
        bytes_written: written,
        blocks_written,
        duration,
        average_speed,
        used_bmap: bmap.is_some(),
        verification_done,
        device_ejected,
    })
}

fn check_cancelled(running: &Arc<AtomicBool>) -> Result<()> {
    if !running.load(Ordering::SeqCst) {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Refuse to touch a target that has mounted volumes.
///
/// `target` is compared against every enumerated device after path
/// normalization, so `PhysicalDrive2` matches `\\.\PhysicalDrive2`.
pub fn check_device_busy(devices: &[Device], target: &str) -> Result<()> {
    let normalized = platform::normalize_device_path(target);
    for device in devices {
        if platform::normalize_device_path(&device.path) == normalized
            && !device.mount_points.is_empty()
        {
            return Err(Error::DeviceBusy {
                device: device.path.clone(),
                mounts: device.mount_points.clone(),
            });
        }
    }
    Ok(())
}

/// Write the whole buffer, retrying short writes. A zero-byte write means
/// the device silently stopped accepting data and is fatal.
pub(crate) fn write_all_retry(dev: &mut impl Write, buf: &[u8], base_offset: u64) -> Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let n = dev
            .write(&buf[done..])
            .map_err(|source| Error::Write {
                offset: base_offset + done as u64,
                source,
            })?;
        if n == 0 {
            return Err(Error::ShortWrite(base_offset + done as u64));
        }
        done += n;
    }
    Ok(())
}

fn copy_progress(
    written: u64,
    total: u64,
    source_read: u64,
    source_total: u64,
    started: Instant,
) -> ProgressEvent {
    let elapsed = started.elapsed().as_secs_f64();
    let speed = if elapsed > 0.0 {
        written as f64 / elapsed
    } else {
        0.0
    };
    // Prefer the compressed-input fraction: with a compressed image the
    // decompressed total is unknown up front, but input consumption still
    // reflects end-to-end progress.
    let percentage = if source_total > 0 {
        source_read as f64 / source_total as f64 * 100.0
    } else if total > 0 {
        written as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    ProgressEvent {
        phase: Phase::Writing,
        bytes_processed: written,
        bytes_total: total,
        percentage,
        speed,
    }
}

/// Probe the conventional bmap locations next to an image: the image name
/// plus `.bmap`, and the same with the compression suffix stripped.
pub fn discover_bmap(image_path: &Path) -> Option<PathBuf> {
    let mut candidates = vec![PathBuf::from(format!("{}.bmap", image_path.display()))];
    if compression::is_compressed_name(image_path) {
        let stem = image_path.with_extension("");
        candidates.push(PathBuf::from(format!("{}.bmap", stem.display())));
    }
    candidates.into_iter().find(|c| c.exists())
}
