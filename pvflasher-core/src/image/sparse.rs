//! Sparse-extent probing of source files.
//!
//! Used by bmap generation to skip filesystem holes without reading them.

use std::fs::File;

use crate::error::Result;

/// A half-open byte range `[start, end)` of a file that holds data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// Returns the ordered, non-overlapping byte ranges of `file` that contain
/// data. Filesystems without hole queries report the whole file as one range;
/// a fully sparse file yields an empty list.
#[cfg(unix)]
pub fn data_ranges(file: &File) -> Result<Vec<ByteRange>> {
    use nix::errno::Errno;
    use std::os::unix::io::AsRawFd;

    let size = file.metadata()?.len();
    let fd = file.as_raw_fd();

    let mut ranges = Vec::new();
    let mut offset: i64 = 0;

    while (offset as u64) < size {
        let data_start = match Errno::result(unsafe { libc::lseek(fd, offset, libc::SEEK_DATA) }) {
            Ok(pos) => pos,
            // No more data past this offset.
            Err(Errno::ENXIO) => break,
            // Filesystem does not support hole queries.
            Err(Errno::EINVAL) | Err(Errno::EOPNOTSUPP) => {
                return Ok(vec![ByteRange { start: 0, end: size }]);
            }
            Err(e) => return Err(std::io::Error::from(e).into()),
        };

        let hole_start = Errno::result(unsafe { libc::lseek(fd, data_start, libc::SEEK_HOLE) })
            .map(|pos| (pos as u64).min(size))
            .unwrap_or(size);

        ranges.push(ByteRange {
            start: data_start as u64,
            end: hole_start,
        });
        offset = hole_start as i64;
    }

    Ok(ranges)
}

/// Hole introspection is unavailable here; the whole file is one data range.
#[cfg(not(unix))]
pub fn data_ranges(file: &File) -> Result<Vec<ByteRange>> {
    let size = file.metadata()?.len();
    Ok(vec![ByteRange { start: 0, end: size }])
}
