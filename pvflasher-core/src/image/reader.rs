//! Stream adapters used by the copy pipeline.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counts the bytes read through it.
///
/// Sits beneath the decompressor so the flasher can report end-to-end
/// progress against the *compressed* source size. The counter is shared so it
/// stays readable after the reader has been moved into the decoder.
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle that reports the number of bytes consumed so far.
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.count)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// A `Seek` over a plain stream that only moves forward.
///
/// Decompressors expose no random access, but the bmap copy loop visits
/// ranges in ascending block order, so skipping ahead by discarding bytes is
/// enough. A backward seek is a programmer error and fails.
pub struct ForwardSeeker<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> ForwardSeeker<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Current position in the decompressed stream.
    pub fn position(&self) -> u64 {
        self.offset
    }

    fn discard(&mut self, mut remaining: u64) -> io::Result<()> {
        let mut scratch = [0u8; 8192];
        while remaining > 0 {
            let want = remaining.min(scratch.len() as u64) as usize;
            let n = self.inner.read(&mut scratch[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended while seeking forward",
                ));
            }
            self.offset += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }
}

impl<R: Read> Read for ForwardSeeker<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl<R: Read> Seek for ForwardSeeker<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => {
                let base = self.offset as i64;
                let t = base.checked_add(delta).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek offset overflow")
                })?;
                if t < 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "cannot seek before the start of the stream",
                    ));
                }
                t as u64
            }
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "seeking from the end is not supported on a stream",
                ));
            }
        };

        if target < self.offset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot seek backwards in a stream ({} -> {})",
                    self.offset, target
                ),
            ));
        }
        if target > self.offset {
            self.discard(target - self.offset)?;
        }
        Ok(self.offset)
    }
}

/// Fill `buf` as far as the stream allows, returning the number of bytes
/// read. Unlike `read_exact`, a clean end of stream is not an error.
pub(crate) fn read_full(reader: &mut (impl Read + ?Sized), buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn counting_reader_counts_input_bytes() {
        let data = sample(10_000);
        let mut r = CountingReader::new(Cursor::new(data.clone()));
        let counter = r.counter();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(counter.load(Ordering::Relaxed), data.len() as u64);
    }

    #[test]
    fn forward_seek_matches_slicing() {
        // Reading at each seeked offset must yield the same bytes as slicing
        // the underlying stream. Each offset leaves room for the 64-byte
        // read before the next one, keeping the sequence non-decreasing.
        let data = sample(65_536);
        let offsets = [0u64, 64, 100, 4096, 12_345, 60_000];

        let mut seeker = ForwardSeeker::new(Cursor::new(data.clone()));
        for &off in &offsets {
            seeker.seek(SeekFrom::Start(off)).unwrap();
            let mut buf = [0u8; 64];
            seeker.read_exact(&mut buf).unwrap();
            assert_eq!(&buf[..], &data[off as usize..off as usize + 64]);
        }
    }

    #[test]
    fn seek_to_current_offset_is_noop() {
        let data = sample(1024);
        let mut seeker = ForwardSeeker::new(Cursor::new(data));
        seeker.seek(SeekFrom::Start(100)).unwrap();
        let pos = seeker.seek(SeekFrom::Start(100)).unwrap();
        assert_eq!(pos, 100);
        assert_eq!(seeker.position(), 100);
    }

    #[test]
    fn backward_seek_fails() {
        let data = sample(1024);
        let mut seeker = ForwardSeeker::new(Cursor::new(data));
        seeker.seek(SeekFrom::Start(512)).unwrap();
        let err = seeker.seek(SeekFrom::Start(256)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn relative_seek_discards_exactly_delta() {
        let data = sample(1024);
        let mut seeker = ForwardSeeker::new(Cursor::new(data.clone()));
        seeker.seek(SeekFrom::Current(10)).unwrap();
        let mut one = [0u8; 1];
        seeker.read_exact(&mut one).unwrap();
        assert_eq!(one[0], data[10]);
    }

    #[test]
    fn seeking_past_eof_fails() {
        let data = sample(100);
        let mut seeker = ForwardSeeker::new(Cursor::new(data));
        let err = seeker.seek(SeekFrom::Start(200)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
