//! Format-sniffed decompression.
//!
//! The format is chosen by filename extension. The returned reader is a plain
//! forward stream; random access over compressed input is provided by
//! [`super::reader::ForwardSeeker`].

use std::io::{BufReader, Read};
use std::path::Path;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::error::Result;

/// Extensions recognized as compression suffixes, without the leading dot.
pub const COMPRESSION_EXTENSIONS: &[&str] = &["gz", "bz2", "xz", "zst", "zstd"];

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Whether the file name carries a recognized compression extension.
pub fn is_compressed_name(path: &Path) -> bool {
    COMPRESSION_EXTENSIONS.contains(&extension_of(path).as_str())
}

/// Wrap `inner` in a decoder chosen by the extension of `path`, or return it
/// unchanged when the name carries no recognized compression suffix.
pub fn decompressor<'a, R: Read + 'a>(path: &Path, inner: R) -> Result<Box<dyn Read + 'a>> {
    let reader: Box<dyn Read + 'a> = match extension_of(path).as_str() {
        "gz" => Box::new(GzDecoder::new(BufReader::new(inner))),
        "bz2" => Box::new(BzDecoder::new(BufReader::new(inner))),
        "xz" => Box::new(XzDecoder::new(BufReader::new(inner))),
        "zst" | "zstd" => Box::new(ZstdDecoder::new(inner)?),
        _ => Box::new(inner),
    };
    Ok(reader)
}
