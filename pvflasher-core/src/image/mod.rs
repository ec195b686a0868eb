//! Image access: decompression, forward-only streaming, and sparse-extent
//! probing of source files.

pub mod compression;
pub mod reader;
pub mod sparse;

pub use compression::{decompressor, is_compressed_name, COMPRESSION_EXTENSIONS};
pub use reader::{CountingReader, ForwardSeeker};
pub use sparse::{data_ranges, ByteRange};
