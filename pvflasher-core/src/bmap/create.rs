//! Bmap generation from an image file.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use super::{BlockRange, Bmap, ChecksumType, DEFAULT_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::image::reader::read_full;
use crate::image::sparse;

/// Knobs for [`create`].
#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    pub block_size: u64,
    pub checksum_type: ChecksumType,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            checksum_type: ChecksumType::Sha256,
        }
    }
}

/// Walk `image_path` and build its block map.
///
/// The filesystem's data extents bound the scan; within them, blocks that
/// read as all zeros are skipped as well, closing the open range so the
/// output only maps blocks that carry payload.
pub fn create(image_path: &Path, opts: &CreateOptions) -> Result<Bmap> {
    if opts.block_size == 0 {
        return Err(Error::BmapParse("block size must be non-zero".into()));
    }

    let mut file = File::open(image_path)?;
    let image_size = file.metadata()?.len();
    let block_size = opts.block_size;
    let blocks_count = image_size.div_ceil(block_size);

    let extents = sparse::data_ranges(&file)?;

    let mut ranges: Vec<BlockRange> = Vec::new();
    let mut mapped_blocks_count = 0u64;
    let mut buf = vec![0u8; block_size as usize];

    for extent in extents {
        if extent.end <= extent.start {
            continue;
        }
        let first_block = extent.start / block_size;
        let last_block = ((extent.end - 1) / block_size).min(blocks_count.saturating_sub(1));

        file.seek(SeekFrom::Start(first_block * block_size))?;

        let mut open_start: Option<u64> = None;
        let mut hasher = opts.checksum_type.hasher();

        for block in first_block..=last_block {
            let n = read_full(&mut file, &mut buf)?;
            if n == 0 {
                break;
            }

            if buf[..n].iter().all(|&b| b == 0) {
                // The filesystem mapped it, but it carries nothing; close
                // any open range and drop the block from the map.
                if let Some(start) = open_start.take() {
                    ranges.push(BlockRange {
                        start,
                        end: block - 1,
                        checksum: std::mem::replace(&mut hasher, opts.checksum_type.hasher())
                            .finish_hex(),
                    });
                }
                continue;
            }

            mapped_blocks_count += 1;
            if open_start.is_none() {
                open_start = Some(block);
            }
            hasher.update(&buf[..n]);
        }

        if let Some(start) = open_start {
            ranges.push(BlockRange {
                start,
                end: last_block,
                checksum: hasher.finish_hex(),
            });
        }
    }

    Ok(Bmap {
        version: "2.0".to_string(),
        image_size,
        block_size,
        blocks_count,
        mapped_blocks_count,
        checksum_type: opts.checksum_type,
        ranges,
    })
}
