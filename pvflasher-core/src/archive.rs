//! Locating an image / bmap pair inside a tar-family container.
//!
//! Recognized outer formats are plain `.tar`, `.tgz` and `.tar.gz`. Inside,
//! an image entry is a base name ending in `.img`, `.iso` or `.wic`
//! (optionally followed by a compression suffix) and a bmap entry ends in
//! `.bmap`. A bmap pairs with an image when its base name minus `.bmap`
//! equals the image base name minus its compression suffix.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::bmap::Bmap;
use crate::error::{Error, Result};
use crate::image::compression::{decompressor, COMPRESSION_EXTENSIONS};

const IMAGE_EXTENSIONS: &[&str] = &["img", "iso", "wic"];

/// Whether the path names a tar-family container we can demux.
pub fn is_archive(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    name.ends_with(".tar") || name.ends_with(".tgz") || name.ends_with(".tar.gz")
}

/// The image entry found in an archive, with its bmap when one pairs up.
#[derive(Debug)]
pub struct ArchivePair {
    /// Entry name of the image inside the archive.
    pub image_entry: String,
    /// Entry name of the paired bmap, if any.
    pub bmap_entry: Option<String>,
    /// The paired bmap, already parsed and integrity-checked.
    pub bmap: Option<Bmap>,
}

fn base_name(entry_name: &str) -> &str {
    entry_name.rsplit('/').next().unwrap_or(entry_name)
}

fn split_extension(name: &str) -> (&str, String) {
    match name.rfind('.') {
        Some(dot) => (&name[..dot], name[dot + 1..].to_lowercase()),
        None => (name, String::new()),
    }
}

/// The pairing key of an image base name: the name with any compression
/// suffix stripped, or `None` when it is not an image at all.
fn image_key(base: &str) -> Option<String> {
    let (stem, ext) = split_extension(base);
    if COMPRESSION_EXTENSIONS.contains(&ext.as_str()) {
        let (_, inner_ext) = split_extension(stem);
        if IMAGE_EXTENSIONS.contains(&inner_ext.as_str()) {
            return Some(stem.to_string());
        }
        return None;
    }
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return Some(base.to_string());
    }
    None
}

fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(path)?;
    let reader = decompressor(path, file)?;
    Ok(tar::Archive::new(reader))
}

/// Scan the archive and pick an image entry, preferring one with a matching
/// bmap. Falls back to the first image in archive order.
pub fn scan_pair(path: &Path) -> Result<ArchivePair> {
    let mut archive = open_archive(path)?;

    // (pairing key, entry name) in archive order.
    let mut images: Vec<(String, String)> = Vec::new();
    // pairing key -> (parsed bmap, entry name)
    let mut bmaps: Vec<(String, Bmap, String)> = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let base = base_name(&name).to_string();

        if base.to_lowercase().ends_with(".bmap") {
            let mut content = Vec::new();
            if entry.read_to_end(&mut content).is_err() {
                continue;
            }
            match Bmap::parse(&content) {
                Ok(bmap) => {
                    let key = base[..base.len() - ".bmap".len()].to_string();
                    bmaps.push((key, bmap, name));
                }
                Err(e) => log::warn!("ignoring unparseable bmap entry {}: {}", name, e),
            }
        } else if let Some(key) = image_key(&base) {
            images.push((key, name));
        }
    }

    for (key, image_entry) in &images {
        if let Some(pos) = bmaps.iter().position(|(k, _, _)| k == key) {
            let (_, bmap, bmap_entry) = bmaps.swap_remove(pos);
            return Ok(ArchivePair {
                image_entry: image_entry.clone(),
                bmap_entry: Some(bmap_entry),
                bmap: Some(bmap),
            });
        }
    }

    match images.into_iter().next() {
        Some((_, image_entry)) => Ok(ArchivePair {
            image_entry,
            bmap_entry: None,
            bmap: None,
        }),
        None => Err(Error::ArchiveNotFound),
    }
}

/// Image and bmap extracted to a scratch directory.
///
/// The directory lives exactly as long as this value; dropping it removes
/// the extracted files on every exit path.
#[derive(Debug)]
pub struct Extracted {
    pub image_path: PathBuf,
    pub bmap_path: Option<PathBuf>,
    _scratch: TempDir,
}

/// Extract the archive's image (and paired bmap, if any) to a scratch
/// directory.
pub fn extract(path: &Path) -> Result<Extracted> {
    let pair = scan_pair(path)?;
    let scratch = tempfile::Builder::new()
        .prefix("pvflasher-extract-")
        .tempdir()?;

    let mut image_path = None;
    let mut bmap_path = None;

    let mut archive = open_archive(path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();

        let wanted_bmap = pair.bmap_entry.as_deref() == Some(name.as_str());
        if name != pair.image_entry && !wanted_bmap {
            continue;
        }

        let dest = scratch.path().join(base_name(&name));
        let mut out = File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;

        if wanted_bmap {
            bmap_path = Some(dest);
        } else {
            image_path = Some(dest);
        }

        if image_path.is_some() && (pair.bmap_entry.is_none() || bmap_path.is_some()) {
            break;
        }
    }

    let image_path = image_path.ok_or(Error::ArchiveNotFound)?;
    Ok(Extracted {
        image_path,
        bmap_path,
        _scratch: scratch,
    })
}

/// Run `f` over a reader positioned at the named entry's content.
///
/// Callback-shaped because a tar entry borrows its archive; this keeps the
/// whole reader chain alive for exactly the duration of the read.
pub fn read_entry<T>(
    archive_path: &Path,
    entry_name: &str,
    f: impl FnOnce(&mut dyn Read) -> Result<T>,
) -> Result<T> {
    let mut archive = open_archive(archive_path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if name == entry_name {
            return f(&mut entry);
        }
    }
    Err(Error::ArchiveNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bmap::{BlockRange, ChecksumType};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    fn sample_bmap_xml() -> String {
        Bmap {
            version: "2.0".into(),
            image_size: 4096,
            block_size: 4096,
            blocks_count: 1,
            mapped_blocks_count: 1,
            checksum_type: ChecksumType::Sha256,
            ranges: vec![BlockRange {
                start: 0,
                end: 0,
                checksum: "c".repeat(64),
            }],
        }
        .to_xml()
    }

    fn build_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let gz = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
    }

    #[test]
    fn compressed_image_pairs_with_bmap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bundle.tar.gz");
        let bmap_xml = sample_bmap_xml();
        build_tar_gz(
            &path,
            &[
                ("x.wic.gz", b"not really gzip".as_slice()),
                ("x.wic.bmap", bmap_xml.as_bytes()),
            ],
        );

        let pair = scan_pair(&path).unwrap();
        assert_eq!(pair.image_entry, "x.wic.gz");
        assert_eq!(pair.bmap_entry.as_deref(), Some("x.wic.bmap"));
        assert_eq!(pair.bmap.unwrap().image_size, 4096);
    }

    #[test]
    fn unpaired_image_is_returned_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.tar");
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "rootfs.img", b"abc".as_slice())
            .unwrap();
        builder.into_inner().unwrap().flush().unwrap();

        let pair = scan_pair(&path).unwrap();
        assert_eq!(pair.image_entry, "rootfs.img");
        assert!(pair.bmap_entry.is_none());
        assert!(pair.bmap.is_none());
    }

    #[test]
    fn archive_without_image_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("noimg.tar.gz");
        build_tar_gz(&path, &[("readme.txt", b"hello".as_slice())]);
        assert!(matches!(scan_pair(&path), Err(Error::ArchiveNotFound)));
    }

    #[test]
    fn extraction_materializes_both_entries_and_cleans_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bundle.tgz");
        let bmap_xml = sample_bmap_xml();
        build_tar_gz(
            &path,
            &[
                ("deploy/x.wic", b"image-bytes".as_slice()),
                ("deploy/x.wic.bmap", bmap_xml.as_bytes()),
            ],
        );

        let scratch_path;
        {
            let extracted = extract(&path).unwrap();
            assert_eq!(
                std::fs::read(&extracted.image_path).unwrap(),
                b"image-bytes"
            );
            let bmap_path = extracted.bmap_path.clone().unwrap();
            assert!(bmap_path.exists());
            scratch_path = extracted.image_path.parent().unwrap().to_path_buf();
        }
        assert!(!scratch_path.exists(), "scratch directory must be removed on drop");
    }

    #[test]
    fn read_entry_streams_the_named_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bundle.tar.gz");
        build_tar_gz(
            &path,
            &[
                ("a.img", b"aaaa".as_slice()),
                ("b.img", b"bbbb".as_slice()),
            ],
        );

        let content = read_entry(&path, "b.img", |r| {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            Ok(buf)
        })
        .unwrap();
        assert_eq!(content, b"bbbb");

        assert!(matches!(
            read_entry(&path, "missing.img", |_| Ok(())),
            Err(Error::ArchiveNotFound)
        ));
    }

    #[test]
    fn archive_names_are_recognized() {
        assert!(is_archive(Path::new("x.tar")));
        assert!(is_archive(Path::new("x.tgz")));
        assert!(is_archive(Path::new("x.tar.gz")));
        assert!(!is_archive(Path::new("x.img.gz")));
        assert!(!is_archive(Path::new("x.img")));
    }
}
