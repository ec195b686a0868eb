//! End-to-end flashing tests against regular files standing in for block
//! devices.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;

use pvflasher_core::bmap::{self, CreateOptions};
use pvflasher_core::error::Error;
use pvflasher_core::flash::{self, verify, FlashOptions, Phase};
use tempfile::{tempdir, TempDir};

const MIB: usize = 1024 * 1024;

/// Deterministic pseudo-random bytes.
fn pseudo_random(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        out.push((seed >> 33) as u8);
    }
    out
}

fn write_file(path: &Path, contents: &[u8]) {
    let mut f = File::create(path).unwrap();
    f.write_all(contents).unwrap();
    f.sync_all().unwrap();
}

struct Fixture {
    _dir: TempDir,
    image: PathBuf,
    device: PathBuf,
}

fn fixture(image_data: &[u8], device_data: &[u8]) -> Fixture {
    let dir = tempdir().unwrap();
    let image = dir.path().join("source.img");
    let device = dir.path().join("device.img");
    write_file(&image, image_data);
    write_file(&device, device_data);
    Fixture {
        _dir: dir,
        image,
        device,
    }
}

fn options(fixture: &Fixture) -> FlashOptions {
    FlashOptions {
        image_path: fixture.image.clone(),
        device_path: fixture.device.clone(),
        bmap_path: None,
        force: true,
        no_verify: false,
        no_eject: true,
    }
}

fn running() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

#[test]
fn raw_flash_writes_and_verifies() {
    let image_data = pseudo_random(2 * MIB, 42);
    let fx = fixture(&image_data, &vec![0u8; 3 * MIB]);

    let result = flash::run(&options(&fx), &running(), |_| {}).unwrap();

    assert_eq!(result.bytes_written, 2 * MIB as u64);
    assert!(!result.used_bmap);
    assert!(result.verification_done);
    assert!(!result.device_ejected);

    let written = fs::read(&fx.device).unwrap();
    assert_eq!(written.len(), 3 * MIB);
    assert_eq!(&written[..2 * MIB], &image_data[..]);
    assert!(written[2 * MIB..].iter().all(|&b| b == 0));
}

#[test]
fn compressed_image_is_decompressed_on_the_fly() {
    let payload = pseudo_random(MIB, 7);
    let dir = tempdir().unwrap();
    let image = dir.path().join("source.img.gz");
    let device = dir.path().join("device.img");

    let mut enc = GzEncoder::new(File::create(&image).unwrap(), Compression::default());
    enc.write_all(&payload).unwrap();
    enc.finish().unwrap().sync_all().unwrap();
    write_file(&device, &vec![0u8; 2 * MIB]);

    let opts = FlashOptions {
        image_path: image,
        device_path: device.clone(),
        bmap_path: None,
        force: true,
        no_verify: false,
        no_eject: true,
    };
    let result = flash::run(&opts, &running(), |_| {}).unwrap();

    assert_eq!(result.bytes_written, MIB as u64);
    let written = fs::read(&device).unwrap();
    assert_eq!(&written[..MIB], &payload[..]);
}

#[test]
fn bmap_flash_skips_unmapped_blocks() {
    // Blocks 0 and 2 hold payload, blocks 1 and 3 are zero, and a trailing
    // half block holds payload too.
    let block = 4096;
    let image_size = 4 * block + 2048;
    let mut image_data = vec![0u8; image_size];
    image_data[..block].copy_from_slice(&pseudo_random(block, 1));
    image_data[2 * block..3 * block].copy_from_slice(&pseudo_random(block, 2));
    image_data[4 * block..].copy_from_slice(&pseudo_random(2048, 3));

    // The device stand-in is prefilled with a sentinel so untouched blocks
    // are observable.
    let fx = fixture(&image_data, &vec![0xEEu8; 6 * block]);

    let bmap = bmap::create(&fx.image, &CreateOptions::default()).unwrap();
    assert_eq!(bmap.mapped_blocks_count, 3);
    let bmap_path = fx.image.with_extension("img.bmap");
    bmap.save(&bmap_path).unwrap();

    let opts = FlashOptions {
        bmap_path: Some(bmap_path),
        ..options(&fx)
    };
    let result = flash::run(&opts, &running(), |_| {}).unwrap();

    assert!(result.used_bmap);
    assert_eq!(result.blocks_written, 3);
    assert_eq!(result.bytes_written, (3 * block - 2048) as u64);
    assert!(result.verification_done);

    let written = fs::read(&fx.device).unwrap();
    // Mapped content arrived.
    assert_eq!(&written[..block], &image_data[..block]);
    assert_eq!(&written[2 * block..3 * block], &image_data[2 * block..3 * block]);
    assert_eq!(&written[4 * block..image_size], &image_data[4 * block..]);
    // Unmapped blocks were never written.
    assert!(written[block..2 * block].iter().all(|&b| b == 0xEE));
    assert!(written[3 * block..4 * block].iter().all(|&b| b == 0xEE));
    // The partial last block wrote exactly its 2048 real bytes.
    assert!(written[image_size..5 * block].iter().all(|&b| b == 0xEE));
}

#[test]
fn bmap_flash_onto_zeroed_device_reproduces_image() {
    // With a zeroed target, a bmap copy must be byte-identical to the raw
    // image, which the raw verifier can then confirm.
    let block = 4096;
    let mut image_data = vec![0u8; 8 * block];
    image_data[..block].copy_from_slice(&pseudo_random(block, 11));
    image_data[5 * block..6 * block].copy_from_slice(&pseudo_random(block, 12));

    let fx = fixture(&image_data, &vec![0u8; 8 * block]);
    let bmap = bmap::create(&fx.image, &CreateOptions::default()).unwrap();
    let bmap_path = fx.image.with_extension("img.bmap");
    bmap.save(&bmap_path).unwrap();

    let opts = FlashOptions {
        bmap_path: Some(bmap_path),
        ..options(&fx)
    };
    flash::run(&opts, &running(), |_| {}).unwrap();

    verify::run(
        &fx.device,
        verify::VerifySource::RawImage {
            image_path: &fx.image,
            archive_entry: None,
        },
        &running(),
        |_| {},
    )
    .expect("bmap copy must reproduce the image byte-exactly");

    assert_eq!(fs::read(&fx.device).unwrap(), image_data);
}

#[test]
fn corrupted_device_fails_verification() {
    let image_data = pseudo_random(MIB, 99);
    let fx = fixture(&image_data, &vec![0u8; MIB]);

    let mut opts = options(&fx);
    opts.no_verify = true;
    flash::run(&opts, &running(), |_| {}).unwrap();

    // Flip one byte behind the flasher's back.
    let mut tampered = fs::read(&fx.device).unwrap();
    tampered[123_456] ^= 0xFF;
    write_file(&fx.device, &tampered);

    let err = verify::run(
        &fx.device,
        verify::VerifySource::RawImage {
            image_path: &fx.image,
            archive_entry: None,
        },
        &running(),
        |_| {},
    )
    .unwrap_err();

    match err {
        Error::Verification(msg) => assert!(msg.contains("123456"), "unexpected message: {msg}"),
        other => panic!("expected verification error, got {other:?}"),
    }
}

#[test]
fn archive_bundles_are_extracted_and_their_bmap_adopted() {
    let block = 4096;
    let mut image_data = vec![0u8; 3 * block];
    image_data[..block].copy_from_slice(&pseudo_random(block, 5));
    image_data[2 * block..].copy_from_slice(&pseudo_random(block, 6));

    let dir = tempdir().unwrap();
    let inner_image = dir.path().join("x.wic");
    write_file(&inner_image, &image_data);
    let bmap = bmap::create(&inner_image, &CreateOptions::default()).unwrap();

    let archive_path = dir.path().join("bundle.tar.gz");
    let gz = GzEncoder::new(File::create(&archive_path).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(gz);
    let mut add = |name: &str, data: &[u8]| {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    };
    add("x.wic", &image_data);
    add("x.wic.bmap", bmap.to_xml().as_bytes());
    builder.into_inner().unwrap().finish().unwrap().sync_all().unwrap();

    let device = dir.path().join("device.img");
    write_file(&device, &vec![0u8; 4 * block]);

    let opts = FlashOptions {
        image_path: archive_path,
        device_path: device.clone(),
        bmap_path: None,
        force: true,
        no_verify: false,
        no_eject: true,
    };
    let result = flash::run(&opts, &running(), |_| {}).unwrap();

    assert!(result.used_bmap);
    assert_eq!(result.blocks_written, 2);
    let written = fs::read(&device).unwrap();
    assert_eq!(&written[..block], &image_data[..block]);
    assert_eq!(&written[2 * block..3 * block], &image_data[2 * block..]);
}

#[test]
fn cancellation_stops_before_the_first_buffer() {
    let image_data = pseudo_random(MIB, 13);
    let fx = fixture(&image_data, &vec![0u8; 2 * MIB]);

    let cancelled = Arc::new(AtomicBool::new(false));
    let mut events = Vec::new();
    let err = flash::run(&options(&fx), &cancelled, |event| events.push(event)).unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(
        events.iter().all(|e| e.phase != Phase::Writing),
        "no write progress may be reported after cancellation"
    );
    // Nothing was copied.
    assert!(fs::read(&fx.device).unwrap().iter().all(|&b| b == 0));
}
