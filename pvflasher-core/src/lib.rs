//! The core, UI-agnostic library for the `pvflasher` imaging utility.
//!
//! `pvflasher-core` is designed to be used as a library by any front-end,
//! whether it's a command-line interface (like `pvflasher`) or a graphical
//! user interface. It handles block-map ("bmap") parsing and generation,
//! image decompression, archive demuxing, exclusive raw-device access,
//! bmap-driven or raw copying, and post-write verification.
//!
//! The library is structured into several key modules:
//! - [`bmap`]: The block-map model, XML codec and generator.
//! - [`image`]: Decompression, forward-only streaming and sparse probing.
//! - [`archive`]: Locating an image/bmap pair inside a tar container.
//! - [`device`] / [`platform`]: Cross-platform device discovery and
//!   exclusive raw-device I/O.
//! - [`flash`]: The copy pipeline and the verifier.
//! - [`catalog`]: The remote release catalog and download cache.
//!
//! The primary entry point for imaging is [`flash::run`]. It is synchronous
//! and reports progress via a callback, allowing the calling application to
//! display progress in any way it chooses; cancellation is cooperative
//! through a shared flag.
//!
//! ## Example: flashing an image
//!
//! ```rust,no_run
//! use pvflasher_core::flash::{self, FlashOptions};
//! use std::path::PathBuf;
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! fn main() -> pvflasher_core::Result<()> {
//!     let options = FlashOptions {
//!         image_path: PathBuf::from("release.wic.gz"),
//!         device_path: PathBuf::from("/dev/sdb"),
//!         bmap_path: Some(PathBuf::from("release.wic.bmap")),
//!         force: false,
//!         no_verify: false,
//!         no_eject: false,
//!     };
//!
//!     // A shared flag to allow for graceful cancellation.
//!     let running = Arc::new(AtomicBool::new(true));
//!
//!     let result = flash::run(&options, &running, |event| {
//!         println!("{:?}: {} / {} bytes", event.phase, event.bytes_processed, event.bytes_total);
//!     })?;
//!
//!     println!("wrote {} bytes", result.bytes_written);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod bmap;
pub mod catalog;
pub mod config;
pub mod device;
pub mod error;
pub mod flash;
pub mod image;
pub mod platform;

pub use error::{Error, Result};
