//! Platform-specific device access.
//!
//! Each submodule exposes the same surface for its OS: enumeration
//! (`list_devices`), exclusive raw-device access (`open_device` returning a
//! [`DeviceIo`]), pre-open work (`prepare_device`) and final release
//! (`eject_device`). Conditional compilation selects the right one so the
//! rest of the library never branches on the OS.

use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::device::Device;
use crate::error::Result;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use self::linux as imp;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
use self::macos as imp;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
use self::windows as imp;

/// An exclusively held raw device.
///
/// The handle owns whatever the OS needs to keep other writers out (the
/// `O_EXCL` descriptor, the advisory lock, the Windows volume-lock handles)
/// and releases it on drop. The flasher drops its handle before verification
/// so the verifier can reopen the device exclusively.
pub trait DeviceIo: Read + Write + Seek + Send {
    /// Flush all written data down to the hardware.
    fn sync_data(&mut self) -> std::io::Result<()>;

    /// The OS-native descriptor, for callers that need ioctl-level access.
    fn raw_descriptor(&self) -> u64;
}

/// Normalize a device path for comparison against enumerated devices.
pub fn normalize_device_path(path: &str) -> String {
    imp::normalize_device_path(path)
}

/// Run any pre-open work the platform needs (dislodging auto-mounted
/// volumes on macOS; a no-op elsewhere).
pub fn prepare_device(path: &Path) -> Result<()> {
    imp::prepare_device(path)
}

/// Open the device read-write with exclusive access for the lifetime of the
/// returned handle.
pub fn open_device(path: &Path) -> Result<Box<dyn DeviceIo>> {
    imp::open_device(path)
}

/// Dismount any remaining volumes and signal media removal. Runs to
/// completion; failures are surfaced but treated as non-fatal by callers.
pub fn eject_device(path: &Path) -> Result<()> {
    imp::eject_device(path)
}

/// List physical disks with size, identity strings, removable flag and
/// mount points.
pub fn list_devices() -> Result<Vec<Device>> {
    imp::list_devices()
}
