use std::fmt;

use crate::error::Result;
use crate::platform;

/// A storage device discovered on the system.
///
/// Populated by the platform-specific enumeration in [`crate::platform`] and
/// consumed by front-ends for selection and by the flasher's safety check.
#[derive(Clone, Debug)]
pub struct Device {
    /// OS-native path (e.g. `/dev/sda` or `\\.\PhysicalDrive0`).
    pub path: String,
    /// Total size in bytes.
    pub size: u64,
    /// Vendor string, possibly empty.
    pub vendor: String,
    /// Model string, possibly empty.
    pub model: String,
    /// Whether the OS reports the media as removable.
    pub removable: bool,
    /// Mount points of all volumes residing on the device, partitions
    /// included.
    pub mount_points: Vec<String>,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size_gb = self.size as f64 / (1024.0 * 1024.0 * 1024.0);
        let mount_info = if self.mount_points.is_empty() {
            "[Not mounted]".to_string()
        } else {
            format!("[Mounted at {}]", self.mount_points.join(", "))
        };

        write!(
            f,
            "{:<24} {} {} {:>8.1} GB {}",
            self.path,
            self.vendor.trim(),
            self.model.trim(),
            size_gb,
            mount_info
        )
    }
}

/// Enumerate the physical disks of this machine with their mount state.
pub fn list() -> Result<Vec<Device>> {
    platform::list_devices()
}
