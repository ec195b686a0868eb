use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::platform::DeviceIo;

pub(super) fn normalize_device_path(path: &str) -> String {
    path.to_string()
}

struct LinuxDevice {
    file: File,
}

impl Read for LinuxDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for LinuxDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for LinuxDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl DeviceIo for LinuxDevice {
    fn sync_data(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn raw_descriptor(&self) -> u64 {
        self.file.as_raw_fd() as u64
    }
}

/// Open the device read-write with `O_EXCL`; the kernel denies concurrent
/// opens of a block device carrying that flag.
pub(super) fn open_device(path: &Path) -> Result<Box<dyn DeviceIo>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_EXCL)
        .open(path)
        .map_err(|source| Error::DeviceOpen {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Box::new(LinuxDevice { file }))
}

/// The exclusive open needs no preparation here.
pub(super) fn prepare_device(_path: &Path) -> Result<()> {
    Ok(())
}

/// `eject` unmounts remaining filesystems and releases the media.
pub(super) fn eject_device(path: &Path) -> Result<()> {
    let status = Command::new("eject").arg(path).status()?;
    if !status.success() {
        return Err(Error::Io(io::Error::other(format!(
            "eject {} exited with {}",
            path.display(),
            status
        ))));
    }
    Ok(())
}

/// Helper to read one attribute file from the /sys/block inventory.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// The mount table as (device path, mount point) pairs.
fn read_mounts() -> io::Result<Vec<(String, String)>> {
    let file = File::open("/proc/mounts")?;
    let mut mounts = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let mut fields = line.split_whitespace();
        if let (Some(dev), Some(mount_point)) = (fields.next(), fields.next()) {
            if dev.starts_with("/dev/") {
                mounts.push((dev.to_string(), mount_point.to_string()));
            }
        }
    }
    Ok(mounts)
}

/// Enumerate disks from /sys/block, with per-partition mount points rolled
/// up to the parent device.
pub(super) fn list_devices() -> Result<Vec<Device>> {
    let mounts = read_mounts().unwrap_or_else(|e| {
        log::warn!("failed to read mount table: {}", e);
        Vec::new()
    });

    let mut devices = Vec::new();
    for entry in fs::read_dir("/sys/block")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();

        if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
            continue;
        }

        let size_sectors = read_sys_file(&name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let removable = read_sys_file(&name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);
        let model = read_sys_file(&name, "device/model").unwrap_or_default();
        let vendor = read_sys_file(&name, "device/vendor").unwrap_or_default();

        // A mount of the disk itself or of any of its partitions counts.
        // Partition names append a digit (sdb1) or a p-digit suffix
        // (mmcblk0p2, nvme0n1p1); requiring that avoids /dev/sda matching
        // /dev/sdaa.
        let dev_path = format!("/dev/{}", name);
        let mount_points: Vec<String> = mounts
            .iter()
            .filter(|(dev, _)| {
                dev.as_str() == dev_path
                    || dev.strip_prefix(&dev_path).is_some_and(|rest| {
                        rest.chars()
                            .next()
                            .is_some_and(|c| c.is_ascii_digit() || c == 'p')
                    })
            })
            .map(|(_, mp)| mp.clone())
            .collect();

        devices.push(Device {
            path: dev_path,
            size: size_sectors * 512,
            vendor,
            model,
            removable,
            mount_points,
        });
    }

    Ok(devices)
}
