use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::Command;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::platform::DeviceIo;

pub(super) fn normalize_device_path(path: &str) -> String {
    path.to_string()
}

/// Holds the descriptor and its advisory lock; the lock is released on drop.
struct MacDevice {
    file: File,
}

impl Drop for MacDevice {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

impl Read for MacDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for MacDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for MacDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl DeviceIo for MacDevice {
    fn sync_data(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn raw_descriptor(&self) -> u64 {
        self.file.as_raw_fd() as u64
    }
}

/// Open read-write, disable per-file caching, then take a non-blocking
/// exclusive advisory lock.
pub(super) fn open_device(path: &Path) -> Result<Box<dyn DeviceIo>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| Error::DeviceOpen {
            path: path.to_path_buf(),
            source,
        })?;

    let fd = file.as_raw_fd();
    if unsafe { libc::fcntl(fd, libc::F_NOCACHE, 1) } == -1 {
        log::warn!(
            "failed to set F_NOCACHE on {}: {}",
            path.display(),
            io::Error::last_os_error()
        );
    }

    if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } == -1 {
        return Err(Error::DeviceOpen {
            path: path.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }

    Ok(Box::new(MacDevice { file }))
}

/// Dislodge auto-mounted volumes before the exclusive open.
pub(super) fn prepare_device(path: &Path) -> Result<()> {
    let status = Command::new("diskutil")
        .arg("unmountDisk")
        .arg(path)
        .status()?;
    if !status.success() {
        log::warn!("diskutil unmountDisk {} exited with {}", path.display(), status);
    }
    Ok(())
}

pub(super) fn eject_device(path: &Path) -> Result<()> {
    // A fresh unmount first; automount may have raced us since the copy.
    let _ = Command::new("diskutil")
        .arg("unmountDisk")
        .arg(path)
        .status();

    let status = Command::new("diskutil").arg("eject").arg(path).status()?;
    if !status.success() {
        return Err(Error::Io(io::Error::other(format!(
            "diskutil eject {} exited with {}",
            path.display(),
            status
        ))));
    }
    Ok(())
}

fn diskutil_plist(args: &[&str]) -> Result<String> {
    let output = Command::new("diskutil").args(args).output()?;
    if !output.status.success() {
        return Err(Error::Io(io::Error::other(format!(
            "diskutil {} exited with {}",
            args.join(" "),
            output.status
        ))));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// Plist extraction by string search. The documents diskutil emits are flat
// enough that scanning for `<key>` markers is reliable, and it keeps the
// dependency footprint down.

fn plist_value_after_key<'a>(doc: &'a str, key: &str) -> Option<&'a str> {
    let marker = format!("<key>{}</key>", key);
    let pos = doc.find(&marker)?;
    Some(doc[pos + marker.len()..].trim_start())
}

fn plist_string(doc: &str, key: &str) -> Option<String> {
    let rest = plist_value_after_key(doc, key)?;
    let rest = rest.strip_prefix("<string>")?;
    let end = rest.find("</string>")?;
    Some(rest[..end].trim().to_string())
}

fn plist_integer(doc: &str, key: &str) -> Option<u64> {
    let rest = plist_value_after_key(doc, key)?;
    let rest = rest.strip_prefix("<integer>")?;
    let end = rest.find("</integer>")?;
    rest[..end].trim().parse().ok()
}

fn plist_bool(doc: &str, key: &str) -> Option<bool> {
    let rest = plist_value_after_key(doc, key)?;
    if rest.starts_with("<true/>") {
        Some(true)
    } else if rest.starts_with("<false/>") {
        Some(false)
    } else {
        None
    }
}

/// The `AllDisks` identifiers from `diskutil list -plist`.
fn all_disks(doc: &str) -> Vec<String> {
    let Some(rest) = plist_value_after_key(doc, "AllDisks") else {
        return Vec::new();
    };
    let Some(array_end) = rest.find("</array>") else {
        return Vec::new();
    };
    let array = &rest[..array_end];

    let mut ids = Vec::new();
    let mut cursor = 0;
    while let Some(open) = array[cursor..].find("<string>") {
        let start = cursor + open + "<string>".len();
        let Some(close) = array[start..].find("</string>") else {
            break;
        };
        ids.push(array[start..start + close].trim().to_string());
        cursor = start + close;
    }
    ids
}

/// disk3 is a whole disk; disk3s1 is one of its slices.
fn is_whole_disk(id: &str) -> bool {
    match id.strip_prefix("disk") {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Enumerate via `diskutil list -plist`, then requery each whole-disk
/// identifier. Virtual devices and internal fixed disks are excluded; slice
/// mount points roll up to their disk.
pub(super) fn list_devices() -> Result<Vec<Device>> {
    let listing = diskutil_plist(&["list", "-plist"])?;
    let ids = all_disks(&listing);

    let mut devices = Vec::new();
    for id in ids.iter().filter(|id| is_whole_disk(id)) {
        let info = match diskutil_plist(&["info", "-plist", id]) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("diskutil info {} failed: {}", id, e);
                continue;
            }
        };

        if plist_string(&info, "VirtualOrPhysical").as_deref() != Some("Physical") {
            continue;
        }
        let removable = plist_bool(&info, "Removable").unwrap_or(false);
        let internal = plist_bool(&info, "Internal").unwrap_or(false);
        if internal && !removable {
            continue;
        }

        let mut mount_points = Vec::new();
        if let Some(mp) = plist_string(&info, "MountPoint").filter(|m| !m.is_empty()) {
            mount_points.push(mp);
        }

        let slice_prefix = format!("{}s", id);
        for slice in ids.iter().filter(|s| s.starts_with(&slice_prefix)) {
            if let Ok(slice_info) = diskutil_plist(&["info", "-plist", slice]) {
                if let Some(mp) =
                    plist_string(&slice_info, "MountPoint").filter(|m| !m.is_empty())
                {
                    mount_points.push(mp);
                }
            }
        }

        devices.push(Device {
            path: format!("/dev/{}", id),
            size: plist_integer(&info, "Size").or_else(|| plist_integer(&info, "TotalSize")).unwrap_or(0),
            vendor: String::new(),
            model: plist_string(&info, "MediaName").unwrap_or_default(),
            removable,
            mount_points,
        });
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_INFO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>DeviceIdentifier</key>
    <string>disk4</string>
    <key>Internal</key>
    <false/>
    <key>MediaName</key>
    <string> SanDisk Ultra </string>
    <key>MountPoint</key>
    <string>/Volumes/UNTITLED</string>
    <key>Removable</key>
    <true/>
    <key>Size</key>
    <integer>31914983424</integer>
    <key>VirtualOrPhysical</key>
    <string>Physical</string>
</dict>
</plist>
"#;

    #[test]
    fn plist_scalars_are_extracted() {
        assert_eq!(plist_integer(SAMPLE_INFO, "Size"), Some(31_914_983_424));
        assert_eq!(plist_bool(SAMPLE_INFO, "Removable"), Some(true));
        assert_eq!(plist_bool(SAMPLE_INFO, "Internal"), Some(false));
        assert_eq!(
            plist_string(SAMPLE_INFO, "MediaName").as_deref(),
            Some("SanDisk Ultra")
        );
        assert_eq!(plist_string(SAMPLE_INFO, "Missing"), None);
    }

    #[test]
    fn all_disks_array_is_extracted() {
        let doc = r#"<dict>
    <key>AllDisks</key>
    <array>
        <string>disk0</string>
        <string>disk0s1</string>
        <string>disk4</string>
        <string>disk4s1</string>
    </array>
</dict>"#;
        assert_eq!(all_disks(doc), vec!["disk0", "disk0s1", "disk4", "disk4s1"]);
    }

    #[test]
    fn whole_disk_identifiers() {
        assert!(is_whole_disk("disk0"));
        assert!(is_whole_disk("disk12"));
        assert!(!is_whole_disk("disk0s1"));
        assert!(!is_whole_disk("diskette"));
        assert!(!is_whole_disk("disk"));
    }
}
