use std::ffi::c_void;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::windows::io::{AsRawHandle, FromRawHandle};
use std::path::Path;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_INVALID_FUNCTION, ERROR_NO_MORE_FILES,
    GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE, MAX_PATH,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FindFirstVolumeW, FindNextVolumeW, FindVolumeClose,
    GetVolumePathNamesForVolumeNameW, FILE_FLAG_WRITE_THROUGH, FILE_SHARE_READ, FILE_SHARE_WRITE,
    OPEN_EXISTING,
};
use windows_sys::Win32::System::Ioctl::{
    PropertyStandardQuery, StorageDeviceProperty, DISK_GEOMETRY_EX, FSCTL_DISMOUNT_VOLUME,
    FSCTL_LOCK_VOLUME, FSCTL_UNLOCK_VOLUME, IOCTL_DISK_GET_DRIVE_GEOMETRY_EX,
    IOCTL_STORAGE_EJECT_MEDIA, IOCTL_STORAGE_GET_DEVICE_NUMBER, IOCTL_STORAGE_MEDIA_REMOVAL,
    IOCTL_STORAGE_QUERY_PROPERTY, PREVENT_MEDIA_REMOVAL, STORAGE_DEVICE_DESCRIPTOR,
    STORAGE_DEVICE_NUMBER, STORAGE_PROPERTY_QUERY,
};
use windows_sys::Win32::System::IO::DeviceIoControl;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::platform::DeviceIo;

/// `PhysicalDriveN` and `\\.\PhysicalDriveN` are both accepted; comparison
/// happens on the upper-cased bare form.
pub(super) fn normalize_device_path(path: &str) -> String {
    path.trim_start_matches(r"\\.\").to_uppercase()
}

/// The raw-access form, `\\.\PhysicalDriveN`.
fn physical_path(path: &str) -> String {
    if path.to_uppercase().starts_with("PHYSICALDRIVE") {
        format!(r"\\.\{}", path)
    } else {
        path.to_string()
    }
}

fn device_number_from_path(path: &str) -> Result<u32> {
    let bare = normalize_device_path(path);
    let digits = bare.trim_start_matches("PHYSICALDRIVE");
    digits.parse::<u32>().map_err(|_| {
        Error::DeviceOpen {
            path: path.into(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a physical drive path: {}", path),
            ),
        }
    })
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { GetLastError() } as i32)
}

fn ioctl(
    handle: HANDLE,
    code: u32,
    input: Option<(*const c_void, u32)>,
    output: Option<(*mut c_void, u32)>,
) -> io::Result<()> {
    let (in_ptr, in_len) = input.unwrap_or((std::ptr::null(), 0));
    let (out_ptr, out_len) = output.unwrap_or((std::ptr::null_mut(), 0));
    let mut returned = 0u32;
    let ok = unsafe {
        DeviceIoControl(
            handle,
            code,
            in_ptr,
            in_len,
            out_ptr,
            out_len,
            &mut returned,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(last_error());
    }
    Ok(())
}

/// A locked (and usually dismounted) volume. The kernel honors the lock only
/// while the handle stays open, so the device object owns these for its
/// whole lifetime; drop unlocks and closes, best-effort.
struct VolumeLock {
    handle: HANDLE,
}

impl Drop for VolumeLock {
    fn drop(&mut self) {
        let _ = ioctl(self.handle, FSCTL_UNLOCK_VOLUME, None, None);
        unsafe { CloseHandle(self.handle) };
    }
}

// Declaration order matters: the physical-device file closes before the
// volume locks are released.
struct WindowsDevice {
    file: File,
    _volumes: Vec<VolumeLock>,
}

impl Read for WindowsDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for WindowsDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for WindowsDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl DeviceIo for WindowsDevice {
    fn sync_data(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn raw_descriptor(&self) -> u64 {
        self.file.as_raw_handle() as u64
    }
}

fn open_raw(path: &str, access: u32, flags: u32) -> io::Result<HANDLE> {
    let handle = unsafe {
        CreateFileW(
            wide(path).as_ptr(),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_EXISTING,
            flags,
            std::ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(last_error());
    }
    Ok(handle)
}

/// Volume GUID paths (`\\?\Volume{...}`) whose storage device number matches
/// `device_number`, paired with their drive-letter mount points.
fn volumes_for_device(device_number: u32) -> io::Result<Vec<(String, Vec<String>)>> {
    let mut name_buf = [0u16; MAX_PATH as usize + 1];
    let find = unsafe { FindFirstVolumeW(name_buf.as_mut_ptr(), name_buf.len() as u32) };
    if find == INVALID_HANDLE_VALUE {
        return Err(last_error());
    }

    let mut volumes = Vec::new();
    loop {
        let len = name_buf.iter().position(|&c| c == 0).unwrap_or(0);
        let volume_name = String::from_utf16_lossy(&name_buf[..len]);

        if volume_belongs_to_device(&volume_name, device_number) {
            let mounts = volume_mount_points(&volume_name);
            volumes.push((volume_name.trim_end_matches('\\').to_string(), mounts));
        }

        let more = unsafe { FindNextVolumeW(find, name_buf.as_mut_ptr(), name_buf.len() as u32) };
        if more == 0 {
            let err = unsafe { GetLastError() };
            unsafe { FindVolumeClose(find) };
            if err == ERROR_NO_MORE_FILES {
                break;
            }
            return Err(io::Error::from_raw_os_error(err as i32));
        }
    }

    Ok(volumes)
}

fn volume_belongs_to_device(volume_name: &str, device_number: u32) -> bool {
    let path = volume_name.trim_end_matches('\\');
    let Ok(handle) = open_raw(path, 0, 0) else {
        return false;
    };

    let mut number = STORAGE_DEVICE_NUMBER {
        DeviceType: 0,
        DeviceNumber: 0,
        PartitionNumber: 0,
    };
    let matched = ioctl(
        handle,
        IOCTL_STORAGE_GET_DEVICE_NUMBER,
        None,
        Some((
            &mut number as *mut _ as *mut c_void,
            std::mem::size_of::<STORAGE_DEVICE_NUMBER>() as u32,
        )),
    )
    .map(|_| number.DeviceNumber == device_number)
    .unwrap_or(false);

    unsafe { CloseHandle(handle) };
    matched
}

/// Drive letters (or mount folders) of one volume, from the REG_MULTI_SZ
/// style buffer `GetVolumePathNamesForVolumeNameW` fills.
fn volume_mount_points(volume_name: &str) -> Vec<String> {
    let mut buf = [0u16; 1024];
    let mut returned = 0u32;
    let ok = unsafe {
        GetVolumePathNamesForVolumeNameW(
            wide(volume_name).as_ptr(),
            buf.as_mut_ptr(),
            buf.len() as u32,
            &mut returned,
        )
    };
    if ok == 0 {
        return Vec::new();
    }

    let mut paths = Vec::new();
    let mut start = 0usize;
    while start < buf.len() && buf[start] != 0 {
        let end = buf[start..]
            .iter()
            .position(|&c| c == 0)
            .map(|p| start + p)
            .unwrap_or(buf.len());
        let path = String::from_utf16_lossy(&buf[start..end]);
        let trimmed = path.trim_end_matches('\\');
        if !trimmed.is_empty() {
            paths.push(trimmed.to_string());
        }
        start = end + 1;
    }
    paths
}

/// Lock and dismount one volume. Lock failure is fatal; a failed dismount
/// leaves the volume locked, which is still safe.
fn lock_and_dismount(volume_path: &str) -> Result<VolumeLock> {
    let handle = open_raw(volume_path, GENERIC_READ | GENERIC_WRITE, 0).map_err(|source| {
        Error::VolumeLock {
            volume: volume_path.to_string(),
            source,
        }
    })?;

    if let Err(source) = ioctl(handle, FSCTL_LOCK_VOLUME, None, None) {
        unsafe { CloseHandle(handle) };
        return Err(Error::VolumeLock {
            volume: volume_path.to_string(),
            source,
        });
    }

    if let Err(e) = ioctl(handle, FSCTL_DISMOUNT_VOLUME, None, None) {
        log::warn!("failed to dismount volume {}: {}", volume_path, e);
    }

    Ok(VolumeLock { handle })
}

/// Lock and dismount every volume on the drive, open the physical device
/// with write-through semantics, and keep the volume handles alive alongside
/// the device handle.
pub(super) fn open_device(path: &Path) -> Result<Box<dyn DeviceIo>> {
    let path_str = path.to_string_lossy();
    let raw_path = physical_path(&path_str);
    let device_number = device_number_from_path(&path_str)?;

    let mut volumes = Vec::new();
    match volumes_for_device(device_number) {
        Ok(found) => {
            for (volume_name, _) in found {
                volumes.push(lock_and_dismount(&volume_name)?);
            }
        }
        Err(e) => log::warn!("failed to enumerate volumes of {}: {}", raw_path, e),
    }

    let handle = open_raw(
        &raw_path,
        GENERIC_READ | GENERIC_WRITE,
        FILE_FLAG_WRITE_THROUGH,
    )
    .map_err(|source| Error::DeviceOpen {
        path: path.to_path_buf(),
        source,
    })?;

    let file = unsafe { File::from_raw_handle(handle as *mut c_void) };
    Ok(Box::new(WindowsDevice {
        file,
        _volumes: volumes,
    }))
}

/// Volume locking happens in `open_device` so the locks span the whole
/// write; nothing to do beforehand.
pub(super) fn prepare_device(_path: &Path) -> Result<()> {
    Ok(())
}

pub(super) fn eject_device(path: &Path) -> Result<()> {
    let path_str = path.to_string_lossy();
    let raw_path = physical_path(&path_str);
    let device_number = device_number_from_path(&path_str)?;

    // Dismount whatever volumes are still live; each lock is released
    // immediately, we only need the filesystems flushed out of the way.
    match volumes_for_device(device_number) {
        Ok(volumes) => {
            for (volume_name, _) in volumes {
                match lock_and_dismount(&volume_name) {
                    Ok(lock) => drop(lock),
                    Err(e) => log::warn!("{}", e),
                }
            }
        }
        Err(e) => log::warn!("failed to enumerate volumes of {}: {}", raw_path, e),
    }

    let handle = open_raw(&raw_path, GENERIC_READ | GENERIC_WRITE, 0).map_err(|source| {
        Error::DeviceOpen {
            path: path.to_path_buf(),
            source,
        }
    })?;

    // Clear the media-removal lock, then push the media out.
    let prevent = PREVENT_MEDIA_REMOVAL {
        PreventMediaRemoval: 0,
    };
    if let Err(e) = ioctl(
        handle,
        IOCTL_STORAGE_MEDIA_REMOVAL,
        Some((
            &prevent as *const _ as *const c_void,
            std::mem::size_of::<PREVENT_MEDIA_REMOVAL>() as u32,
        )),
        None,
    ) {
        if e.raw_os_error() != Some(ERROR_INVALID_FUNCTION as i32) {
            log::warn!("failed to allow media removal: {}", e);
        }
    }

    let ejected = ioctl(handle, IOCTL_STORAGE_EJECT_MEDIA, None, None);
    unsafe { CloseHandle(handle) };

    match ejected {
        Ok(()) => Ok(()),
        // Fixed disks reject the eject control; treat that as done.
        Err(e) if e.raw_os_error() == Some(ERROR_INVALID_FUNCTION as i32) => Ok(()),
        Err(e) if e.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) => Err(Error::Io(
            io::Error::new(io::ErrorKind::PermissionDenied, "access denied: run as Administrator"),
        )),
        Err(e) => Err(Error::Io(e)),
    }
}

fn drive_size(handle: HANDLE) -> u64 {
    let mut buf = [0u8; 512];
    if ioctl(
        handle,
        IOCTL_DISK_GET_DRIVE_GEOMETRY_EX,
        None,
        Some((buf.as_mut_ptr() as *mut c_void, buf.len() as u32)),
    )
    .is_err()
    {
        return 0;
    }
    // The byte buffer carries no alignment guarantee for the struct.
    let geometry: DISK_GEOMETRY_EX =
        unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const DISK_GEOMETRY_EX) };
    geometry.DiskSize as u64
}

/// Vendor, product and removable flag from the storage property query.
fn drive_identity(handle: HANDLE) -> (String, String, bool) {
    let query = STORAGE_PROPERTY_QUERY {
        PropertyId: StorageDeviceProperty,
        QueryType: PropertyStandardQuery,
        AdditionalParameters: [0],
    };
    let mut buf = [0u8; 1024];
    if ioctl(
        handle,
        IOCTL_STORAGE_QUERY_PROPERTY,
        Some((
            &query as *const _ as *const c_void,
            std::mem::size_of::<STORAGE_PROPERTY_QUERY>() as u32,
        )),
        Some((buf.as_mut_ptr() as *mut c_void, buf.len() as u32)),
    )
    .is_err()
    {
        return (String::new(), String::new(), false);
    }

    let descriptor: STORAGE_DEVICE_DESCRIPTOR =
        unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const STORAGE_DEVICE_DESCRIPTOR) };
    let string_at = |offset: u32| -> String {
        if offset == 0 || offset as usize >= buf.len() {
            return String::new();
        }
        let tail = &buf[offset as usize..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        String::from_utf8_lossy(&tail[..end]).trim().to_string()
    };

    (
        string_at(descriptor.VendorIdOffset),
        string_at(descriptor.ProductIdOffset),
        descriptor.RemovableMedia != 0,
    )
}

/// Probe `\\.\PhysicalDrive0..63` and describe each one that answers.
pub(super) fn list_devices() -> Result<Vec<Device>> {
    let mut devices = Vec::new();

    for n in 0..64u32 {
        let raw_path = format!(r"\\.\PhysicalDrive{}", n);
        let Ok(handle) = open_raw(&raw_path, 0, 0) else {
            continue;
        };

        let size = drive_size(handle);
        let (vendor, model, removable) = drive_identity(handle);
        unsafe { CloseHandle(handle) };

        let mount_points = volumes_for_device(n)
            .map(|volumes| volumes.into_iter().flat_map(|(_, mounts)| mounts).collect())
            .unwrap_or_default();

        devices.push(Device {
            path: format!("PhysicalDrive{}", n),
            size,
            vendor,
            model,
            removable,
            mount_points,
        });
    }

    Ok(devices)
}
