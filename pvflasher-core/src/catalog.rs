//! The remote release catalog and the image download cache.
//!
//! The catalog is a JSON document mapping channel → version → release. A
//! release is either a bare list of device entries or an object wrapping the
//! list with a timestamp; both shapes occur in the wild and both decode.
//! Downloads stream to a temporary file while hashing, and only an intact
//! file is moved into the cache.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Where the official release index lives.
pub const RELEASES_URL: &str =
    "https://pantavisor-ci.s3.amazonaws.com/meta-pantavisor/releases.json";

const DOWNLOAD_ATTEMPTS: u32 = 3;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A downloadable artifact with its expected digest.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Artifact {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub sha256: String,
}

/// One flashable device entry of a release.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRelease {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_image: Artifact,
    #[serde(default)]
    pub pvrexports: Artifact,
    #[serde(default)]
    pub bsp: Artifact,
    #[serde(default)]
    pub sdk: Option<Artifact>,
}

/// A release is serialized either as a device list or as an object holding
/// one; the untagged enum accepts both.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Release {
    Devices(Vec<DeviceRelease>),
    Wrapped {
        #[serde(default)]
        devices: Vec<DeviceRelease>,
        #[serde(default)]
        timestamp: String,
    },
}

impl Release {
    /// Device entries, with unnamed placeholders filtered out.
    pub fn devices(&self) -> Vec<&DeviceRelease> {
        let list = match self {
            Release::Devices(list) => list,
            Release::Wrapped { devices, .. } => devices,
        };
        list.iter().filter(|d| !d.name.is_empty()).collect()
    }
}

/// channel → version → release. `BTreeMap` keeps channels sorted.
#[derive(Debug, Clone, Deserialize)]
pub struct Releases(pub BTreeMap<String, BTreeMap<String, Release>>);

impl Releases {
    pub fn channels(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    /// Versions of a channel, newest-looking first.
    pub fn versions(&self, channel: &str) -> Vec<&str> {
        let mut versions: Vec<&str> = self
            .0
            .get(channel)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        versions.sort_unstable_by(|a, b| b.cmp(a));
        versions
    }

    pub fn release(&self, channel: &str, version: &str) -> Option<&Release> {
        self.0.get(channel)?.get(version)
    }
}

/// Fetch and decode the release catalog.
pub fn fetch_releases() -> Result<Releases> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(transport_error(1))?;
    let response = client
        .get(RELEASES_URL)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(transport_error(1))?;
    let releases: Releases = response.json().map_err(transport_error(1))?;
    Ok(releases)
}

fn transport_error(attempts: u32) -> impl Fn(reqwest::Error) -> Error {
    move |e| Error::DownloadTransport {
        attempts,
        reason: e.to_string(),
    }
}

/// `<home>/.pvflasher/images`, created on demand.
pub fn cache_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        Error::Io(std::io::Error::other("cannot determine home directory"))
    })?;
    let dir = home.join(".pvflasher").join("images");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Cache location of a download: the URL's base name under the cache dir.
pub fn cached_image_path(url: &str) -> Result<PathBuf> {
    let base = url.rsplit('/').next().filter(|b| !b.is_empty()).ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cannot derive file name from url: {}", url),
        ))
    })?;
    Ok(cache_dir()?.join(base))
}

/// Whether the cached file exists and matches the expected SHA-256. With no
/// expected digest, bare existence is enough.
pub fn validate_cached_file(path: &Path, expected_sha256: &str) -> bool {
    if expected_sha256.is_empty() {
        return path.exists();
    }
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(_) => return false,
        }
    }
    hex::encode(hasher.finalize()) == expected_sha256
}

/// Progress of one download; `phase` is `downloading` or `validating`.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub phase: &'static str,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub percentage: f64,
    pub speed: f64,
}

/// Download `url` to `dest`, enforcing the SHA-256 when one is given.
///
/// Transport failures are retried up to three times with linear backoff; a
/// checksum mismatch is never retried, since re-fetching identical corrupt
/// content would only waste bandwidth.
pub fn download_with_sha<F>(
    url: &str,
    dest: &Path,
    expected_sha256: &str,
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(DownloadProgress),
{
    let mut last_err = None;
    for attempt in 1..=DOWNLOAD_ATTEMPTS {
        match download_once(url, dest, expected_sha256, &mut on_progress) {
            Ok(()) => return Ok(()),
            Err(e @ Error::DownloadChecksum { .. }) => return Err(e),
            Err(e) => {
                log::warn!("download attempt {} failed: {}", attempt, e);
                last_err = Some(e);
            }
        }
        if attempt < DOWNLOAD_ATTEMPTS {
            std::thread::sleep(Duration::from_secs(2 * attempt as u64));
        }
    }
    Err(Error::DownloadTransport {
        attempts: DOWNLOAD_ATTEMPTS,
        reason: last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".into()),
    })
}

fn download_once<F>(
    url: &str,
    dest: &Path,
    expected_sha256: &str,
    on_progress: &mut F,
) -> Result<()>
where
    F: FnMut(DownloadProgress),
{
    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(transport_error(1))?;
    let mut response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(transport_error(1))?;

    let total = response.content_length();
    let tmp_path = PathBuf::from(format!("{}.tmp", dest.display()));

    let result = (|| -> Result<()> {
        let mut out = File::create(&tmp_path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut downloaded: u64 = 0;
        let started = Instant::now();

        loop {
            let n = response.read(&mut buf).map_err(|e| Error::DownloadTransport {
                attempts: 1,
                reason: e.to_string(),
            })?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            hasher.update(&buf[..n]);
            downloaded += n as u64;

            let elapsed = started.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                downloaded as f64 / elapsed
            } else {
                0.0
            };
            let percentage = total
                .map(|t| downloaded as f64 / t as f64 * 100.0)
                .unwrap_or(0.0);
            on_progress(DownloadProgress {
                phase: "downloading",
                downloaded,
                total,
                percentage,
                speed,
            });
        }
        out.flush()?;

        if !expected_sha256.is_empty() {
            on_progress(DownloadProgress {
                phase: "validating",
                downloaded,
                total,
                percentage: 100.0,
                speed: 0.0,
            });
            let actual = hex::encode(hasher.finalize());
            if actual != expected_sha256 {
                return Err(Error::DownloadChecksum {
                    expected: expected_sha256.to_string(),
                    actual,
                });
            }
        }

        fs::rename(&tmp_path, dest)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn release_decodes_both_shapes() {
        let json = r#"
        {
            "stable": {
                "018": [
                    {"name": "rpi4", "full_image": {"url": "https://x/rpi4.img.gz", "sha256": "ab"}}
                ],
                "019": {
                    "timestamp": "2024-05-01T00:00:00Z",
                    "devices": [
                        {"name": "rpi4", "full_image": {"url": "https://x/rpi4.img.gz", "sha256": "cd"}},
                        {"name": "", "full_image": {"url": "", "sha256": ""}}
                    ]
                }
            },
            "develop": {}
        }
        "#;
        let releases: Releases = serde_json::from_str(json).unwrap();

        assert_eq!(releases.channels(), vec!["develop", "stable"]);
        assert_eq!(releases.versions("stable"), vec!["019", "018"]);

        let old = releases.release("stable", "018").unwrap();
        assert_eq!(old.devices().len(), 1);
        assert_eq!(old.devices()[0].full_image.sha256, "ab");

        // The wrapped shape decodes too, and empty names are filtered.
        let new = releases.release("stable", "019").unwrap();
        assert_eq!(new.devices().len(), 1);
        assert_eq!(new.devices()[0].full_image.sha256, "cd");
    }

    #[test]
    fn cached_file_validation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("image.img");
        fs::write(&path, b"payload").unwrap();

        let expected = hex::encode(Sha256::digest(b"payload"));
        assert!(validate_cached_file(&path, &expected));
        assert!(!validate_cached_file(&path, &"0".repeat(64)));
        // Without an expected digest, existence suffices.
        assert!(validate_cached_file(&path, ""));
        assert!(!validate_cached_file(&dir.path().join("missing"), ""));
    }

    #[test]
    fn url_base_name_is_cache_key() {
        let url = "https://releases.example.com/stable/018/rpi4.img.gz";
        assert_eq!(
            url.rsplit('/').next(),
            Some("rpi4.img.gz"),
            "base name extraction the cache path relies on"
        );
    }
}
