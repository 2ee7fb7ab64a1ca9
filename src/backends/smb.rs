//! SMB drive client over an OS-resolved share path.
//!
//! The SMB wire protocol is delegated to the operating system: on Windows the
//! share is addressed as a UNC path, elsewhere `host` may name a local mount
//! point of the share (e.g. `/mnt/nas`). All operations go through `std::fs`
//! against that root, so the connectivity probe is a plain root listing.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::backends::{DriveClient, RemoteEntry, RemoteFileStat};
use crate::protocol::{DriveConfig, DriveKind};

pub struct SmbClient {
    root: PathBuf,
}

impl SmbClient {
    pub fn new(config: &DriveConfig) -> Result<Self, String> {
        let host = config.host.trim();
        if host.is_empty() {
            return Err(format!("smb drive '{}' has an empty host", config.id));
        }
        let root = if Self::is_local_root(host) {
            if config.share.trim().is_empty() {
                PathBuf::from(host)
            } else {
                Path::new(host).join(config.share.trim())
            }
        } else {
            if config.share.trim().is_empty() {
                return Err(format!("smb drive '{}' has an empty share", config.id));
            }
            PathBuf::from(format!(r"\\{}\{}", host, config.share.trim()))
        };
        Ok(Self { root })
    }

    fn is_local_root(host: &str) -> bool {
        host.starts_with('/') || host.starts_with("./") || host.get(1..3) == Some(":\\")
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let rel = path.trim_matches('/');
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    fn modified_unix_ms(metadata: &fs::Metadata) -> i64 {
        metadata
            .modified()
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0)
    }
}

impl DriveClient for SmbClient {
    fn kind(&self) -> DriveKind {
        DriveKind::Smb
    }

    fn probe(&self) -> Result<(), String> {
        fs::read_dir(&self.root)
            .map(|_| ())
            .map_err(|err| format!("smb probe failed for {}: {err}", self.root.display()))
    }

    fn stat(&self, path: &str) -> Result<RemoteFileStat, String> {
        let full = self.resolve(path);
        let metadata = fs::metadata(&full)
            .map_err(|err| format!("smb stat failed for {}: {err}", full.display()))?;
        Ok(RemoteFileStat {
            size: metadata.len(),
            modified: Self::modified_unix_ms(&metadata),
            is_dir: metadata.is_dir(),
        })
    }

    fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, String> {
        let full = self.resolve(path);
        let rel_parent = path.trim_matches('/');
        let entries = fs::read_dir(&full)
            .map_err(|err| format!("smb readdir failed for {}: {err}", full.display()))?;

        let mut listing = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| format!("smb readdir entry failed in {path}: {err}"))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    log::debug!("smb readdir: skipping {name}: {err}");
                    continue;
                }
            };
            listing.push(RemoteEntry {
                path: crate::backends::join_rel_path(rel_parent, &name),
                name,
                is_dir: metadata.is_dir(),
                size: metadata.len(),
                modified: Self::modified_unix_ms(&metadata),
            });
        }
        listing.sort_unstable_by(|left, right| left.name.cmp(&right.name));
        Ok(listing)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, String> {
        let full = self.resolve(path);
        fs::read(&full).map_err(|err| format!("smb read failed for {}: {err}", full.display()))
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<(), String> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|err| {
                    format!("smb write failed creating {}: {err}", parent.display())
                })?;
            }
        }
        fs::write(&full, data)
            .map_err(|err| format!("smb write failed for {}: {err}", full.display()))
    }

    fn exists(&self, path: &str) -> Result<bool, String> {
        Ok(self.resolve(path).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config(root: &Path) -> DriveConfig {
        DriveConfig {
            id: "nas".to_string(),
            kind: DriveKind::Smb,
            host: root.to_string_lossy().to_string(),
            share: String::new(),
            username: String::new(),
            password: String::new(),
            domain: None,
            display_name: "NAS".to_string(),
        }
    }

    #[test]
    fn test_probe_and_listing_against_share_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("albums")).expect("mkdir");
        fs::write(dir.path().join("track.mp3"), b"data").expect("write");

        let client = SmbClient::new(&local_config(dir.path())).expect("client");
        client.probe().expect("probe");

        let entries = client.read_dir("/").expect("readdir");
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["albums", "track.mp3"]);
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].size, 4);
        assert_eq!(entries[1].path, "track.mp3");
    }

    #[test]
    fn test_read_write_stat_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = SmbClient::new(&local_config(dir.path())).expect("client");

        client
            .write_file("albums/new.mp3", b"payload")
            .expect("write");
        let bytes = client.read_file("albums/new.mp3").expect("read");
        assert_eq!(bytes, b"payload");

        let stat = client.stat("albums/new.mp3").expect("stat");
        assert_eq!(stat.size, 7);
        assert!(!stat.is_dir);
        assert!(stat.modified > 0);

        assert_eq!(client.exists("albums/new.mp3"), Ok(true));
        assert_eq!(client.exists("albums/missing.mp3"), Ok(false));
    }

    #[test]
    fn test_probe_fails_for_missing_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("gone");
        let client = SmbClient::new(&local_config(&missing)).expect("client");
        assert!(client.probe().is_err());
    }

    #[test]
    fn test_empty_host_rejected() {
        let mut config = local_config(Path::new("/tmp"));
        config.host = "  ".to_string();
        assert!(SmbClient::new(&config).is_err());
    }
}
