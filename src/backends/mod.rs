//! Drive client abstractions and concrete backend implementations.

pub mod smb;
pub mod webdav;

use std::sync::Arc;

use crate::protocol::{DriveConfig, DriveKind};

/// One directory-listing entry as returned by a backend.
///
/// `name` and `path` are the exact strings the server produced; for WebDAV
/// they may or may not be percent-encoded and the adapter layer reconciles
/// that, never the client.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    /// Last path segment, server form.
    pub name: String,
    /// Path relative to the drive root, server form.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Unix milliseconds; 0 when the backend does not report one.
    pub modified: i64,
}

/// Stat result for one remote path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFileStat {
    pub size: u64,
    /// Unix milliseconds; 0 when the backend does not report one.
    pub modified: i64,
    pub is_dir: bool,
}

/// Live connection to one remote drive.
///
/// Implementations are shared across threads behind an `Arc` and must not
/// hold per-call mutable state.
pub trait DriveClient: Send + Sync {
    fn kind(&self) -> DriveKind;
    /// Protocol-specific connectivity probe, used at mount time and by the
    /// periodic monitor.
    fn probe(&self) -> Result<(), String>;
    fn stat(&self, path: &str) -> Result<RemoteFileStat, String>;
    fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, String>;
    fn read_file(&self, path: &str) -> Result<Vec<u8>, String>;
    fn write_file(&self, path: &str, data: &[u8]) -> Result<(), String>;
    fn exists(&self, path: &str) -> Result<bool, String>;
}

/// Construction-time injection point for backend clients.
///
/// Tests substitute a fake factory; production wires [`DefaultClientFactory`].
pub trait DriveClientFactory: Send + Sync {
    fn create(&self, config: &DriveConfig) -> Result<Arc<dyn DriveClient>, String>;
}

/// Factory producing the bundled SMB and WebDAV clients.
pub struct DefaultClientFactory;

impl DriveClientFactory for DefaultClientFactory {
    fn create(&self, config: &DriveConfig) -> Result<Arc<dyn DriveClient>, String> {
        match config.kind {
            DriveKind::Smb => Ok(Arc::new(smb::SmbClient::new(config)?)),
            DriveKind::Webdav => Ok(Arc::new(webdav::WebdavClient::new(config)?)),
        }
    }
}

/// Joins two relative path fragments without duplicating separators.
pub fn join_rel_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_matches('/');
    let name = name.trim_start_matches('/');
    if parent.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        parent.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_rel_path_shapes() {
        assert_eq!(join_rel_path("", "a.mp3"), "a.mp3");
        assert_eq!(join_rel_path("/", "a.mp3"), "a.mp3");
        assert_eq!(join_rel_path("albums", "a.mp3"), "albums/a.mp3");
        assert_eq!(join_rel_path("albums/", "/a.mp3"), "albums/a.mp3");
        assert_eq!(join_rel_path("albums/2021", ""), "albums/2021");
    }
}
