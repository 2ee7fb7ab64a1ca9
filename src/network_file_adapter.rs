//! `network://` path access layer over mounted drives.
//!
//! Callers address remote files as `network://<driveId>/<path>` with
//! human-readable (percent-decoded) segments. WebDAV servers may list the
//! same names percent-encoded; this adapter reconciles the two forms,
//! remembers display-to-server path mappings per drive, and retries
//! transient I/O failures with linear backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::backends::{join_rel_path, webdav, DriveClient, RemoteFileStat};
use crate::config::NetworkConfig;
use crate::network_drive_manager::NetworkDriveManager;
use crate::protocol::DriveKind;

pub const NETWORK_PATH_PREFIX: &str = "network://";

/// One directory entry in display form.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkEntry {
    /// Display (percent-decoded) segment name.
    pub name: String,
    /// Full `network://` URI in display form.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Unix milliseconds; 0 when the backend does not report one.
    pub modified: i64,
}

pub struct NetworkFileAdapter {
    drive_manager: Arc<NetworkDriveManager>,
    retry_attempts: u32,
    retry_backoff_ms: u64,
    /// Per drive: display-form relative path -> server-form relative path.
    path_mappings: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl NetworkFileAdapter {
    pub fn new(drive_manager: Arc<NetworkDriveManager>, network_config: &NetworkConfig) -> Self {
        Self {
            drive_manager,
            retry_attempts: network_config.io_retry_attempts.max(1),
            retry_backoff_ms: network_config.io_retry_backoff_ms,
            path_mappings: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_network_path(path: &str) -> bool {
        path.starts_with(NETWORK_PATH_PREFIX)
    }

    /// Splits a `network://<driveId>/<path>` URI into drive id and relative
    /// path. The relative path may be empty (drive root).
    pub fn parse_network_path(path: &str) -> Result<(String, String), String> {
        let rest = path
            .strip_prefix(NETWORK_PATH_PREFIX)
            .ok_or_else(|| format!("not a network path: '{path}'"))?;
        let (drive_id, rel) = match rest.split_once('/') {
            Some((drive_id, rel)) => (drive_id, rel),
            None => (rest, ""),
        };
        if drive_id.is_empty() {
            return Err(format!("network path '{path}' has an empty drive id"));
        }
        Ok((drive_id.to_string(), rel.trim_matches('/').to_string()))
    }

    fn lock_mappings(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, String>>> {
        match self.path_mappings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record_mapping(&self, drive_id: &str, display_rel: &str, server_rel: &str) {
        if display_rel == server_rel {
            return;
        }
        debug!("path mapping for '{drive_id}': '{display_rel}' -> '{server_rel}'");
        self.lock_mappings()
            .entry(drive_id.to_string())
            .or_default()
            .insert(display_rel.to_string(), server_rel.to_string());
    }

    /// Resolves a display-form relative path to the server form: exact
    /// mapping first, then the longest mapped ancestor, else unchanged.
    fn server_path_for(&self, drive_id: &str, display_rel: &str) -> String {
        let mappings = self.lock_mappings();
        let Some(drive_mappings) = mappings.get(drive_id) else {
            return display_rel.to_string();
        };
        if let Some(server_rel) = drive_mappings.get(display_rel) {
            return server_rel.clone();
        }
        let mut best: Option<(&String, &String)> = None;
        for (display_prefix, server_prefix) in drive_mappings {
            if display_rel.starts_with(display_prefix.as_str())
                && display_rel.as_bytes().get(display_prefix.len()) == Some(&b'/')
            {
                let longer = best
                    .map(|(current, _)| display_prefix.len() > current.len())
                    .unwrap_or(true);
                if longer {
                    best = Some((display_prefix, server_prefix));
                }
            }
        }
        match best {
            Some((display_prefix, server_prefix)) => {
                format!("{server_prefix}{}", &display_rel[display_prefix.len()..])
            }
            None => display_rel.to_string(),
        }
    }

    /// The other percent-encoding form of a server path, when one exists:
    /// decoded if the path looks server-encoded, encoded otherwise.
    fn alternate_encoding(server_rel: &str) -> Option<String> {
        let alternate: String = server_rel
            .split('/')
            .map(|segment| {
                if webdav::is_server_encoded(segment) {
                    decode_segment(segment)
                } else {
                    urlencoding::encode(segment).into_owned()
                }
            })
            .collect::<Vec<String>>()
            .join("/");
        if alternate == server_rel {
            None
        } else {
            Some(alternate)
        }
    }

    /// Shared retry driver for single-path operations. After the first
    /// failure the alternate-encoded form of the path is tried once; remaining
    /// attempts back off linearly and the final error carries the last cause.
    fn run_io<T>(
        &self,
        network_path: &str,
        verb: &str,
        op: impl Fn(&Arc<dyn DriveClient>, &str) -> Result<T, String>,
    ) -> Result<T, String> {
        let (drive_id, display_rel) = Self::parse_network_path(network_path)?;
        let client = self.drive_manager.ensure_drive_mounted(&drive_id)?;
        let server_rel = self.server_path_for(&drive_id, &display_rel);

        let mut tried_alternate = false;
        let mut last_error = String::new();
        for attempt in 1..=self.retry_attempts {
            match op(&client, &server_rel) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    debug!("network {verb} attempt {attempt} failed for '{network_path}': {err}");
                    last_error = err;
                }
            }
            if !tried_alternate && client.kind() == DriveKind::Webdav {
                tried_alternate = true;
                if let Some(alternate) = Self::alternate_encoding(&server_rel) {
                    if let Ok(value) = op(&client, &alternate) {
                        self.record_mapping(&drive_id, &display_rel, &alternate);
                        return Ok(value);
                    }
                }
            }
            if attempt < self.retry_attempts {
                thread::sleep(Duration::from_millis(
                    u64::from(attempt) * self.retry_backoff_ms,
                ));
            }
        }
        Err(format!(
            "network {verb} failed for '{network_path}' after {} attempt(s): {last_error}",
            self.retry_attempts
        ))
    }

    pub fn stat(&self, network_path: &str) -> Result<RemoteFileStat, String> {
        self.run_io(network_path, "stat", |client, path| client.stat(path))
    }

    pub fn read_file(&self, network_path: &str) -> Result<Vec<u8>, String> {
        self.run_io(network_path, "read", |client, path| client.read_file(path))
    }

    pub fn write_file(&self, network_path: &str, data: &[u8]) -> Result<(), String> {
        self.run_io(network_path, "write", |client, path| {
            client.write_file(path, data)
        })
    }

    /// Lists a directory, reconciling WebDAV percent-encoded names into
    /// display form and recording the mappings for later single-file access.
    pub fn read_dir(&self, network_path: &str) -> Result<Vec<NetworkEntry>, String> {
        let (drive_id, display_rel) = Self::parse_network_path(network_path)?;
        let client = self.drive_manager.ensure_drive_mounted(&drive_id)?;
        let entries = self.run_io(network_path, "readdir", |client, path| {
            client.read_dir(path)
        })?;

        let reconcile = client.kind() == DriveKind::Webdav;
        let mut listing = Vec::with_capacity(entries.len());
        for entry in entries {
            let display_name = if reconcile && webdav::is_server_encoded(&entry.name) {
                decode_segment(&entry.name)
            } else {
                entry.name.clone()
            };
            let display_path = join_rel_path(&display_rel, &display_name);
            if display_name != entry.name {
                self.record_mapping(&drive_id, &display_path, &entry.path);
            }
            listing.push(NetworkEntry {
                path: format!("{NETWORK_PATH_PREFIX}{drive_id}/{display_path}"),
                name: display_name,
                is_dir: entry.is_dir,
                size: entry.size,
                modified: entry.modified,
            });
        }
        Ok(listing)
    }

    /// Existence check that survives stale path mappings: a failed or
    /// negative probe triggers a parent-listing rebuild and one retry.
    ///
    /// `Ok(false)` means the backend answered and the path is absent. An
    /// unreachable backend is an `Err`: a stale mapping is a recoverable
    /// false negative, but no answer at all must never read as "gone".
    pub fn exists(&self, network_path: &str) -> Result<bool, String> {
        let (drive_id, display_rel) = Self::parse_network_path(network_path)?;
        let client = self.drive_manager.ensure_drive_mounted(&drive_id)?;

        let server_rel = self.server_path_for(&drive_id, &display_rel);
        match client.exists(&server_rel) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => debug!("exists probe failed for '{network_path}': {err}"),
        }

        self.rebuild_path_mapping(&drive_id, parent_of(&display_rel), &client)?;
        let server_rel = self.server_path_for(&drive_id, &display_rel);
        client.exists(&server_rel)
    }

    /// Relists a directory and refreshes its display-to-server mappings.
    fn rebuild_path_mapping(
        &self,
        drive_id: &str,
        display_parent: &str,
        client: &Arc<dyn DriveClient>,
    ) -> Result<(), String> {
        let server_parent = self.server_path_for(drive_id, display_parent);
        let entries = client.read_dir(&server_parent)?;
        if client.kind() != DriveKind::Webdav {
            return Ok(());
        }
        for entry in entries {
            if webdav::is_server_encoded(&entry.name) {
                let display_name = decode_segment(&entry.name);
                if display_name != entry.name {
                    let display_path = join_rel_path(display_parent, &display_name);
                    self.record_mapping(drive_id, &display_path, &entry.path);
                }
            }
        }
        Ok(())
    }
}

fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

fn parent_of(rel: &str) -> &str {
    match rel.rfind('/') {
        Some(index) => &rel[..index],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{DriveClientFactory, RemoteEntry};
    use crate::drive_registry::DriveRegistry;
    use crate::protocol::{DriveConfig, Message};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    /// In-memory drive keyed by server-form relative paths.
    struct FakeClient {
        kind: DriveKind,
        files: Mutex<BTreeMap<String, Vec<u8>>>,
        /// Number of upcoming calls that should fail.
        fail_next: Arc<AtomicUsize>,
        call_count: Arc<AtomicUsize>,
    }

    impl FakeClient {
        fn gate(&self) -> Result<(), String> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                Err("injected transient failure".to_string())
            } else {
                Ok(())
            }
        }
    }

    impl DriveClient for FakeClient {
        fn kind(&self) -> DriveKind {
            self.kind
        }

        fn probe(&self) -> Result<(), String> {
            Ok(())
        }

        fn stat(&self, path: &str) -> Result<RemoteFileStat, String> {
            self.gate()?;
            let files = self.files.lock().expect("lock");
            let data = files
                .get(path)
                .ok_or_else(|| format!("no such file: {path}"))?;
            Ok(RemoteFileStat {
                size: data.len() as u64,
                modified: 1_700_000_000_000,
                is_dir: false,
            })
        }

        fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, String> {
            self.gate()?;
            let prefix = if path.is_empty() {
                String::new()
            } else {
                format!("{path}/")
            };
            let files = self.files.lock().expect("lock");
            Ok(files
                .iter()
                .filter(|(file_path, _)| {
                    file_path.starts_with(&prefix) && !file_path[prefix.len()..].contains('/')
                })
                .map(|(file_path, data)| RemoteEntry {
                    name: file_path[prefix.len()..].to_string(),
                    path: file_path.clone(),
                    is_dir: false,
                    size: data.len() as u64,
                    modified: 1_700_000_000_000,
                })
                .collect())
        }

        fn read_file(&self, path: &str) -> Result<Vec<u8>, String> {
            self.gate()?;
            let files = self.files.lock().expect("lock");
            files
                .get(path)
                .cloned()
                .ok_or_else(|| format!("no such file: {path}"))
        }

        fn write_file(&self, path: &str, data: &[u8]) -> Result<(), String> {
            self.gate()?;
            self.files
                .lock()
                .expect("lock")
                .insert(path.to_string(), data.to_vec());
            Ok(())
        }

        fn exists(&self, path: &str) -> Result<bool, String> {
            self.gate()?;
            Ok(self.files.lock().expect("lock").contains_key(path))
        }
    }

    struct FakeFactory {
        kind: DriveKind,
        seed: Vec<(String, Vec<u8>)>,
        fail_next: Arc<AtomicUsize>,
        call_count: Arc<AtomicUsize>,
    }

    impl DriveClientFactory for FakeFactory {
        fn create(&self, _config: &DriveConfig) -> Result<Arc<dyn DriveClient>, String> {
            Ok(Arc::new(FakeClient {
                kind: self.kind,
                files: Mutex::new(self.seed.iter().cloned().collect()),
                fail_next: self.fail_next.clone(),
                call_count: self.call_count.clone(),
            }))
        }
    }

    struct Harness {
        adapter: NetworkFileAdapter,
        fail_next: Arc<AtomicUsize>,
        call_count: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    fn harness(kind: DriveKind, seed: Vec<(&str, &[u8])>) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let (bus_sender, _) = broadcast::channel::<Message>(512);
        let fail_next = Arc::new(AtomicUsize::new(0));
        let call_count = Arc::new(AtomicUsize::new(0));
        let factory = FakeFactory {
            kind,
            seed: seed
                .into_iter()
                .map(|(path, data)| (path.to_string(), data.to_vec()))
                .collect(),
            fail_next: fail_next.clone(),
            call_count: call_count.clone(),
        };
        let registry = DriveRegistry::open(dir.path().join("drive-registry.json"));
        let manager = Arc::new(NetworkDriveManager::new(
            bus_sender,
            Arc::new(factory),
            registry,
            dir.path().join("network-drives-state.json"),
            NetworkConfig::default(),
        ));
        manager
            .mount(DriveConfig {
                id: "nas".to_string(),
                kind,
                host: "https://nas.local/dav".to_string(),
                share: String::new(),
                username: String::new(),
                password: String::new(),
                domain: None,
                display_name: "NAS".to_string(),
            })
            .expect("mount");

        let mut network_config = NetworkConfig::default();
        network_config.io_retry_backoff_ms = 1;
        Harness {
            adapter: NetworkFileAdapter::new(manager, &network_config),
            fail_next,
            call_count,
            _dir: dir,
        }
    }

    #[test]
    fn test_parse_network_path_shapes() {
        assert_eq!(
            NetworkFileAdapter::parse_network_path("network://nas/albums/track.mp3"),
            Ok(("nas".to_string(), "albums/track.mp3".to_string()))
        );
        assert_eq!(
            NetworkFileAdapter::parse_network_path("network://nas"),
            Ok(("nas".to_string(), String::new()))
        );
        assert_eq!(
            NetworkFileAdapter::parse_network_path("network://nas/"),
            Ok(("nas".to_string(), String::new()))
        );
        assert!(NetworkFileAdapter::parse_network_path("/local/file.mp3").is_err());
        assert!(NetworkFileAdapter::parse_network_path("network:///file.mp3").is_err());
    }

    #[test]
    fn test_read_and_write_round_trip() {
        let harness = harness(DriveKind::Smb, vec![("albums/track.mp3", b"abc")]);
        let bytes = harness
            .adapter
            .read_file("network://nas/albums/track.mp3")
            .expect("read");
        assert_eq!(bytes, b"abc");

        harness
            .adapter
            .write_file("network://nas/albums/copy.mp3", b"xyz")
            .expect("write");
        assert_eq!(
            harness
                .adapter
                .read_file("network://nas/albums/copy.mp3")
                .expect("read back"),
            b"xyz"
        );
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let harness = harness(DriveKind::Smb, vec![("track.mp3", b"abc")]);
        harness.fail_next.store(2, Ordering::SeqCst);
        let bytes = harness
            .adapter
            .read_file("network://nas/track.mp3")
            .expect("read survives two failures");
        assert_eq!(bytes, b"abc");
    }

    #[test]
    fn test_exhausted_retries_report_last_cause() {
        let harness = harness(DriveKind::Smb, vec![("track.mp3", b"abc")]);
        harness.fail_next.store(100, Ordering::SeqCst);
        let error = harness
            .adapter
            .read_file("network://nas/track.mp3")
            .err()
            .expect("should fail");
        assert!(error.contains("after 3 attempt(s)"));
        assert!(error.contains("injected transient failure"));
    }

    #[test]
    fn test_readdir_decodes_webdav_names_and_records_mappings() {
        let harness = harness(
            DriveKind::Webdav,
            vec![
                ("albums/My%20Song.mp3", b"encoded"),
                ("albums/plain.mp3", b"plain"),
            ],
        );
        let entries = harness
            .adapter
            .read_dir("network://nas/albums")
            .expect("readdir");
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["My Song.mp3", "plain.mp3"]);
        assert_eq!(entries[0].path, "network://nas/albums/My Song.mp3");

        // The display path now resolves to the server-encoded file.
        let bytes = harness
            .adapter
            .read_file("network://nas/albums/My Song.mp3")
            .expect("read via display path");
        assert_eq!(bytes, b"encoded");
    }

    #[test]
    fn test_alternate_encoding_fallback_without_prior_listing() {
        // No readdir happened, so no mapping exists; the first stat attempt
        // misses and the encoded alternate hits.
        let harness = harness(DriveKind::Webdav, vec![("My%20Song.mp3", b"abc")]);
        let stat = harness
            .adapter
            .stat("network://nas/My Song.mp3")
            .expect("stat via alternate encoding");
        assert_eq!(stat.size, 3);
    }

    #[test]
    fn test_exists_rebuilds_stale_mapping() {
        let harness = harness(DriveKind::Webdav, vec![("albums/My%20Song.mp3", b"abc")]);
        // Poison the mapping so the first probe looks at the wrong name.
        harness
            .adapter
            .record_mapping("nas", "albums/My Song.mp3", "albums/Wrong%20Name.mp3");
        assert_eq!(
            harness.adapter.exists("network://nas/albums/My Song.mp3"),
            Ok(true)
        );
        assert_eq!(
            harness.adapter.exists("network://nas/albums/gone.mp3"),
            Ok(false)
        );
    }

    #[test]
    fn test_exists_on_unreachable_backend_is_an_error() {
        // Every backend call fails, including the mapping rebuild. That is
        // "cannot check", not "absent", and must surface as an error.
        let harness = harness(DriveKind::Webdav, vec![("albums/track.mp3", b"abc")]);
        harness.fail_next.store(100, Ordering::SeqCst);
        let result = harness.adapter.exists("network://nas/albums/track.mp3");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_drive_is_not_mounted_error() {
        let harness = harness(DriveKind::Smb, vec![]);
        let error = harness
            .adapter
            .read_file("network://ghost/track.mp3")
            .err()
            .expect("should fail");
        assert!(error.contains("not mounted"));
        // No backend call was made for the unknown drive.
        let calls_before = harness.call_count.load(Ordering::SeqCst);
        let _ = harness.adapter.read_file("network://ghost/track.mp3");
        assert_eq!(harness.call_count.load(Ordering::SeqCst), calls_before);
    }
}
