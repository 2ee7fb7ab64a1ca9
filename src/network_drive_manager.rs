//! Network drive mounting and connection supervision.
//!
//! This manager owns the map of live backend clients, drives the per-drive
//! connection state machine (mount, monitor, bounded reconnect, terminal
//! failure), persists drive state across restarts, and mirrors every
//! transition onto the app bus.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::{Receiver, Sender};

use crate::backends::{DriveClient, DriveClientFactory};
use crate::config::NetworkConfig;
use crate::drive_registry::DriveRegistry;
use crate::persist;
use crate::protocol::{
    ConnectionStatus, DriveConfig, DriveConnectionState, DriveKind, DriveMessage, DriveStatusInfo,
    Message,
};

const MONITOR_IDLE_SLEEP: Duration = Duration::from_millis(200);

/// One live mounted drive; the client handle never leaves the
/// manager/adapter boundary except as an opaque trait object.
#[derive(Clone)]
pub struct MountedDrive {
    pub id: String,
    pub kind: DriveKind,
    pub config: DriveConfig,
    pub client: Arc<dyn DriveClient>,
    /// Unix milliseconds.
    pub mount_time: i64,
}

/// On-disk shape of `network-drives-state.json`.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct DriveStateFile {
    /// Unix milliseconds of the last save.
    timestamp: i64,
    drive_configs: Vec<(String, DriveConfig)>,
    mounted_drives: Vec<MountedDriveRecord>,
    connection_status: Vec<(String, ConnectionStatus)>,
}

/// Persisted intent that a drive was mounted; replayed at startup.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct MountedDriveRecord {
    id: String,
    #[serde(rename = "type")]
    kind: DriveKind,
    config: DriveConfig,
    /// Unix milliseconds.
    mount_time: i64,
}

#[derive(Default)]
struct DriveTables {
    /// In-memory config cache, consulted before the registry.
    configs: HashMap<String, DriveConfig>,
    mounted: HashMap<String, MountedDrive>,
    status: HashMap<String, ConnectionStatus>,
    states: HashMap<String, DriveConnectionState>,
    /// Mount-in-flight guard; at most one concurrent mount per drive id.
    remounting: HashSet<String>,
}

/// Orchestrates mounting, liveness, and recovery for all configured drives.
pub struct NetworkDriveManager {
    bus_producer: Sender<Message>,
    client_factory: Arc<dyn DriveClientFactory>,
    network_config: NetworkConfig,
    state_path: PathBuf,
    registry: Mutex<DriveRegistry>,
    drives: Mutex<DriveTables>,
}

impl NetworkDriveManager {
    pub fn new(
        bus_producer: Sender<Message>,
        client_factory: Arc<dyn DriveClientFactory>,
        registry: DriveRegistry,
        state_path: PathBuf,
        network_config: NetworkConfig,
    ) -> Self {
        Self {
            bus_producer,
            client_factory,
            network_config,
            state_path,
            registry: Mutex::new(registry),
            drives: Mutex::new(DriveTables::default()),
        }
    }

    fn lock_drives(&self) -> MutexGuard<'_, DriveTables> {
        match self.drives.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, DriveRegistry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, message: DriveMessage) {
        let _ = self.bus_producer.send(Message::Drive(message));
    }

    /// Mounts a drive: builds the backend client, probes connectivity, and
    /// on success registers the live handle, persists state, and emits
    /// `DriveConnected`. Failure retains no partial state.
    ///
    /// A second concurrent call for the same id observes the first attempt's
    /// outcome instead of starting a duplicate mount.
    pub fn mount(&self, config: DriveConfig) -> Result<(), String> {
        let drive_id = config.id.clone();
        if drive_id.trim().is_empty() {
            return Err("drive id must not be empty".to_string());
        }

        {
            let mut drives = self.lock_drives();
            let already_connected = drives.mounted.contains_key(&drive_id)
                && drives
                    .status
                    .get(&drive_id)
                    .map(|status| status.connected)
                    .unwrap_or(false);
            if already_connected {
                debug!("mount: drive '{drive_id}' is already mounted and connected");
                return Ok(());
            }
            if drives.remounting.contains(&drive_id) {
                drop(drives);
                return self.wait_for_inflight_mount(&drive_id).map(|_| ());
            }
            drives.remounting.insert(drive_id.clone());
            drives
                .states
                .insert(drive_id.clone(), DriveConnectionState::Mounting);
        }

        let client = match self.client_factory.create(&config) {
            Ok(client) => client,
            Err(err) => return self.fail_mount(&drive_id, err),
        };
        if let Err(err) = client.probe() {
            return self.fail_mount(&drive_id, err);
        }

        let now = persist::now_unix_ms();
        {
            let mut drives = self.lock_drives();
            drives.remounting.remove(&drive_id);
            drives.mounted.insert(
                drive_id.clone(),
                MountedDrive {
                    id: drive_id.clone(),
                    kind: config.kind,
                    config: config.clone(),
                    client,
                    mount_time: now,
                },
            );
            drives.status.insert(
                drive_id.clone(),
                ConnectionStatus {
                    connected: true,
                    last_check: now,
                    reconnect_attempts: 0,
                },
            );
            drives
                .states
                .insert(drive_id.clone(), DriveConnectionState::Connected);
            drives.configs.insert(drive_id.clone(), config.clone());
        }

        if let Err(err) = self.lock_registry().upsert(config.clone()) {
            warn!("mount: failed to persist config for '{drive_id}': {err}");
        }
        if let Err(err) = self.persist_state() {
            warn!("mount: failed to persist drive state: {err}");
        }

        info!(
            "Mounted {} drive '{drive_id}' ({})",
            config.kind.label(),
            config.display_name
        );
        self.emit(DriveMessage::DriveConnected { drive_id });
        Ok(())
    }

    fn fail_mount(&self, drive_id: &str, error: String) -> Result<(), String> {
        {
            let mut drives = self.lock_drives();
            drives.remounting.remove(drive_id);
            // A failed remount of a still-mounted drive leaves it
            // disconnected, not unmounted; the stale client stays until an
            // explicit unmount or terminal failure drops it.
            if drives.mounted.contains_key(drive_id) {
                drives
                    .states
                    .insert(drive_id.to_string(), DriveConnectionState::Disconnected);
            } else {
                drives.states.remove(drive_id);
            }
        }
        warn!("Mount failed for drive '{drive_id}': {error}");
        self.emit(DriveMessage::DriveError {
            drive_id: drive_id.to_string(),
            error: error.clone(),
        });
        Err(error)
    }

    /// Bounded poll for another caller's in-flight mount of the same drive.
    fn wait_for_inflight_mount(&self, drive_id: &str) -> Result<Arc<dyn DriveClient>, String> {
        for _ in 0..self.network_config.remount_wait_polls {
            {
                let drives = self.lock_drives();
                if let Some(mounted) = drives.mounted.get(drive_id) {
                    let connected = drives
                        .status
                        .get(drive_id)
                        .map(|status| status.connected)
                        .unwrap_or(false);
                    if connected {
                        return Ok(mounted.client.clone());
                    }
                }
                if !drives.remounting.contains(drive_id) {
                    return Err(format!(
                        "drive '{drive_id}' is not connected: concurrent mount attempt failed"
                    ));
                }
            }
            thread::sleep(Duration::from_millis(self.network_config.remount_wait_poll_ms));
        }
        Err(format!(
            "drive '{drive_id}' is not connected: timed out waiting for in-flight mount"
        ))
    }

    /// Stops monitoring and discards the client and status for a drive.
    /// Idempotent: unmounting an unmounted drive returns `false`.
    pub fn unmount(&self, drive_id: &str) -> bool {
        let removed = {
            let mut drives = self.lock_drives();
            let removed = drives.mounted.remove(drive_id).is_some();
            drives.status.remove(drive_id);
            drives.states.remove(drive_id);
            removed
        };
        if removed {
            if let Err(err) = self.persist_state() {
                warn!("unmount: failed to persist drive state: {err}");
            }
            info!("Unmounted drive '{drive_id}'");
            self.emit(DriveMessage::DriveDisconnected {
                drive_id: drive_id.to_string(),
            });
        }
        removed
    }

    /// Re-runs the mount-time connectivity probe and applies the state
    /// machine transition. Returns the resulting state.
    pub fn check_connection(&self, drive_id: &str) -> DriveConnectionState {
        let client = {
            let drives = self.lock_drives();
            drives.mounted.get(drive_id).map(|drive| drive.client.clone())
        };
        let Some(client) = client else {
            return self.connection_state(drive_id);
        };

        let probe_result = client.probe();
        let now = persist::now_unix_ms();
        let mut event = None;

        let new_state = {
            let mut drives = self.lock_drives();
            let tables = &mut *drives;
            let status = tables.status.entry(drive_id.to_string()).or_insert(
                ConnectionStatus {
                    connected: false,
                    last_check: now,
                    reconnect_attempts: 0,
                },
            );
            let was_connected = status.connected;
            status.last_check = now;

            match probe_result {
                Ok(()) => {
                    if !was_connected {
                        status.connected = true;
                        status.reconnect_attempts = 0;
                        event = Some(DriveMessage::DriveReconnected {
                            drive_id: drive_id.to_string(),
                        });
                        info!("Drive '{drive_id}' reconnected");
                    }
                    tables
                        .states
                        .insert(drive_id.to_string(), DriveConnectionState::Connected);
                    DriveConnectionState::Connected
                }
                Err(err) if was_connected => {
                    status.connected = false;
                    event = Some(DriveMessage::DriveDisconnected {
                        drive_id: drive_id.to_string(),
                    });
                    warn!("Drive '{drive_id}' lost connection: {err}");
                    tables
                        .states
                        .insert(drive_id.to_string(), DriveConnectionState::Disconnected);
                    DriveConnectionState::Disconnected
                }
                Err(err) => {
                    status.reconnect_attempts = status.reconnect_attempts.saturating_add(1);
                    if status.reconnect_attempts >= self.network_config.max_reconnect_attempts {
                        tables.mounted.remove(drive_id);
                        tables.status.remove(drive_id);
                        tables
                            .states
                            .insert(drive_id.to_string(), DriveConnectionState::Failed);
                        event = Some(DriveMessage::DriveError {
                            drive_id: drive_id.to_string(),
                            error: format!(
                                "reconnect attempts exhausted for drive '{drive_id}': {err}"
                            ),
                        });
                        warn!("Drive '{drive_id}' failed permanently: {err}");
                        DriveConnectionState::Failed
                    } else {
                        let attempt = status.reconnect_attempts;
                        tables
                            .states
                            .insert(drive_id.to_string(), DriveConnectionState::Reconnecting);
                        debug!(
                            "Drive '{drive_id}' reconnect attempt {attempt} failed: {err}"
                        );
                        DriveConnectionState::Reconnecting
                    }
                }
            }
        };

        if new_state == DriveConnectionState::Failed {
            // The client was dropped; the state file must stop advertising
            // the drive as mounted.
            if let Err(err) = self.persist_state() {
                warn!("check_connection: failed to persist drive state: {err}");
            }
        }
        if let Some(event) = event {
            self.emit(event);
        }
        new_state
    }

    /// Lazy, idempotent, concurrency-safe remount-on-demand. Returns the
    /// live client for a connected drive, mounting it first if needed.
    pub fn ensure_drive_mounted(&self, drive_id: &str) -> Result<Arc<dyn DriveClient>, String> {
        let cached_config = {
            let drives = self.lock_drives();
            if let Some(mounted) = drives.mounted.get(drive_id) {
                let connected = drives
                    .status
                    .get(drive_id)
                    .map(|status| status.connected)
                    .unwrap_or(false);
                if connected {
                    return Ok(mounted.client.clone());
                }
            }
            if drives.remounting.contains(drive_id) {
                drop(drives);
                return self.wait_for_inflight_mount(drive_id);
            }
            drives.configs.get(drive_id).cloned()
        };

        let config = match cached_config {
            Some(config) => config,
            None => self
                .lock_registry()
                .get(drive_id)
                .cloned()
                .ok_or_else(|| {
                    format!("drive '{drive_id}' is not mounted and has no registered configuration")
                })?,
        };

        self.mount(config)
            .map_err(|err| format!("drive '{drive_id}' is not connected: {err}"))?;

        let drives = self.lock_drives();
        drives
            .mounted
            .get(drive_id)
            .map(|mounted| mounted.client.clone())
            .ok_or_else(|| format!("drive '{drive_id}' is not connected after remount"))
    }

    /// Live client for a mounted drive, without triggering a remount.
    pub fn client(&self, drive_id: &str) -> Option<Arc<dyn DriveClient>> {
        self.lock_drives()
            .mounted
            .get(drive_id)
            .map(|mounted| mounted.client.clone())
    }

    pub fn status(&self, drive_id: &str) -> Option<ConnectionStatus> {
        self.lock_drives().status.get(drive_id).copied()
    }

    pub fn connection_state(&self, drive_id: &str) -> DriveConnectionState {
        self.lock_drives()
            .states
            .get(drive_id)
            .copied()
            .unwrap_or(DriveConnectionState::Unmounted)
    }

    /// Status rows for every configured drive, sorted by id.
    pub fn drive_snapshot(&self) -> Vec<DriveStatusInfo> {
        let drives = self.lock_drives();
        let mut ids: Vec<&String> = drives.configs.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| {
                let config = &drives.configs[id];
                DriveStatusInfo {
                    drive_id: id.clone(),
                    kind: config.kind,
                    display_name: config.display_name.clone(),
                    state: drives
                        .states
                        .get(id)
                        .copied()
                        .unwrap_or(DriveConnectionState::Unmounted),
                    status: drives.status.get(id).copied(),
                }
            })
            .collect()
    }

    /// Serializes configured and mounted drives to
    /// `network-drives-state.json`.
    pub fn persist_state(&self) -> Result<(), String> {
        let file = {
            let drives = self.lock_drives();
            let mut drive_configs: Vec<(String, DriveConfig)> = drives
                .configs
                .iter()
                .map(|(id, config)| (id.clone(), config.clone()))
                .collect();
            drive_configs.sort_by(|left, right| left.0.cmp(&right.0));

            let mut mounted_drives: Vec<MountedDriveRecord> = drives
                .mounted
                .values()
                .map(|mounted| MountedDriveRecord {
                    id: mounted.id.clone(),
                    kind: mounted.kind,
                    config: mounted.config.clone(),
                    mount_time: mounted.mount_time,
                })
                .collect();
            mounted_drives.sort_by(|left, right| left.id.cmp(&right.id));

            let mut connection_status: Vec<(String, ConnectionStatus)> = drives
                .status
                .iter()
                .map(|(id, status)| (id.clone(), *status))
                .collect();
            connection_status.sort_by(|left, right| left.0.cmp(&right.0));

            DriveStateFile {
                timestamp: persist::now_unix_ms(),
                drive_configs,
                mounted_drives,
                connection_status,
            }
        };
        persist::write_json(&self.state_path, &file)
    }

    /// Replays every previously-mounted drive through the mount path.
    /// Self-healing across restarts; failures degrade only that drive.
    pub fn replay_persisted_mounts(&self) {
        let file = match persist::read_json::<DriveStateFile>(&self.state_path) {
            Ok(Some(file)) => file,
            Ok(None) => return,
            Err(err) => {
                warn!("Drive state replay skipped: {err}");
                return;
            }
        };

        {
            let mut drives = self.lock_drives();
            for (id, config) in file.drive_configs {
                drives.configs.entry(id).or_insert(config);
            }
        }

        for record in file.mounted_drives {
            let already_mounted = {
                let drives = self.lock_drives();
                drives.mounted.contains_key(&record.id) || drives.remounting.contains(&record.id)
            };
            if already_mounted {
                continue;
            }
            match self.mount(record.config) {
                Ok(()) => info!("Replayed mount for drive '{}'", record.id),
                Err(err) => warn!("Replay mount failed for drive '{}': {err}", record.id),
            }
        }
    }

    /// Blocking monitor loop: drains drive commands from the bus and runs
    /// periodic liveness probes and scheduled reconnects.
    pub fn run_monitor(self: Arc<Self>, mut bus_consumer: Receiver<Message>) {
        let monitor_interval = Duration::from_secs(self.network_config.monitor_interval_secs);
        let reconnect_delay = Duration::from_secs(self.network_config.reconnect_delay_secs);
        let mut next_probe: HashMap<String, Instant> = HashMap::new();

        loop {
            loop {
                match bus_consumer.try_recv() {
                    Ok(Message::Drive(DriveMessage::MountDrive(config))) => {
                        let _ = self.mount(config);
                    }
                    Ok(Message::Drive(DriveMessage::UnmountDrive { drive_id })) => {
                        self.unmount(&drive_id);
                        next_probe.remove(&drive_id);
                    }
                    Ok(Message::Drive(DriveMessage::RequestDriveSnapshot)) => {
                        self.emit(DriveMessage::DriveSnapshot(self.drive_snapshot()));
                    }
                    Ok(_) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(
                            "NetworkDriveManager lagged on control bus, skipped {skipped} message(s)"
                        );
                    }
                    Err(TryRecvError::Closed) => return,
                }
            }

            let now = Instant::now();
            let watched: Vec<(String, DriveConnectionState)> = {
                let drives = self.lock_drives();
                drives
                    .mounted
                    .keys()
                    .map(|id| {
                        (
                            id.clone(),
                            drives
                                .states
                                .get(id)
                                .copied()
                                .unwrap_or(DriveConnectionState::Connected),
                        )
                    })
                    .collect()
            };
            let watched_ids: HashSet<&String> = watched.iter().map(|(id, _)| id).collect();
            next_probe.retain(|id, _| watched_ids.contains(id));

            for (drive_id, state) in watched {
                let interval = match state {
                    DriveConnectionState::Connected => monitor_interval,
                    DriveConnectionState::Disconnected | DriveConnectionState::Reconnecting => {
                        reconnect_delay
                    }
                    _ => continue,
                };
                let deadline = *next_probe
                    .entry(drive_id.clone())
                    .or_insert_with(|| now + interval);
                if now < deadline {
                    continue;
                }
                match self.check_connection(&drive_id) {
                    DriveConnectionState::Connected => {
                        next_probe.insert(drive_id, Instant::now() + monitor_interval);
                    }
                    DriveConnectionState::Disconnected | DriveConnectionState::Reconnecting => {
                        next_probe.insert(drive_id, Instant::now() + reconnect_delay);
                    }
                    _ => {
                        next_probe.remove(&drive_id);
                    }
                }
            }

            thread::sleep(MONITOR_IDLE_SLEEP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    struct FakeClient {
        fail_probe: Arc<AtomicBool>,
        probe_count: Arc<AtomicUsize>,
        probe_delay: Duration,
    }

    impl DriveClient for FakeClient {
        fn kind(&self) -> DriveKind {
            DriveKind::Webdav
        }

        fn probe(&self) -> Result<(), String> {
            self.probe_count.fetch_add(1, Ordering::SeqCst);
            if !self.probe_delay.is_zero() {
                thread::sleep(self.probe_delay);
            }
            if self.fail_probe.load(Ordering::SeqCst) {
                Err("probe refused".to_string())
            } else {
                Ok(())
            }
        }

        fn stat(&self, _path: &str) -> Result<crate::backends::RemoteFileStat, String> {
            Err("not implemented".to_string())
        }

        fn read_dir(&self, _path: &str) -> Result<Vec<crate::backends::RemoteEntry>, String> {
            Ok(Vec::new())
        }

        fn read_file(&self, _path: &str) -> Result<Vec<u8>, String> {
            Err("not implemented".to_string())
        }

        fn write_file(&self, _path: &str, _data: &[u8]) -> Result<(), String> {
            Err("not implemented".to_string())
        }

        fn exists(&self, _path: &str) -> Result<bool, String> {
            Ok(false)
        }
    }

    struct FakeFactory {
        fail_probe: Arc<AtomicBool>,
        probe_count: Arc<AtomicUsize>,
        create_count: Arc<AtomicUsize>,
        probe_delay: Duration,
    }

    impl FakeFactory {
        fn new() -> Self {
            Self {
                fail_probe: Arc::new(AtomicBool::new(false)),
                probe_count: Arc::new(AtomicUsize::new(0)),
                create_count: Arc::new(AtomicUsize::new(0)),
                probe_delay: Duration::ZERO,
            }
        }
    }

    impl DriveClientFactory for FakeFactory {
        fn create(&self, _config: &DriveConfig) -> Result<Arc<dyn DriveClient>, String> {
            self.create_count.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeClient {
                fail_probe: self.fail_probe.clone(),
                probe_count: self.probe_count.clone(),
                probe_delay: self.probe_delay,
            }))
        }
    }

    struct Harness {
        manager: Arc<NetworkDriveManager>,
        observer: broadcast::Receiver<Message>,
        fail_probe: Arc<AtomicBool>,
        probe_count: Arc<AtomicUsize>,
        create_count: Arc<AtomicUsize>,
        state_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn harness_with_factory(factory: FakeFactory) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let (bus_sender, _) = broadcast::channel(512);
        let observer = bus_sender.subscribe();
        let fail_probe = factory.fail_probe.clone();
        let probe_count = factory.probe_count.clone();
        let create_count = factory.create_count.clone();
        let state_path = dir.path().join("network-drives-state.json");
        let registry = DriveRegistry::open(dir.path().join("drive-registry.json"));
        let mut network_config = NetworkConfig::default();
        network_config.remount_wait_poll_ms = 10;
        let manager = Arc::new(NetworkDriveManager::new(
            bus_sender,
            Arc::new(factory),
            registry,
            state_path.clone(),
            network_config,
        ));
        Harness {
            manager,
            observer,
            fail_probe,
            probe_count,
            create_count,
            state_path,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with_factory(FakeFactory::new())
    }

    fn config(id: &str) -> DriveConfig {
        DriveConfig {
            id: id.to_string(),
            kind: DriveKind::Webdav,
            host: "https://nas.local/dav".to_string(),
            share: String::new(),
            username: "alice".to_string(),
            password: "secret".to_string(),
            domain: None,
            display_name: "NAS".to_string(),
        }
    }

    fn drain_events(observer: &mut broadcast::Receiver<Message>) -> Vec<DriveMessage> {
        let mut events = Vec::new();
        while let Ok(message) = observer.try_recv() {
            if let Message::Drive(event) = message {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn test_mount_success_stores_state_and_emits_once() {
        let mut harness = harness();
        harness.manager.mount(config("d1")).expect("mount");

        assert!(harness.manager.client("d1").is_some());
        let status = harness.manager.status("d1").expect("status");
        assert!(status.connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(
            harness.manager.connection_state("d1"),
            DriveConnectionState::Connected
        );

        let events = drain_events(&mut harness.observer);
        let connected: Vec<&DriveMessage> = events
            .iter()
            .filter(|event| matches!(event, DriveMessage::DriveConnected { .. }))
            .collect();
        assert_eq!(connected.len(), 1);

        assert!(harness.state_path.exists());
        let raw = std::fs::read_to_string(&harness.state_path).expect("state file");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["mountedDrives"][0]["id"], "d1");
        assert_eq!(value["mountedDrives"][0]["type"], "webdav");
        assert_eq!(value["connectionStatus"][0][1]["connected"], true);
    }

    #[test]
    fn test_mount_failure_retains_no_partial_state() {
        let mut harness = harness();
        harness.fail_probe.store(true, Ordering::SeqCst);

        let result = harness.manager.mount(config("d1"));
        assert!(result.is_err());
        assert!(harness.manager.client("d1").is_none());
        assert!(harness.manager.status("d1").is_none());
        assert_eq!(
            harness.manager.connection_state("d1"),
            DriveConnectionState::Unmounted
        );

        let events = drain_events(&mut harness.observer);
        assert!(events
            .iter()
            .any(|event| matches!(event, DriveMessage::DriveError { .. })));
        assert!(!events
            .iter()
            .any(|event| matches!(event, DriveMessage::DriveConnected { .. })));
    }

    #[test]
    fn test_concurrent_mounts_produce_one_client_and_one_event() {
        let mut factory = FakeFactory::new();
        factory.probe_delay = Duration::from_millis(150);
        let mut harness = harness_with_factory(factory);

        let manager = harness.manager.clone();
        let background = thread::spawn(move || manager.mount(config("d1")));
        thread::sleep(Duration::from_millis(30));
        harness.manager.mount(config("d1")).expect("second caller");
        background
            .join()
            .expect("join")
            .expect("first caller");

        assert_eq!(harness.create_count.load(Ordering::SeqCst), 1);
        let events = drain_events(&mut harness.observer);
        let connected = events
            .iter()
            .filter(|event| matches!(event, DriveMessage::DriveConnected { .. }))
            .count();
        assert_eq!(connected, 1);
    }

    #[test]
    fn test_unmount_is_idempotent() {
        let mut harness = harness();
        harness.manager.mount(config("d1")).expect("mount");
        drain_events(&mut harness.observer);

        assert!(harness.manager.unmount("d1"));
        assert!(!harness.manager.unmount("d1"));

        let events = drain_events(&mut harness.observer);
        let disconnected = events
            .iter()
            .filter(|event| matches!(event, DriveMessage::DriveDisconnected { .. }))
            .count();
        assert_eq!(disconnected, 1);
    }

    #[test]
    fn test_reconnect_attempts_are_bounded_and_terminal() {
        let mut harness = harness();
        harness.manager.mount(config("d1")).expect("mount");
        drain_events(&mut harness.observer);

        harness.fail_probe.store(true, Ordering::SeqCst);

        // Failure while connected flips to disconnected without counting.
        assert_eq!(
            harness.manager.check_connection("d1"),
            DriveConnectionState::Disconnected
        );
        // Two failed reconnects stay in reconnecting.
        assert_eq!(
            harness.manager.check_connection("d1"),
            DriveConnectionState::Reconnecting
        );
        assert_eq!(
            harness.manager.check_connection("d1"),
            DriveConnectionState::Reconnecting
        );
        // The third exhausts the cap and goes terminal.
        assert_eq!(
            harness.manager.check_connection("d1"),
            DriveConnectionState::Failed
        );
        assert!(harness.manager.client("d1").is_none());

        // No probes run once terminal.
        let probes_before = harness.probe_count.load(Ordering::SeqCst);
        assert_eq!(
            harness.manager.check_connection("d1"),
            DriveConnectionState::Failed
        );
        assert_eq!(harness.probe_count.load(Ordering::SeqCst), probes_before);

        let events = drain_events(&mut harness.observer);
        assert!(events
            .iter()
            .any(|event| matches!(event, DriveMessage::DriveDisconnected { .. })));
        assert!(events
            .iter()
            .any(|event| matches!(event, DriveMessage::DriveError { .. })));

        // The state file no longer advertises the drive as mounted, so a
        // restart will not replay a dead mount.
        let raw = std::fs::read_to_string(&harness.state_path).expect("state file");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(
            value["mountedDrives"].as_array().expect("array").len(),
            0
        );
    }

    #[test]
    fn test_failed_remount_keeps_drive_disconnected() {
        let mut harness = harness();
        harness.manager.mount(config("d1")).expect("mount");
        drain_events(&mut harness.observer);

        harness.fail_probe.store(true, Ordering::SeqCst);
        assert_eq!(
            harness.manager.check_connection("d1"),
            DriveConnectionState::Disconnected
        );

        // A remount attempt while the server is down fails, but the drive is
        // still mounted with a stale client: it stays disconnected (on the
        // short reconnect cadence), not unmounted.
        assert!(harness.manager.mount(config("d1")).is_err());
        assert_eq!(
            harness.manager.connection_state("d1"),
            DriveConnectionState::Disconnected
        );
        assert!(harness.manager.client("d1").is_some());
    }

    #[test]
    fn test_probe_recovery_emits_reconnected_and_resets_attempts() {
        let mut harness = harness();
        harness.manager.mount(config("d1")).expect("mount");
        drain_events(&mut harness.observer);

        harness.fail_probe.store(true, Ordering::SeqCst);
        harness.manager.check_connection("d1");
        harness.manager.check_connection("d1");

        harness.fail_probe.store(false, Ordering::SeqCst);
        assert_eq!(
            harness.manager.check_connection("d1"),
            DriveConnectionState::Connected
        );
        let status = harness.manager.status("d1").expect("status");
        assert!(status.connected);
        assert_eq!(status.reconnect_attempts, 0);

        let events = drain_events(&mut harness.observer);
        assert!(events
            .iter()
            .any(|event| matches!(event, DriveMessage::DriveReconnected { .. })));
    }

    #[test]
    fn test_ensure_drive_mounted_uses_registry_config() {
        let harness = harness();
        harness
            .manager
            .lock_registry()
            .register(config("d1"))
            .expect("register");

        let client = harness.manager.ensure_drive_mounted("d1").expect("ensure");
        assert_eq!(client.kind(), DriveKind::Webdav);
        assert!(harness.manager.client("d1").is_some());
    }

    #[test]
    fn test_ensure_drive_mounted_unknown_id_fails() {
        let harness = harness();
        let result = harness.manager.ensure_drive_mounted("ghost");
        let error = result.err().expect("should fail");
        assert!(error.contains("not mounted"));
    }

    #[test]
    fn test_replay_restores_previous_mounts() {
        let harness = harness();
        harness.manager.mount(config("d1")).expect("mount");

        // Second manager instance over the same state file.
        let (bus_sender, _) = broadcast::channel(512);
        let factory = FakeFactory::new();
        let registry = DriveRegistry::open(harness._dir.path().join("drive-registry.json"));
        let manager = Arc::new(NetworkDriveManager::new(
            bus_sender,
            Arc::new(factory),
            registry,
            harness.state_path.clone(),
            NetworkConfig::default(),
        ));
        manager.replay_persisted_mounts();
        assert!(manager.client("d1").is_some());
        assert_eq!(
            manager.connection_state("d1"),
            DriveConnectionState::Connected
        );
    }

    #[test]
    fn test_drive_snapshot_lists_configured_drives() {
        let harness = harness();
        harness.manager.mount(config("d1")).expect("mount");
        let snapshot = harness.manager.drive_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].drive_id, "d1");
        assert_eq!(snapshot[0].state, DriveConnectionState::Connected);
        assert!(snapshot[0].status.expect("status").connected);
    }
}
