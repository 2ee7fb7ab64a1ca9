//! Event-bus protocol shared by all runtime components.
//!
//! This module defines all message payloads exchanged between the drive
//! manager, the file adapter consumers, and the library cache manager.

/// Remote storage protocol of a configured drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveKind {
    Smb,
    Webdav,
}

impl DriveKind {
    /// Short label used in log lines and status text.
    pub fn label(&self) -> &'static str {
        match self {
            DriveKind::Smb => "smb",
            DriveKind::Webdav => "webdav",
        }
    }
}

/// Persisted definition of one remote drive endpoint.
///
/// Identity is the caller-supplied `id`; a registered config is replaced only
/// through explicit delete + recreate.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveConfig {
    /// Stable drive id, unique across the registry.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: DriveKind,
    /// SMB host (or local share root) or WebDAV base URL.
    pub host: String,
    /// SMB share name; empty for WebDAV.
    #[serde(default)]
    pub share: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub display_name: String,
}

/// Liveness snapshot for one mounted drive.
///
/// A snapshot must not be trusted past `last_check` plus the monitoring
/// interval; the monitor loop is the only writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    /// Unix milliseconds of the last completed probe.
    pub last_check: i64,
    pub reconnect_attempts: u32,
}

/// Per-drive connection state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveConnectionState {
    Unmounted,
    Mounting,
    Connected,
    Disconnected,
    Reconnecting,
    /// Terminal for this mount attempt; requires an explicit new mount.
    Failed,
}

/// One row of the drive status snapshot published over the bus.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DriveStatusInfo {
    pub drive_id: String,
    pub kind: DriveKind,
    pub display_name: String,
    pub state: DriveConnectionState,
    pub status: Option<ConnectionStatus>,
}

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Drive(DriveMessage),
    Cache(CacheMessage),
}

/// Drive-domain commands and notifications.
#[derive(Debug, Clone)]
pub enum DriveMessage {
    MountDrive(DriveConfig),
    UnmountDrive { drive_id: String },
    RequestDriveSnapshot,
    DriveSnapshot(Vec<DriveStatusInfo>),
    DriveConnected { drive_id: String },
    DriveDisconnected { drive_id: String },
    DriveReconnected { drive_id: String },
    DriveError { drive_id: String, error: String },
}

/// One cataloged track row.
///
/// `file_id` is a content fingerprint over `(path, size, mtime)`; it changes
/// whenever the backing bytes change and is not a stable path identifier.
/// Cover art is never stored inline, only the `has_cover` flag.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub file_id: String,
    pub file_path: String,
    pub file_name: String,
    pub file_size: u64,
    /// Unix milliseconds.
    pub last_modified: i64,
    /// Unix milliseconds when the entry was first cataloged.
    pub added_to_cache: i64,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    /// Track length in seconds when known.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub has_cover: bool,
}

/// One user playlist referencing cataloged tracks by `file_id`.
///
/// References may dangle between a track removal and the next explicit
/// cleanup pass.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub track_ids: Vec<String>,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub updated_at: i64,
    #[serde(default)]
    pub cover_image: Option<String>,
}

/// Incremental validation progress counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValidationProgress {
    pub current: usize,
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub modified: usize,
}

/// Cache-domain commands and notifications.
#[derive(Debug, Clone)]
pub enum CacheMessage {
    ScanDirectories(Vec<String>),
    ScanStarted,
    ScanProgress {
        discovered: usize,
        indexed: usize,
    },
    ScanCompleted {
        indexed_tracks: usize,
        duration_ms: u64,
    },
    ScanFailed(String),
    RequestValidation,
    ValidationProgress(ValidationProgress),
    ValidationCompleted {
        valid: usize,
        invalid: usize,
        modified: usize,
    },
    /// Caller-gated destructive follow-up to a validation pass.
    PruneInvalidTracks,
    /// Caller-gated refresh of tracks a validation pass found modified.
    RefreshModifiedTracks,
    CreatePlaylist {
        name: String,
        description: String,
    },
    DeletePlaylist {
        playlist_id: String,
    },
    RenamePlaylist {
        playlist_id: String,
        name: String,
    },
    AddTrackToPlaylist {
        playlist_id: String,
        file_id: String,
    },
    RemoveTrackFromPlaylist {
        playlist_id: String,
        file_id: String,
    },
    CleanupPlaylistTracks,
    PlaylistsUpdated(Vec<Playlist>),
    CacheOperationFailed {
        action: String,
        error: String,
    },
}
