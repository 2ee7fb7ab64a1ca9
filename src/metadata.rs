//! Audio-metadata collaborator boundary.
//!
//! Tag parsing is implemented outside this core; scan and validation flows
//! only consume the [`MetadataParser`] trait. The bundled fallback derives a
//! title from the file name so a scan can complete without a tag reader.

/// Common tag fields consumed by scan and validation flows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Track length in seconds when the parser can determine it.
    pub duration: Option<f64>,
    pub has_cover: bool,
}

/// External tag-parsing collaborator.
pub trait MetadataParser: Send + Sync {
    /// Parses tags for a logical path (local path or `network://` URI).
    fn parse(&self, path: &str) -> Result<TrackMetadata, String>;
}

/// Fallback parser that derives a display title from the file name.
pub struct FilenameMetadataParser;

impl FilenameMetadataParser {
    fn title_from_path(path: &str) -> String {
        let file_name = path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(path);
        let stem = file_name
            .rsplit_once('.')
            .map(|(stem, _ext)| stem)
            .unwrap_or(file_name);
        let trimmed = stem.trim();
        if trimmed.is_empty() {
            "Unknown Title".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

impl MetadataParser for FilenameMetadataParser {
    fn parse(&self, path: &str) -> Result<TrackMetadata, String> {
        Ok(TrackMetadata {
            title: Self::title_from_path(path),
            ..TrackMetadata::default()
        })
    }
}
