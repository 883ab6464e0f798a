mod bandwidth;
mod orchestrator;

pub use bandwidth::BandwidthLimiter;
pub use orchestrator::{ExistingFilePolicy, Orchestrator, TaskFailed, TaskFinished};

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::checksum::ChecksumSpec;
use crate::error::AdmissionError;
use crate::source::SourceDescriptor;

pub const DEFAULT_MAX_CONCURRENT: usize = 2;
pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DownloadKind {
    Video,
    Audio,
    VideoAudio,
    Subtitle,
    SubtitleNoTimestamp,
    Torrent,
    Ed2k,
}

impl DownloadKind {
    /// Whether a request of this kind can be served from `source`.
    pub fn accepts(self, source: &SourceDescriptor) -> bool {
        match source {
            SourceDescriptor::Http { .. } => !matches!(self, Self::Torrent | Self::Ed2k),
            SourceDescriptor::Magnet { .. } => self == Self::Torrent,
            SourceDescriptor::Ed2k { .. } => self == Self::Ed2k,
        }
    }
}

impl fmt::Display for DownloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::VideoAudio => "video_audio",
            Self::Subtitle => "subtitle",
            Self::SubtitleNoTimestamp => "subtitle_no_timestamp",
            Self::Torrent => "torrent",
            Self::Ed2k => "ed2k",
        };
        f.write_str(name)
    }
}

/// Stable task identifier: a digest of the source locator and the requested
/// output path, so resubmitting the same link to the same place yields the
/// same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn derive(source: &SourceDescriptor, requested: &Path) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.locator().as_bytes());
        hasher.update([0u8]);
        hasher.update(requested.to_string_lossy().as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One resolver result the user may select for download.
#[derive(Debug, Clone)]
pub struct SelectableItem {
    pub source: SourceDescriptor,
    pub kind: DownloadKind,
    pub estimated_size: Option<u64>,
    pub suggested_filename: String,
    pub checksum: Option<ChecksumSpec>,
}

impl SelectableItem {
    pub fn from_source(source: SourceDescriptor) -> Self {
        Self {
            kind: source.default_kind(),
            estimated_size: source.size_hint(),
            suggested_filename: source.suggested_filename(),
            source,
            checksum: None,
        }
    }

    pub fn with_kind(mut self, kind: DownloadKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_checksum(mut self, checksum: ChecksumSpec) -> Self {
        self.checksum = Some(checksum);
        self
    }
}

/// Immutable intent to fetch one artifact.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: TaskId,
    pub source: SourceDescriptor,
    pub destination: PathBuf,
    pub kind: DownloadKind,
    /// Best-effort estimate; 0 when unknown.
    pub total_size: u64,
    pub checksum: Option<ChecksumSpec>,
}

impl DownloadRequest {
    pub fn new(
        source: SourceDescriptor,
        destination: PathBuf,
        kind: DownloadKind,
        total_size: u64,
    ) -> Self {
        Self {
            id: TaskId::derive(&source, &destination),
            source,
            destination,
            kind,
            total_size,
            checksum: None,
        }
    }

    pub fn validate(&self) -> Result<(), AdmissionError> {
        if self.destination.as_os_str().is_empty() || self.destination.file_name().is_none() {
            return Err(AdmissionError::MissingDestination);
        }
        if !self.destination.is_absolute() {
            return Err(AdmissionError::RelativeDestination(
                self.destination.clone(),
            ));
        }
        if !self.kind.accepts(&self.source) {
            return Err(AdmissionError::KindMismatch {
                kind: self.kind,
                scheme: self.source.scheme(),
            });
        }
        Ok(())
    }
}

/// Tuning for the simulated peer-to-peer backends.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    /// Size assumed for magnet transfers that carry no length.
    pub default_size: u64,
    pub chunk_size: u64,
    pub chunk_delay: Duration,
    pub phase_delay: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            default_size: 16 << 20,
            chunk_size: 1 << 20,
            chunk_delay: Duration::from_millis(50),
            phase_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent: usize,
    pub tick: Duration,
    /// Maximum silence on an HTTP body stream before the transfer fails.
    pub http_timeout: Option<Duration>,
    pub bandwidth_limit: Option<u64>,
    pub peer: PeerSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            tick: DEFAULT_TICK,
            http_timeout: None,
            bandwidth_limit: None,
            peer: PeerSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::parse_link;

    fn http_source() -> SourceDescriptor {
        parse_link("https://example.com/a.mp4").unwrap()
    }

    #[test]
    fn task_id_is_stable_per_source_and_destination() {
        let a = TaskId::derive(&http_source(), Path::new("/tmp/a.mp4"));
        let b = TaskId::derive(&http_source(), Path::new("/tmp/a.mp4"));
        let c = TaskId::derive(&http_source(), Path::new("/tmp/b.mp4"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 16);
    }

    #[test]
    fn validate_rejects_relative_and_missing_destinations() {
        let relative = DownloadRequest::new(
            http_source(),
            PathBuf::from("a.mp4"),
            DownloadKind::Video,
            0,
        );
        assert!(matches!(
            relative.validate(),
            Err(AdmissionError::RelativeDestination(_))
        ));

        let missing = DownloadRequest::new(http_source(), PathBuf::new(), DownloadKind::Video, 0);
        assert_eq!(missing.validate(), Err(AdmissionError::MissingDestination));
    }

    #[test]
    fn validate_rejects_kind_mismatch() {
        let request = DownloadRequest::new(
            http_source(),
            PathBuf::from("/tmp/a.mp4"),
            DownloadKind::Torrent,
            0,
        );
        assert_eq!(
            request.validate(),
            Err(AdmissionError::KindMismatch {
                kind: DownloadKind::Torrent,
                scheme: "http",
            })
        );
    }
}
