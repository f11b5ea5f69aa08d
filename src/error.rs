use std::time::Duration;

use crate::db::TrackId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Audio shorter than one analysis window. The caller may pad or skip it.
    #[error("need at least {required} samples for one analysis window, got {actual}")]
    InsufficientSamples { required: usize, actual: usize },

    #[error("expected audio at {expected} Hz, got {actual} Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not decode audio: {0}")]
    Decode(String),

    #[error("audio capture failed: {0}")]
    Capture(String),

    #[error("fingerprint store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// A batch insert failed partway. Nothing of the track was left queryable.
    #[error("ingest of track {track_id} failed partway and was rolled back")]
    PartialIngestFailure { track_id: TrackId, source: Box<Error> },

    #[error("no track with id {0}")]
    UnknownTrack(TrackId),

    #[error("track {0} already has fingerprints")]
    AlreadyFingerprinted(TrackId),

    /// The catalog already holds a track for this content.
    #[error("content already catalogued as track {0}")]
    DuplicateContent(TrackId),

    /// Another ingest of the same content has not finished yet.
    #[error("track {0} is still being ingested")]
    IngestInProgress(TrackId),

    #[error("{0} was cancelled before it finished")]
    Cancelled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the same call may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::Timeout(_)
                | Error::PartialIngestFailure { .. }
                | Error::IngestInProgress(_)
        )
    }
}
