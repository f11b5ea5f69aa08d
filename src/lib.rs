//! Landmark-based audio fingerprinting and recognition.
//!
//! Reference tracks are turned into spectrogram peak pairs and stored as
//! hashes; a query clip is matched by voting on the time alignment of the
//! hashes it shares with each track.

pub mod audio_processor;
pub mod config;
pub mod db;
pub mod error;
pub mod fft;
pub mod fingerprint;
pub mod matcher;
pub mod recognizer;
#[cfg(feature = "postgres")]
pub mod schema;
pub mod server;
pub mod tester;
pub mod testing;

pub use audio_processor::{
    AudioProcessor, BytesSource, FileSource, MemorySource, SampleBuffer, SampleSource,
};
#[cfg(feature = "microphone")]
pub use audio_processor::MicrophoneSource;
pub use config::Config;
pub use db::{FingerprintStore, MemoryStore, Track, TrackId};
#[cfg(feature = "postgres")]
pub use db::PgStore;
pub use error::{Error, Result};
pub use fingerprint::{Fingerprint, Fingerprinter, HashCode};
pub use matcher::{MatchCandidate, MatchOutcome, MatchReport, Matcher};
pub use recognizer::{IngestOutcome, IngestReport, Recognition, Recognizer};
