//! Tunables for every stage of the pipeline.
//!
//! Everything here can be overridden from a JSON file; missing fields fall
//! back to their defaults. The numeric defaults trade recognition accuracy
//! against fingerprint volume and are meant to be tuned per catalog.

use std::{env, fs, path::Path, time::Duration};

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::hasher::{DELTA_MASK, FREQ_MASK};

pub const DEFAULT_SAMPLE_RATE: u32 = 11025;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub spectrogram: SpectrogramConfig,
    pub peaks: PeakConfig,
    pub hashing: HashConfig,
    pub matching: MatchConfig,
    pub store: StoreConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrogramConfig {
    /// Rate every buffer must arrive at, for ingestion and queries alike.
    pub sample_rate: u32,
    /// Samples per analysis window.
    pub window_size: usize,
    /// Samples between the starts of consecutive windows.
    pub hop_size: usize,
    /// Bins above this frequency (Hz) are dropped.
    pub max_frequency: f32,
}

impl Default for SpectrogramConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            window_size: 2048,
            hop_size: 512,
            max_frequency: 5000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakConfig {
    /// Frames on each side of a candidate that it must dominate.
    pub time_radius: usize,
    /// Bins on each side of a candidate that it must dominate.
    pub freq_radius: usize,
    /// Absolute floor on landmark magnitude.
    pub min_magnitude: f32,
    /// Multiple of the running mean frame magnitude a landmark must exceed.
    /// Zero disables the adaptive floor.
    pub adaptive_factor: f32,
    /// Weight of the previous running mean when folding in a new frame.
    pub floor_decay: f32,
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            time_radius: 3,
            freq_radius: 20,
            min_magnitude: 1e-3,
            adaptive_factor: 4.0,
            floor_decay: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    /// Targets paired with each anchor.
    pub fan_out: usize,
    /// Closest target frame, in frames after the anchor.
    pub min_time_delta: usize,
    /// Farthest target frame, in frames after the anchor.
    pub max_time_delta: usize,
    /// Largest bin distance between anchor and target.
    pub max_freq_delta: usize,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            fan_out: 5,
            min_time_delta: 1,
            max_time_delta: 40,
            max_freq_delta: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Width of an alignment histogram bucket.
    pub bucket_ms: u32,
    /// Aligned votes the best track needs before it counts as a match.
    pub min_votes: usize,
    /// Share of query hashes that must agree on the winning alignment.
    pub min_confidence: f32,
    /// Candidates kept in a recognition report.
    pub top_k: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            bucket_ms: 100,
            min_votes: 5,
            min_confidence: 0.05,
            top_k: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
    pub timeout_ms: u64,
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            timeout_ms: 10_000,
            pool_size: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Tracks fingerprinted at the same time.
    pub concurrency: usize,
    /// Only the first N seconds of a reference are fingerprinted when set.
    pub fingerprint_limit_secs: Option<f32>,
    /// Cutoff of the low-pass filter applied before resampling.
    pub low_pass_hz: f32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fingerprint_limit_secs: None,
            low_pass_hz: 5000.0,
        }
    }
}

impl Config {
    /// Reads `path` when given, then layers `DATABASE_URL` from the
    /// environment (or `.env`) on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv().ok();

        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)?;
                serde_json::from_str::<Config>(&raw).map_err(|e| {
                    Error::InvalidConfig(format!("{}: {}", path.display(), e))
                })?
            }
            None => Config::default(),
        };

        if let Ok(url) = env::var("DATABASE_URL") {
            config.store.database_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.spectrogram;
        if s.sample_rate == 0 {
            return invalid("spectrogram.sample_rate must be positive");
        }
        if s.window_size < 4 {
            return invalid("spectrogram.window_size must be at least 4");
        }
        if s.hop_size == 0 || s.hop_size > s.window_size {
            return invalid("spectrogram.hop_size must be in 1..=window_size");
        }
        if !(s.max_frequency > 0.0) {
            return invalid("spectrogram.max_frequency must be positive");
        }
        if s.window_size / 2 + 1 > FREQ_MASK as usize + 1 {
            return invalid("spectrogram.window_size has more bins than a hash can encode");
        }

        let p = &self.peaks;
        if p.time_radius == 0 || p.freq_radius == 0 {
            return invalid("peaks radii must be positive");
        }
        if !(p.min_magnitude >= 0.0) || !(p.adaptive_factor >= 0.0) {
            return invalid("peaks floors must be non-negative");
        }
        if !(0.0..1.0).contains(&p.floor_decay) {
            return invalid("peaks.floor_decay must be in [0, 1)");
        }

        let h = &self.hashing;
        if h.fan_out == 0 {
            return invalid("hashing.fan_out must be positive");
        }
        if h.min_time_delta > h.max_time_delta {
            return invalid("hashing.min_time_delta exceeds max_time_delta");
        }
        if h.max_time_delta > DELTA_MASK as usize {
            return invalid("hashing.max_time_delta does not fit the hash");
        }

        let m = &self.matching;
        if m.bucket_ms == 0 {
            return invalid("matching.bucket_ms must be positive");
        }
        if !(0.0..=1.0).contains(&m.min_confidence) {
            return invalid("matching.min_confidence must be in [0, 1]");
        }
        if m.top_k == 0 {
            return invalid("matching.top_k must be positive");
        }

        if self.store.timeout_ms == 0 {
            return invalid("store.timeout_ms must be positive");
        }
        if self.ingest.concurrency == 0 {
            return invalid("ingest.concurrency must be positive");
        }
        if let Some(limit) = self.ingest.fingerprint_limit_secs {
            if !(limit > 0.0) {
                return invalid("ingest.fingerprint_limit_secs must be positive");
            }
        }

        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }
}

fn invalid(reason: &str) -> Result<()> {
    Err(Error::InvalidConfig(reason.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "hashing": { "fan_out": 8 }, "matching": { "min_votes": 12 } }"#)
                .unwrap();

        assert_eq!(config.hashing.fan_out, 8);
        assert_eq!(config.hashing.max_time_delta, HashConfig::default().max_time_delta);
        assert_eq!(config.matching.min_votes, 12);
        assert_eq!(config.spectrogram, SpectrogramConfig::default());
    }

    #[test]
    fn rejects_hop_larger_than_window() {
        let mut config = Config::default();
        config.spectrogram.hop_size = config.spectrogram.window_size + 1;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_time_window_that_overflows_the_hash() {
        let mut config = Config::default();
        config.hashing.max_time_delta = DELTA_MASK as usize + 1;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let mut config = Config::default();
        config.matching.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_json_file() {
        let path = env::temp_dir().join(format!("songmark-config-{}.json", std::process::id()));
        fs::write(&path, r#"{ "store": { "timeout_ms": 250 } }"#).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(config.store_timeout(), Duration::from_millis(250));
        assert_eq!(config.ingest, IngestConfig::default());
    }

    #[test]
    fn load_reports_malformed_json() {
        let path = env::temp_dir().join(format!("songmark-bad-config-{}.json", std::process::id()));
        fs::write(&path, "{ not json").unwrap();

        let result = Config::load(Some(&path));
        fs::remove_file(&path).ok();

        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
