pub mod hasher;
pub mod peaks;

pub use hasher::{Fingerprint, FingerprintHasher, HashCode};
pub use peaks::{Landmark, PeakExtractor};

use crate::audio_processor::SampleBuffer;
use crate::config::Config;
use crate::error::Result;
use crate::fft::SpectrogramBuilder;

/// Samples in, hashes out. Holds no per-call state, so one instance can be
/// shared by every worker.
pub struct Fingerprinter {
    spectrogram: SpectrogramBuilder,
    peaks: PeakExtractor,
    hasher: FingerprintHasher,
}

impl Fingerprinter {
    pub fn new(config: &Config) -> Self {
        Self {
            spectrogram: SpectrogramBuilder::new(&config.spectrogram),
            peaks: PeakExtractor::new(&config.peaks),
            hasher: FingerprintHasher::new(&config.hashing, &config.spectrogram),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.spectrogram.sample_rate()
    }

    pub fn landmarks(&self, buffer: &SampleBuffer) -> Result<Vec<Landmark>> {
        let spectrogram = self.spectrogram.build(&buffer.samples, buffer.sample_rate)?;
        Ok(self.peaks.extract(&spectrogram))
    }

    pub fn fingerprint(&self, buffer: &SampleBuffer) -> Result<Vec<Fingerprint>> {
        let landmarks = self.landmarks(buffer)?;
        let fingerprints = self.hasher.hash(&landmarks);

        tracing::debug!(
            samples = buffer.samples.len(),
            landmarks = landmarks.len(),
            fingerprints = fingerprints.len(),
            "fingerprinted buffer"
        );

        Ok(fingerprints)
    }
}
