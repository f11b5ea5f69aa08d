use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::{Fft, FftPlanner, num_complex::Complex};

use crate::config::SpectrogramConfig;
use crate::error::{Error, Result};

/// Magnitude grid, one row per analysis window.
///
/// Frames are stored back to back in a single buffer, so frame `f`, bin `b`
/// lives at `f * bins + b`.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    magnitudes: Vec<f32>,
    bins: usize,
    hop_size: usize,
    window_size: usize,
    sample_rate: u32,
}

impl Spectrogram {
    /// Builds a grid from precomputed rows. All rows must have the same length.
    pub fn from_frames(
        frames: Vec<Vec<f32>>,
        window_size: usize,
        hop_size: usize,
        sample_rate: u32,
    ) -> Result<Self> {
        let bins = frames.first().map_or(0, Vec::len);
        if frames.iter().any(|frame| frame.len() != bins) {
            return Err(Error::InvalidConfig(
                "spectrogram frames must all have the same bin count".to_string(),
            ));
        }

        Ok(Self {
            magnitudes: frames.into_iter().flatten().collect(),
            bins,
            hop_size,
            window_size,
            sample_rate,
        })
    }

    pub fn frame_count(&self) -> usize {
        if self.bins == 0 {
            0
        } else {
            self.magnitudes.len() / self.bins
        }
    }

    pub fn bin_count(&self) -> usize {
        self.bins
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame(&self, index: usize) -> &[f32] {
        &self.magnitudes[index * self.bins..(index + 1) * self.bins]
    }

    pub fn frames(&self) -> impl Iterator<Item = &[f32]> {
        self.magnitudes.chunks_exact(self.bins.max(1))
    }

    #[inline]
    pub fn magnitude(&self, frame: usize, bin: usize) -> f32 {
        self.magnitudes[frame * self.bins + bin]
    }

    /// Centre frequency of `bin` in Hz.
    pub fn bin_to_hz(&self, bin: usize) -> f32 {
        bin as f32 * self.sample_rate as f32 / self.window_size as f32
    }
}

/// Short-time Fourier transform over fixed, overlapping windows.
pub struct SpectrogramBuilder {
    window_size: usize,
    hop_size: usize,
    sample_rate: u32,
    kept_bins: usize,
    window: Vec<f32>,
    window_gain: f32,
    fft: Arc<dyn Fft<f32>>,
}

impl SpectrogramBuilder {
    pub fn new(config: &SpectrogramConfig) -> Self {
        let window_size = config.window_size;
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(window_size);

        let window = hann_window(window_size);
        let window_gain = window.iter().sum::<f32>().max(f32::EPSILON);

        // Real input: only the first half plus the Nyquist bin carry information.
        let cutoff_bin = (config.max_frequency * window_size as f32 / config.sample_rate as f32)
            .floor() as usize
            + 1;
        let kept_bins = cutoff_bin.clamp(1, window_size / 2 + 1);

        Self {
            window_size,
            hop_size: config.hop_size,
            sample_rate: config.sample_rate,
            kept_bins,
            window,
            window_gain,
            fft,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn build(&self, samples: &[f32], sample_rate: u32) -> Result<Spectrogram> {
        if sample_rate != self.sample_rate {
            return Err(Error::SampleRateMismatch {
                expected: self.sample_rate,
                actual: sample_rate,
            });
        }
        if samples.len() < self.window_size {
            return Err(Error::InsufficientSamples {
                required: self.window_size,
                actual: samples.len(),
            });
        }

        let frame_count = (samples.len() - self.window_size) / self.hop_size + 1;
        let mut magnitudes = Vec::with_capacity(frame_count * self.kept_bins);
        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.window_size];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.fft.get_inplace_scratch_len()];

        let mut position = 0;
        while position + self.window_size <= samples.len() {
            let chunk = &samples[position..position + self.window_size];

            for ((slot, &sample), &weight) in buffer.iter_mut().zip(chunk).zip(&self.window) {
                *slot = Complex::new(sample * weight, 0.0);
            }

            self.fft.process_with_scratch(&mut buffer, &mut scratch);

            // Normalised so a full-scale sine peaks near half its amplitude
            // regardless of window size.
            magnitudes.extend(
                buffer[..self.kept_bins]
                    .iter()
                    .map(|c| c.norm() / self.window_gain),
            );

            position += self.hop_size;
        }

        tracing::debug!(
            frames = frame_count,
            bins = self.kept_bins,
            "built spectrogram"
        );

        Ok(Spectrogram {
            magnitudes,
            bins: self.kept_bins,
            hop_size: self.hop_size,
            window_size: self.window_size,
            sample_rate: self.sample_rate,
        })
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    let denom = (size as f32 - 1.0).max(1.0);
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / denom).cos()))
        .collect()
}
