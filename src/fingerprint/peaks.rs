use std::collections::VecDeque;

use ordered_float::OrderedFloat;

use crate::config::PeakConfig;
use crate::fft::Spectrogram;

/// A strict local maximum of the spectrogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Landmark {
    pub frame: usize,
    pub bin: usize,
    pub magnitude: OrderedFloat<f32>,
}

pub struct PeakExtractor {
    config: PeakConfig,
}

impl PeakExtractor {
    pub fn new(config: &PeakConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Landmarks ordered by frame, then bin.
    ///
    /// A cell qualifies when it beats every other cell within
    /// `time_radius` frames and `freq_radius` bins (equal magnitudes
    /// disqualify both) and clears the noise floor of its frame. The first
    /// and last `time_radius` frames are never landmarks; the frequency band
    /// is clipped at the spectrum edges.
    ///
    /// Ties are stricter than an earliest-wins rule: neither cell of an
    /// equal pair is kept, so no landmark is ever matched by a neighbour.
    /// Output order alone makes the result deterministic.
    pub fn extract(&self, spectrogram: &Spectrogram) -> Vec<Landmark> {
        let frames = spectrogram.frame_count();
        let bins = spectrogram.bin_count();
        let time_radius = self.config.time_radius;

        if bins == 0 || frames <= 2 * time_radius {
            return Vec::new();
        }

        let floors = self.noise_floors(spectrogram);

        // Max over the frequency band of every cell, row by row. The time
        // band is folded in per candidate below.
        let mut band_max = vec![0.0f32; frames * bins];
        for (frame, row) in spectrogram.frames().enumerate() {
            sliding_max(
                row,
                self.config.freq_radius,
                &mut band_max[frame * bins..(frame + 1) * bins],
            );
        }

        let mut landmarks = Vec::new();
        for frame in time_radius..frames - time_radius {
            let floor = floors[frame];
            for bin in 0..bins {
                let value = spectrogram.magnitude(frame, bin);
                if !(value > floor) {
                    continue;
                }

                let neighbourhood_max = (frame - time_radius..=frame + time_radius)
                    .map(|f| band_max[f * bins + bin])
                    .fold(f32::MIN, f32::max);
                if value < neighbourhood_max {
                    continue;
                }

                if self.dominates(spectrogram, frame, bin, value) {
                    landmarks.push(Landmark {
                        frame,
                        bin,
                        magnitude: OrderedFloat(value),
                    });
                }
            }
        }

        tracing::debug!(
            frames,
            landmarks = landmarks.len(),
            "extracted landmarks"
        );

        landmarks
    }

    /// Per-frame floor: the larger of the fixed floor and a multiple of the
    /// exponentially decaying mean frame magnitude.
    fn noise_floors(&self, spectrogram: &Spectrogram) -> Vec<f32> {
        let decay = self.config.floor_decay;
        let mut running: Option<f32> = None;

        spectrogram
            .frames()
            .map(|row| {
                let mean = row.iter().sum::<f32>() / row.len() as f32;
                let level = match running {
                    Some(previous) => decay * previous + (1.0 - decay) * mean,
                    None => mean,
                };
                running = Some(level);
                self.config.min_magnitude.max(self.config.adaptive_factor * level)
            })
            .collect()
    }

    fn dominates(&self, spectrogram: &Spectrogram, frame: usize, bin: usize, value: f32) -> bool {
        let bins = spectrogram.bin_count();
        let lo_bin = bin.saturating_sub(self.config.freq_radius);
        let hi_bin = (bin + self.config.freq_radius).min(bins - 1);

        for f in frame - self.config.time_radius..=frame + self.config.time_radius {
            for b in lo_bin..=hi_bin {
                if (f, b) != (frame, bin) && spectrogram.magnitude(f, b) >= value {
                    return false;
                }
            }
        }
        true
    }
}

/// `out[i]` = max of `values[i - radius..=i + radius]`, clipped at the edges.
fn sliding_max(values: &[f32], radius: usize, out: &mut [f32]) {
    let len = values.len();
    let mut window: VecDeque<usize> = VecDeque::with_capacity(2 * radius + 1);
    let mut next = 0;

    for i in 0..len {
        let hi = (i + radius).min(len - 1);
        while next <= hi {
            while window.back().is_some_and(|&back| values[back] <= values[next]) {
                window.pop_back();
            }
            window.push_back(next);
            next += 1;
        }

        let lo = i.saturating_sub(radius);
        while window.front().is_some_and(|&front| front < lo) {
            window.pop_front();
        }

        out[i] = window.front().map_or(values[i], |&front| values[front]);
    }
}
