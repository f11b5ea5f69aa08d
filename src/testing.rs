//! Deterministic synthetic audio for tests and the evaluation harness.

use std::f32::consts::PI;

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::audio_processor::SampleBuffer;

pub fn silence(seconds: f32, sample_rate: u32) -> SampleBuffer {
    SampleBuffer::new(vec![0.0; (seconds * sample_rate as f32) as usize], sample_rate)
}

/// Uniform noise in `[-amplitude, amplitude]`.
pub fn white_noise(seed: u64, seconds: f32, sample_rate: u32, amplitude: f32) -> SampleBuffer {
    let mut rng = StdRng::seed_from_u64(seed);
    let total = (seconds * sample_rate as f32) as usize;
    let samples = (0..total)
        .map(|_| rng.random_range(-amplitude..=amplitude))
        .collect();
    SampleBuffer::new(samples, sample_rate)
}

/// A melody of short decaying notes with a few partials each.
///
/// Every seed gives a different, reproducible track. Note onsets make clear
/// time-frequency peaks, which is what the fingerprinter keys on.
pub fn synthetic_track(seed: u64, seconds: f32, sample_rate: u32) -> SampleBuffer {
    let mut rng = StdRng::seed_from_u64(seed);
    let rate = sample_rate as f32;
    let total = (seconds * rate) as usize;
    let mut samples = vec![0.0f32; total];

    let attack = (0.005 * rate) as usize;
    let release = (0.010 * rate) as usize;

    let mut start = 0usize;
    while start < total {
        let length = (rng.random_range(0.2..0.4) * rate) as usize;
        let end = (start + length).min(total);

        let partials = rng.random_range(2..=3);
        for _ in 0..partials {
            let freq = rng.random_range(300.0..4000.0f32);
            let amplitude = rng.random_range(0.1..0.3f32);
            let phase = rng.random_range(0.0..2.0 * PI);

            for (i, slot) in samples[start..end].iter_mut().enumerate() {
                let t = i as f32 / rate;
                let remaining = end - start - i;
                let envelope = (i as f32 / attack.max(1) as f32).min(1.0)
                    * (remaining as f32 / release.max(1) as f32).min(1.0)
                    * (-t / 0.12).exp();
                *slot += amplitude * envelope * (2.0 * PI * freq * t + phase).sin();
            }
        }

        start = end;
    }

    SampleBuffer::new(samples, sample_rate)
}

/// Adds seeded noise at `amplitude` to a copy of `buffer`.
pub fn with_noise(buffer: &SampleBuffer, seed: u64, amplitude: f32) -> SampleBuffer {
    let noise = white_noise(
        seed,
        buffer.samples.len() as f32 / buffer.sample_rate as f32 + 1.0,
        buffer.sample_rate,
        amplitude,
    );
    let samples = buffer
        .samples
        .iter()
        .zip(&noise.samples)
        .map(|(s, n)| s + n)
        .collect();
    SampleBuffer::new(samples, buffer.sample_rate)
}
