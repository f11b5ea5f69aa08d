use serde::Serialize;

use crate::config::{HashConfig, SpectrogramConfig};
use crate::fingerprint::peaks::Landmark;

pub type HashCode = u64;

const FREQ_BITS: u32 = 16;
const DELTA_BITS: u32 = 16;
pub const FREQ_MASK: u64 = (1 << FREQ_BITS) - 1;
pub const DELTA_MASK: u64 = (1 << DELTA_BITS) - 1;

/// One anchor/target pair, tagged with where its anchor sits in the audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint {
    pub hash: HashCode,
    /// Anchor position in milliseconds from the start of the buffer.
    pub time_offset: u32,
}

/// Packs `anchor | target | delta` into a 48-bit code.
///
/// Nothing absolute goes in, so a pair hashes the same wherever it occurs.
pub fn pack(anchor_bin: usize, target_bin: usize, time_delta: usize) -> HashCode {
    ((anchor_bin as u64 & FREQ_MASK) << (FREQ_BITS + DELTA_BITS))
        | ((target_bin as u64 & FREQ_MASK) << DELTA_BITS)
        | (time_delta as u64 & DELTA_MASK)
}

pub fn unpack(hash: HashCode) -> (usize, usize, usize) {
    (
        ((hash >> (FREQ_BITS + DELTA_BITS)) & FREQ_MASK) as usize,
        ((hash >> DELTA_BITS) & FREQ_MASK) as usize,
        (hash & DELTA_MASK) as usize,
    )
}

pub struct FingerprintHasher {
    config: HashConfig,
    hop_size: usize,
    sample_rate: u32,
}

impl FingerprintHasher {
    pub fn new(config: &HashConfig, spectrogram: &SpectrogramConfig) -> Self {
        Self {
            config: config.clone(),
            hop_size: spectrogram.hop_size,
            sample_rate: spectrogram.sample_rate,
        }
    }

    /// Pairs each landmark with up to `fan_out` later landmarks inside the
    /// target zone. Expects landmarks ordered by frame, as the extractor
    /// returns them.
    pub fn hash(&self, landmarks: &[Landmark]) -> Vec<Fingerprint> {
        let mut fingerprints = Vec::with_capacity(landmarks.len() * self.config.fan_out);

        for (idx, anchor) in landmarks.iter().enumerate() {
            let time_offset = self.frame_to_ms(anchor.frame);
            let mut paired = 0;

            for target in &landmarks[idx + 1..] {
                let Some(time_delta) = target.frame.checked_sub(anchor.frame) else {
                    continue;
                };
                if time_delta > self.config.max_time_delta {
                    break;
                }
                if time_delta < self.config.min_time_delta
                    || anchor.bin.abs_diff(target.bin) > self.config.max_freq_delta
                {
                    continue;
                }

                fingerprints.push(Fingerprint {
                    hash: pack(anchor.bin, target.bin, time_delta),
                    time_offset,
                });

                paired += 1;
                if paired == self.config.fan_out {
                    break;
                }
            }
        }

        fingerprints
    }

    pub fn frame_to_ms(&self, frame: usize) -> u32 {
        let sample = frame as u64 * self.hop_size as u64;
        let rate = self.sample_rate as u64;
        ((sample * 1000 + rate / 2) / rate) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordered_float::OrderedFloat;

    fn landmark(frame: usize, bin: usize) -> Landmark {
        Landmark {
            frame,
            bin,
            magnitude: OrderedFloat(1.0),
        }
    }

    fn hasher(config: HashConfig) -> FingerprintHasher {
        FingerprintHasher::new(&config, &SpectrogramConfig::default())
    }

    fn zone(fan_out: usize) -> HashConfig {
        HashConfig {
            fan_out,
            min_time_delta: 1,
            max_time_delta: 10,
            max_freq_delta: 50,
        }
    }

    #[test]
    fn pack_keeps_fields_apart() {
        let hash = pack(928, 3, 40);
        assert_eq!(unpack(hash), (928, 3, 40));
        assert_ne!(pack(1, 2, 3), pack(2, 1, 3));
        assert_ne!(pack(1, 2, 3), pack(1, 2, 4));
        assert!(hash < 1 << 48);
    }

    #[test]
    fn pairs_within_the_target_zone_only() {
        let landmarks = vec![
            landmark(10, 100),
            landmark(10, 120), // same frame as the anchor
            landmark(12, 130),
            landmark(13, 400), // too far in frequency
            landmark(25, 100), // too far in time
        ];

        let fingerprints = hasher(zone(10)).hash(&landmarks);

        let from_first: Vec<(usize, usize, usize)> = fingerprints
            .iter()
            .filter(|f| f.time_offset == hasher(zone(10)).frame_to_ms(10))
            .map(|f| unpack(f.hash))
            .collect();
        assert_eq!(from_first, vec![(100, 130, 2), (120, 130, 2)]);
    }

    #[test]
    fn fan_out_caps_pairs_per_anchor() {
        let landmarks: Vec<Landmark> = (0..8).map(|i| landmark(5 + i, 200 + i)).collect();
        let fingerprints = hasher(zone(3)).hash(&landmarks);

        let first_offset = fingerprints[0].time_offset;
        let targets: Vec<usize> = fingerprints
            .iter()
            .filter(|f| f.time_offset == first_offset)
            .map(|f| unpack(f.hash).1)
            .collect();
        assert_eq!(targets, vec![201, 202, 203]);
    }

    #[test]
    fn hashing_is_deterministic() {
        let landmarks: Vec<Landmark> = (0..30)
            .map(|i| landmark(i * 2 + (i % 3), 50 + (i * 37) % 200))
            .collect();
        let hasher = hasher(HashConfig::default());

        assert_eq!(hasher.hash(&landmarks), hasher.hash(&landmarks));
    }

    #[test]
    fn shifting_landmarks_only_moves_offsets() {
        let landmarks: Vec<Landmark> = (0..25)
            .map(|i| landmark(i * 3 + 4, 80 + (i * 53) % 300))
            .collect();
        let shifted: Vec<Landmark> = landmarks
            .iter()
            .map(|l| landmark(l.frame + 100, l.bin))
            .collect();

        let hasher = hasher(HashConfig::default());
        let original = hasher.hash(&landmarks);
        let moved = hasher.hash(&shifted);

        assert_eq!(original.len(), moved.len());
        let shift_ms = hasher.frame_to_ms(100) as i64;
        for (a, b) in original.iter().zip(&moved) {
            assert_eq!(a.hash, b.hash);
            let drift = b.time_offset as i64 - a.time_offset as i64 - shift_ms;
            assert!(drift.abs() <= 1, "offset drift {drift}");
        }
    }

    #[test]
    fn offsets_are_anchor_times_in_ms() {
        let hasher = hasher(HashConfig::default());
        assert_eq!(hasher.frame_to_ms(0), 0);
        // 512 samples at 11025 Hz
        assert_eq!(hasher.frame_to_ms(1), 46);
        assert_eq!(hasher.frame_to_ms(441), 20_480);
    }
}
