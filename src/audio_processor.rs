use std::f32::consts::PI;
use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use symphonia::core::audio::SampleBuffer as PcmBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Mono PCM at a known rate.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl SampleBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }

    /// Keeps at most the first `seconds` of audio.
    pub fn truncate_secs(&mut self, seconds: f32) {
        let keep = (seconds * self.sample_rate as f32) as usize;
        self.samples.truncate(keep);
    }

    /// Copy of `[start_ms, start_ms + length_ms)`, clipped to the buffer.
    pub fn slice_ms(&self, start_ms: u64, length_ms: u64) -> SampleBuffer {
        let to_index = |ms: u64| ((ms * self.sample_rate as u64 / 1000) as usize).min(self.samples.len());
        let start = to_index(start_ms);
        let end = to_index(start_ms + length_ms);
        SampleBuffer::new(self.samples[start..end].to_vec(), self.sample_rate)
    }
}

/// Anything that can hand the pipeline a buffer of samples.
///
/// Fingerprinting and matching are identical whatever the source is; only
/// where the samples come from differs.
pub trait SampleSource {
    /// Human-readable label, used as the track name on ingest.
    fn name(&self) -> String;

    fn produce_sample_buffer(&self) -> Result<SampleBuffer>;

    /// Hash of the raw content, used to skip re-ingesting the same file.
    fn content_hash(&self) -> Result<Option<String>> {
        Ok(None)
    }

    fn source_path(&self) -> Option<String> {
        None
    }
}

/// Decodes containers through symphonia, mixes down to mono, filters and
/// resamples to the pipeline rate.
#[derive(Debug, Clone)]
pub struct AudioProcessor {
    target_sample_rate: u32,
    low_pass_hz: f32,
}

impl AudioProcessor {
    pub fn new(target_sample_rate: u32, low_pass_hz: f32) -> Self {
        Self {
            target_sample_rate,
            low_pass_hz,
        }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    pub fn decode_file(&self, path: &Path) -> Result<SampleBuffer> {
        let file = File::open(path)?;

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(extension);
        }

        let (samples, sample_rate) = self.generate_audio_samples(Box::new(file), hint)?;
        info!(
            path = %path.display(),
            samples = samples.len(),
            sample_rate,
            "decoded audio file"
        );
        Ok(self.condition(samples, sample_rate))
    }

    pub fn decode_bytes(&self, bytes: Vec<u8>) -> Result<SampleBuffer> {
        let (samples, sample_rate) =
            self.generate_audio_samples(Box::new(Cursor::new(bytes)), Hint::new())?;
        Ok(self.condition(samples, sample_rate))
    }

    /// Low-pass then resample raw mono samples to the pipeline rate.
    pub fn condition(&self, samples: Vec<f32>, sample_rate: u32) -> SampleBuffer {
        if sample_rate == self.target_sample_rate {
            return SampleBuffer::new(samples, sample_rate);
        }

        let cutoff = self.low_pass_hz.min(self.target_sample_rate as f32 / 2.0);
        let filtered = apply_low_pass_filter(&samples, sample_rate, cutoff);
        let resampled = resample_linear(&filtered, sample_rate, self.target_sample_rate);
        SampleBuffer::new(resampled, self.target_sample_rate)
    }

    fn generate_audio_samples(
        &self,
        source: Box<dyn MediaSource>,
        hint: Hint,
    ) -> Result<(Vec<f32>, u32)> {
        let stream = MediaSourceStream::new(source, Default::default());

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                stream,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| Error::Decode(e.to_string()))?;
        let mut format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| Error::Decode("no audio track".to_string()))?;
        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| Error::Decode("unknown sample rate".to_string()))?;
        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(e.to_string()))?;

        let mut decoded_audio_samples = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                // EOF
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(Error::Decode(e.to_string())),
            };
            if packet.track_id() != track_id {
                continue;
            }

            let decoded_packet = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(reason)) => {
                    debug!(reason, "skipping corrupt packet");
                    continue;
                }
                Err(e) => return Err(Error::Decode(e.to_string())),
            };

            let num_channels = decoded_packet.spec().channels.count().max(1);
            let mut sample_buf =
                PcmBuffer::<f32>::new(decoded_packet.capacity() as u64, *decoded_packet.spec());
            sample_buf.copy_interleaved_ref(decoded_packet);

            decoded_audio_samples.extend(
                sample_buf
                    .samples()
                    .chunks(num_channels)
                    .map(|frame| frame.iter().sum::<f32>() / num_channels as f32),
            );
        }

        Ok((decoded_audio_samples, sample_rate))
    }
}

pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / ratio) as usize;
    let mut resampled = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let in_idx_float = i as f64 * ratio;
        let in_idx_int = in_idx_float.floor() as usize;
        let frac = in_idx_float.fract() as f32;

        if in_idx_int + 1 < samples.len() {
            let p1 = samples[in_idx_int];
            let p2 = samples[in_idx_int + 1];
            resampled.push(p1 + frac * (p2 - p1));
        } else if in_idx_int < samples.len() {
            resampled.push(samples[in_idx_int]);
        } else {
            break;
        }
    }
    resampled
}

/// One-pole RC low-pass; keeps aliasing down before resampling.
pub fn apply_low_pass_filter(samples: &[f32], sample_rate: u32, cutoff_freq: f32) -> Vec<f32> {
    let Some(&first) = samples.first() else {
        return Vec::new();
    };

    let rc = 1.0 / (2.0 * PI * cutoff_freq);
    let dt = 1.0 / sample_rate as f32;
    let alpha = dt / (rc + dt);

    let mut filtered = Vec::with_capacity(samples.len());
    let mut previous = first;
    filtered.push(previous);
    for &sample in &samples[1..] {
        // y[i] = y[i-1] + alpha * (x[i] - y[i-1])
        previous += alpha * (sample - previous);
        filtered.push(previous);
    }
    filtered
}

/// A file on disk, decoded on demand.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    processor: AudioProcessor,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, processor: AudioProcessor) -> Self {
        Self {
            path: path.into(),
            processor,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SampleSource for FileSource {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    fn produce_sample_buffer(&self) -> Result<SampleBuffer> {
        self.processor.decode_file(&self.path)
    }

    fn content_hash(&self) -> Result<Option<String>> {
        let bytes = fs::read(&self.path)?;
        Ok(Some(sha256::digest(bytes)))
    }

    fn source_path(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }
}

/// An encoded upload held in memory.
#[derive(Debug, Clone)]
pub struct BytesSource {
    name: String,
    bytes: Vec<u8>,
    processor: AudioProcessor,
}

impl BytesSource {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, processor: AudioProcessor) -> Self {
        Self {
            name: name.into(),
            bytes,
            processor,
        }
    }
}

impl SampleSource for BytesSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn produce_sample_buffer(&self) -> Result<SampleBuffer> {
        self.processor.decode_bytes(self.bytes.clone())
    }

    fn content_hash(&self) -> Result<Option<String>> {
        Ok(Some(sha256::digest(self.bytes.clone())))
    }
}

/// Samples that are already decoded.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    buffer: SampleBuffer,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, buffer: SampleBuffer) -> Self {
        Self {
            name: name.into(),
            buffer,
        }
    }
}

impl SampleSource for MemorySource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn produce_sample_buffer(&self) -> Result<SampleBuffer> {
        Ok(self.buffer.clone())
    }
}

#[cfg(feature = "microphone")]
pub use microphone::MicrophoneSource;

#[cfg(feature = "microphone")]
mod microphone {
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tracing::warn;

    use super::{AudioProcessor, SampleBuffer, SampleSource};
    use crate::error::{Error, Result};

    /// Records from the default input device for a fixed time.
    #[derive(Debug, Clone)]
    pub struct MicrophoneSource {
        duration: Duration,
        processor: AudioProcessor,
    }

    impl MicrophoneSource {
        pub fn new(duration: Duration, processor: AudioProcessor) -> Self {
            Self {
                duration,
                processor,
            }
        }

        fn record_audio(&self) -> Result<(Vec<f32>, u32)> {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| Error::Capture("no input device found".to_string()))?;
            let config = device
                .default_input_config()
                .map_err(|e| Error::Capture(e.to_string()))?;
            let channels = config.channels().max(1) as usize;
            let sample_rate = config.sample_rate().0;

            let recorded_samples = Arc::new(Mutex::new(Vec::new()));
            let samples_clone = recorded_samples.clone();
            let err_fn = |err| warn!(%err, "input stream error");

            let stream = match config.sample_format() {
                cpal::SampleFormat::F32 => device.build_input_stream(
                    &config.clone().into(),
                    move |data: &[f32], _: &_| {
                        if let Ok(mut samples) = samples_clone.lock() {
                            samples.extend(
                                data.chunks(channels)
                                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                            );
                        }
                    },
                    err_fn,
                    None,
                ),
                cpal::SampleFormat::I16 => device.build_input_stream(
                    &config.clone().into(),
                    move |data: &[i16], _: &_| {
                        if let Ok(mut samples) = samples_clone.lock() {
                            samples.extend(data.chunks(channels).map(|frame| {
                                frame.iter().map(|&s| s as f32 / i16::MAX as f32).sum::<f32>()
                                    / channels as f32
                            }));
                        }
                    },
                    err_fn,
                    None,
                ),
                other => {
                    return Err(Error::Capture(format!("unsupported sample format {other:?}")));
                }
            }
            .map_err(|e| Error::Capture(e.to_string()))?;

            stream.play().map_err(|e| Error::Capture(e.to_string()))?;
            thread::sleep(self.duration);
            drop(stream);

            let samples = recorded_samples
                .lock()
                .map_err(|_| Error::Capture("capture buffer poisoned".to_string()))?
                .clone();
            Ok((samples, sample_rate))
        }
    }

    impl SampleSource for MicrophoneSource {
        fn name(&self) -> String {
            "microphone".to_string()
        }

        fn produce_sample_buffer(&self) -> Result<SampleBuffer> {
            let (samples, sample_rate) = self.record_audio()?;
            Ok(self.processor.condition(samples, sample_rate))
        }
    }
}
