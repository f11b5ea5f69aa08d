#![allow(dead_code)]

use std::collections::HashSet;
use std::env;
use std::future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use songmark::db::{LookupResult, NewTrack, StoreStats};
use songmark::{
    Config, Error, Fingerprint, FingerprintStore, HashCode, MemoryStore, Recognizer, Result,
    SampleBuffer, Track, TrackId,
};

pub fn recognizer_with<S: FingerprintStore>(store: S, timeout_ms: u64) -> Recognizer<S> {
    let mut config = Config::default();
    config.store.timeout_ms = timeout_ms;
    Recognizer::new(Arc::new(store), config).unwrap()
}

pub fn memory_recognizer() -> Recognizer<MemoryStore> {
    recognizer_with(MemoryStore::new(), 10_000)
}

pub fn temp_path(name: &str) -> PathBuf {
    env::temp_dir().join(format!("songmark-it-{}-{}", std::process::id(), name))
}

pub fn write_wav(path: &Path, buffer: &SampleBuffer) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for &sample in &buffer.samples {
        writer
            .write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
}

fn offline() -> Error {
    Error::StoreUnavailable("connection refused".to_string())
}

/// A store whose backend is down.
pub struct OfflineStore;

impl FingerprintStore for OfflineStore {
    async fn create_track(&self, _: NewTrack, _: Duration) -> Result<Track> {
        Err(offline())
    }

    async fn insert_many(&self, _: TrackId, _: Vec<Fingerprint>, _: Duration) -> Result<u64> {
        Err(offline())
    }

    async fn lookup(&self, _: &HashSet<HashCode>, _: Duration) -> Result<LookupResult> {
        Err(offline())
    }

    async fn remove_track(&self, _: TrackId, _: Duration) -> Result<u64> {
        Err(offline())
    }

    async fn tracks(&self, _: &[TrackId], _: Duration) -> Result<Vec<Track>> {
        Err(offline())
    }

    async fn list_tracks(&self, _: Duration) -> Result<Vec<Track>> {
        Err(offline())
    }

    async fn find_by_content_hash(&self, _: &str, _: Duration) -> Result<Option<Track>> {
        Err(offline())
    }

    async fn purge_unfingerprinted(&self, _: Duration) -> Result<Vec<TrackId>> {
        Err(offline())
    }

    async fn stats(&self, _: Duration) -> Result<StoreStats> {
        Err(offline())
    }
}

/// A store that accepts calls and never answers, ignoring the timeout it
/// is given.
pub struct StalledStore;

impl FingerprintStore for StalledStore {
    async fn create_track(&self, _: NewTrack, _: Duration) -> Result<Track> {
        future::pending().await
    }

    async fn insert_many(&self, _: TrackId, _: Vec<Fingerprint>, _: Duration) -> Result<u64> {
        future::pending().await
    }

    async fn lookup(&self, _: &HashSet<HashCode>, _: Duration) -> Result<LookupResult> {
        future::pending().await
    }

    async fn remove_track(&self, _: TrackId, _: Duration) -> Result<u64> {
        future::pending().await
    }

    async fn tracks(&self, _: &[TrackId], _: Duration) -> Result<Vec<Track>> {
        future::pending().await
    }

    async fn list_tracks(&self, _: Duration) -> Result<Vec<Track>> {
        future::pending().await
    }

    async fn find_by_content_hash(&self, _: &str, _: Duration) -> Result<Option<Track>> {
        future::pending().await
    }

    async fn purge_unfingerprinted(&self, _: Duration) -> Result<Vec<TrackId>> {
        future::pending().await
    }

    async fn stats(&self, _: Duration) -> Result<StoreStats> {
        future::pending().await
    }
}

/// Memory store whose fingerprint inserts fail halfway, as a database
/// losing its connection between batches would.
#[derive(Default)]
pub struct BrokenInsertStore {
    pub inner: MemoryStore,
}

impl FingerprintStore for BrokenInsertStore {
    async fn create_track(&self, track: NewTrack, timeout: Duration) -> Result<Track> {
        self.inner.create_track(track, timeout).await
    }

    async fn insert_many(&self, track_id: TrackId, _: Vec<Fingerprint>, _: Duration) -> Result<u64> {
        Err(Error::PartialIngestFailure {
            track_id,
            source: Box::new(offline()),
        })
    }

    async fn lookup(&self, hashes: &HashSet<HashCode>, timeout: Duration) -> Result<LookupResult> {
        self.inner.lookup(hashes, timeout).await
    }

    async fn remove_track(&self, track_id: TrackId, timeout: Duration) -> Result<u64> {
        self.inner.remove_track(track_id, timeout).await
    }

    async fn tracks(&self, ids: &[TrackId], timeout: Duration) -> Result<Vec<Track>> {
        self.inner.tracks(ids, timeout).await
    }

    async fn list_tracks(&self, timeout: Duration) -> Result<Vec<Track>> {
        self.inner.list_tracks(timeout).await
    }

    async fn find_by_content_hash(&self, hash: &str, timeout: Duration) -> Result<Option<Track>> {
        self.inner.find_by_content_hash(hash, timeout).await
    }

    async fn purge_unfingerprinted(&self, timeout: Duration) -> Result<Vec<TrackId>> {
        self.inner.purge_unfingerprinted(timeout).await
    }

    async fn stats(&self, timeout: Duration) -> Result<StoreStats> {
        self.inner.stats(timeout).await
    }
}

/// Memory store where another writer catalogues and fingerprints the same
/// content just before each `create_track` lands.
#[derive(Default)]
pub struct RacingStore {
    pub inner: MemoryStore,
}

impl FingerprintStore for RacingStore {
    async fn create_track(&self, track: NewTrack, timeout: Duration) -> Result<Track> {
        let theirs = NewTrack {
            name: "other writer".to_string(),
            ..track.clone()
        };
        let theirs = self.inner.create_track(theirs, timeout).await?;
        self.inner
            .insert_many(theirs.id, vec![Fingerprint { hash: 1, time_offset: 0 }], timeout)
            .await?;
        self.inner.create_track(track, timeout).await
    }

    async fn insert_many(
        &self,
        track_id: TrackId,
        fingerprints: Vec<Fingerprint>,
        timeout: Duration,
    ) -> Result<u64> {
        self.inner.insert_many(track_id, fingerprints, timeout).await
    }

    async fn lookup(&self, hashes: &HashSet<HashCode>, timeout: Duration) -> Result<LookupResult> {
        self.inner.lookup(hashes, timeout).await
    }

    async fn remove_track(&self, track_id: TrackId, timeout: Duration) -> Result<u64> {
        self.inner.remove_track(track_id, timeout).await
    }

    async fn tracks(&self, ids: &[TrackId], timeout: Duration) -> Result<Vec<Track>> {
        self.inner.tracks(ids, timeout).await
    }

    async fn list_tracks(&self, timeout: Duration) -> Result<Vec<Track>> {
        self.inner.list_tracks(timeout).await
    }

    async fn find_by_content_hash(&self, hash: &str, timeout: Duration) -> Result<Option<Track>> {
        self.inner.find_by_content_hash(hash, timeout).await
    }

    async fn purge_unfingerprinted(&self, timeout: Duration) -> Result<Vec<TrackId>> {
        self.inner.purge_unfingerprinted(timeout).await
    }

    async fn stats(&self, timeout: Duration) -> Result<StoreStats> {
        self.inner.stats(timeout).await
    }
}
