use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, HashCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub i32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A catalog entry. Its fingerprints are owned by it and go away with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    pub source_path: Option<String>,
    pub content_hash: Option<String>,
    pub duration_ms: u64,
    pub fingerprint_count: u64,
    /// Set together with the fingerprint insert. A track without it is not
    /// matchable and may be purged.
    pub fingerprinted: bool,
    #[serde(skip)]
    pub created_at: SystemTime,
}

impl Track {
    /// Time since the row was created. Zero if the clock went backwards.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTrack {
    pub name: String,
    pub source_path: Option<String>,
    pub content_hash: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub tracks: u64,
    pub fingerprinted_tracks: u64,
    pub fingerprints: u64,
}

/// Every stored `(track, offset_ms)` for each requested hash that exists,
/// sorted. Hashes with no occurrences are absent.
pub type LookupResult = HashMap<HashCode, Vec<(TrackId, u32)>>;

/// Persists `(hash, track, offset)` records and answers batched lookups.
///
/// Every call takes a timeout and fails with [`Error::Timeout`] or
/// [`Error::StoreUnavailable`] instead of blocking past it. An error is
/// never reported as an empty result.
pub trait FingerprintStore: Send + Sync + 'static {
    /// Adds an unfingerprinted track. Fails with [`Error::DuplicateContent`]
    /// if a track with the same content hash exists.
    fn create_track(
        &self,
        track: NewTrack,
        timeout: Duration,
    ) -> impl Future<Output = Result<Track>> + Send;

    /// Stores all fingerprints of a track at once and marks it
    /// fingerprinted. Either every record becomes visible or none does.
    /// Duplicate `(hash, offset)` pairs are stored once; returns the number
    /// of records stored.
    fn insert_many(
        &self,
        track_id: TrackId,
        fingerprints: Vec<Fingerprint>,
        timeout: Duration,
    ) -> impl Future<Output = Result<u64>> + Send;

    fn lookup(
        &self,
        hashes: &HashSet<HashCode>,
        timeout: Duration,
    ) -> impl Future<Output = Result<LookupResult>> + Send;

    /// Deletes a track and all of its records; returns how many records
    /// went with it.
    fn remove_track(
        &self,
        track_id: TrackId,
        timeout: Duration,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// The subset of `ids` that exist, ordered by id.
    fn tracks(
        &self,
        ids: &[TrackId],
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Track>>> + Send;

    fn list_tracks(&self, timeout: Duration) -> impl Future<Output = Result<Vec<Track>>> + Send;

    fn find_by_content_hash(
        &self,
        content_hash: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Track>>> + Send;

    /// Drops tracks that never received their fingerprints.
    fn purge_unfingerprinted(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<TrackId>>> + Send;

    fn stats(&self, timeout: Duration) -> impl Future<Output = Result<StoreStats>> + Send;
}

/// Runs `future`, turning an expired deadline into [`Error::Timeout`].
pub async fn with_deadline<T>(
    timeout: Duration,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

/// Sorted, duplicate-free `(hash, offset)` pairs.
pub(crate) fn distinct_records(fingerprints: &[Fingerprint]) -> Vec<(HashCode, u32)> {
    let mut records: Vec<(HashCode, u32)> = fingerprints
        .iter()
        .map(|fp| (fp.hash, fp.time_offset))
        .collect();
    records.sort_unstable();
    records.dedup();
    records
}
