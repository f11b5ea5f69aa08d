use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tracing::debug;

use crate::db::store::{
    FingerprintStore, LookupResult, NewTrack, StoreStats, Track, TrackId, distinct_records,
    with_deadline,
};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, HashCode};

#[derive(Debug)]
struct Catalog {
    next_id: i32,
    tracks: BTreeMap<TrackId, Track>,
    index: HashMap<HashCode, Vec<(TrackId, u32)>>,
    /// Distinct hashes per track, so removal only visits its own entries.
    by_track: HashMap<TrackId, Vec<HashCode>>,
    fingerprints: u64,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            next_id: 1,
            tracks: BTreeMap::new(),
            index: HashMap::new(),
            by_track: HashMap::new(),
            fingerprints: 0,
        }
    }
}

/// In-process catalog. Each write is one critical section, so a reader
/// sees all of a track's records or none of them. Index entries are built
/// before the lock is taken; the locked part only splices them in.
#[derive(Debug, Default)]
pub struct MemoryStore {
    catalog: RwLock<Catalog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FingerprintStore for MemoryStore {
    async fn create_track(&self, track: NewTrack, timeout: Duration) -> Result<Track> {
        with_deadline(timeout, async {
            let mut catalog = self.catalog.write().await;
            if let Some(hash) = track.content_hash.as_deref() {
                if let Some(existing) = catalog
                    .tracks
                    .values()
                    .find(|t| t.content_hash.as_deref() == Some(hash))
                {
                    return Err(Error::DuplicateContent(existing.id));
                }
            }

            let id = TrackId(catalog.next_id);
            catalog.next_id += 1;

            let track = Track {
                id,
                name: track.name,
                source_path: track.source_path,
                content_hash: track.content_hash,
                duration_ms: track.duration_ms,
                fingerprint_count: 0,
                fingerprinted: false,
                created_at: SystemTime::now(),
            };
            catalog.tracks.insert(id, track.clone());
            Ok(track)
        })
        .await
    }

    async fn insert_many(
        &self,
        track_id: TrackId,
        fingerprints: Vec<Fingerprint>,
        timeout: Duration,
    ) -> Result<u64> {
        let records = distinct_records(&fingerprints);
        let stored = records.len() as u64;
        let entries = group_by_hash(&records);
        let hashes: Vec<HashCode> = entries.iter().map(|(hash, _)| *hash).collect();

        with_deadline(timeout, async move {
            let mut catalog = self.catalog.write().await;
            match catalog.tracks.get(&track_id) {
                None => return Err(Error::UnknownTrack(track_id)),
                Some(track) if track.fingerprinted => {
                    return Err(Error::AlreadyFingerprinted(track_id));
                }
                Some(_) => {}
            }

            for (hash, offsets) in entries {
                catalog
                    .index
                    .entry(hash)
                    .or_default()
                    .extend(offsets.into_iter().map(|offset| (track_id, offset)));
            }
            catalog.by_track.insert(track_id, hashes);
            catalog.fingerprints += stored;
            if let Some(track) = catalog.tracks.get_mut(&track_id) {
                track.fingerprint_count = stored;
                track.fingerprinted = true;
            }

            debug!(%track_id, stored, "stored fingerprints");
            Ok(stored)
        })
        .await
    }

    async fn lookup(&self, hashes: &HashSet<HashCode>, timeout: Duration) -> Result<LookupResult> {
        with_deadline(timeout, async {
            let catalog = self.catalog.read().await;
            let mut found = LookupResult::with_capacity(hashes.len());
            for hash in hashes {
                if let Some(occurrences) = catalog.index.get(hash) {
                    let mut occurrences = occurrences.clone();
                    occurrences.sort_unstable();
                    found.insert(*hash, occurrences);
                }
            }
            Ok(found)
        })
        .await
    }

    async fn remove_track(&self, track_id: TrackId, timeout: Duration) -> Result<u64> {
        with_deadline(timeout, async {
            let mut catalog = self.catalog.write().await;
            if catalog.tracks.remove(&track_id).is_none() {
                return Err(Error::UnknownTrack(track_id));
            }

            let mut removed = 0u64;
            for hash in catalog.by_track.remove(&track_id).unwrap_or_default() {
                if let Some(occurrences) = catalog.index.get_mut(&hash) {
                    let before = occurrences.len();
                    occurrences.retain(|(id, _)| *id != track_id);
                    removed += (before - occurrences.len()) as u64;
                    if occurrences.is_empty() {
                        catalog.index.remove(&hash);
                    }
                }
            }
            catalog.fingerprints -= removed;

            debug!(%track_id, removed, "removed track");
            Ok(removed)
        })
        .await
    }

    async fn tracks(&self, ids: &[TrackId], timeout: Duration) -> Result<Vec<Track>> {
        with_deadline(timeout, async {
            let catalog = self.catalog.read().await;
            let wanted: HashSet<&TrackId> = ids.iter().collect();
            Ok(catalog
                .tracks
                .values()
                .filter(|track| wanted.contains(&track.id))
                .cloned()
                .collect())
        })
        .await
    }

    async fn list_tracks(&self, timeout: Duration) -> Result<Vec<Track>> {
        with_deadline(timeout, async {
            Ok(self.catalog.read().await.tracks.values().cloned().collect())
        })
        .await
    }

    async fn find_by_content_hash(
        &self,
        content_hash: &str,
        timeout: Duration,
    ) -> Result<Option<Track>> {
        with_deadline(timeout, async {
            let catalog = self.catalog.read().await;
            Ok(catalog
                .tracks
                .values()
                .find(|track| track.content_hash.as_deref() == Some(content_hash))
                .cloned())
        })
        .await
    }

    async fn purge_unfingerprinted(&self, timeout: Duration) -> Result<Vec<TrackId>> {
        with_deadline(timeout, async {
            let mut catalog = self.catalog.write().await;
            let stale: Vec<TrackId> = catalog
                .tracks
                .values()
                .filter(|track| !track.fingerprinted)
                .map(|track| track.id)
                .collect();
            for id in &stale {
                catalog.tracks.remove(id);
            }
            Ok(stale)
        })
        .await
    }

    async fn stats(&self, timeout: Duration) -> Result<StoreStats> {
        with_deadline(timeout, async {
            let catalog = self.catalog.read().await;
            Ok(StoreStats {
                tracks: catalog.tracks.len() as u64,
                fingerprinted_tracks: catalog.tracks.values().filter(|t| t.fingerprinted).count()
                    as u64,
                fingerprints: catalog.fingerprints,
            })
        })
        .await
    }
}

/// Offsets per hash, from records sorted by hash.
fn group_by_hash(records: &[(HashCode, u32)]) -> Vec<(HashCode, Vec<u32>)> {
    let mut grouped: Vec<(HashCode, Vec<u32>)> = Vec::new();
    for &(hash, offset) in records {
        match grouped.last_mut() {
            Some((last, offsets)) if *last == hash => offsets.push(offset),
            _ => grouped.push((hash, vec![offset])),
        }
    }
    grouped
}
