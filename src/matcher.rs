use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;
use twox_hash::xxhash64::State;

use crate::config::MatchConfig;
use crate::db::{FingerprintStore, LookupResult, TrackId};
use crate::error::Result;
use crate::fingerprint::{Fingerprint, HashCode};

type FastMap<K, V> = HashMap<K, V, State>;

fn fast_map<K, V>() -> FastMap<K, V> {
    HashMap::with_hasher(State::with_seed(0))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub track_id: TrackId,
    /// Height of the tallest alignment bucket.
    pub vote_count: usize,
    /// Stored offset minus query offset at that bucket: where the query
    /// starts inside the track.
    pub offset_ms: i64,
    pub confidence: f32,
    /// Query hashes that hit this track at any alignment.
    pub matched_hashes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched(MatchCandidate),
    /// The query had hashes but no track cleared the thresholds.
    NoMatch,
    /// Nothing to match: the query produced no hashes at all.
    EmptyQuery,
}

impl MatchOutcome {
    pub fn candidate(&self) -> Option<&MatchCandidate> {
        match self {
            MatchOutcome::Matched(candidate) => Some(candidate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchReport {
    pub outcome: MatchOutcome,
    /// Best tracks first, at most `top_k` of them, whether or not any matched.
    pub candidates: Vec<MatchCandidate>,
    pub query_hashes: usize,
    pub distinct_hashes: usize,
}

struct TrackVotes {
    buckets: FastMap<i64, usize>,
    matched: usize,
}

pub struct Matcher {
    config: MatchConfig,
}

impl Matcher {
    pub fn new(config: &MatchConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Looks the query's hashes up once and votes on time alignment per track.
    ///
    /// Store failures come back as errors and are never turned into
    /// [`MatchOutcome::NoMatch`].
    pub async fn find_match<S: FingerprintStore>(
        &self,
        store: &S,
        query: &[Fingerprint],
        timeout: Duration,
    ) -> Result<MatchReport> {
        if query.is_empty() {
            return Ok(MatchReport {
                outcome: MatchOutcome::EmptyQuery,
                candidates: Vec::new(),
                query_hashes: 0,
                distinct_hashes: 0,
            });
        }

        let distinct: HashSet<HashCode> = query.iter().map(|fp| fp.hash).collect();
        let found = store.lookup(&distinct, timeout).await?;

        let mut candidates = self.rank(query, &found);

        let tied = candidates
            .first()
            .map_or(0, |best| candidates.iter().take_while(|c| c.vote_count == best.vote_count).count());
        if tied > 1 {
            let ids: Vec<TrackId> = candidates[..tied].iter().map(|c| c.track_id).collect();
            let sizes: HashMap<TrackId, u64> = store
                .tracks(&ids, timeout)
                .await?
                .into_iter()
                .map(|track| (track.id, track.fingerprint_count))
                .collect();
            break_ties(&mut candidates[..tied], &sizes);
        }

        candidates.truncate(self.config.top_k.max(1));
        let outcome = self.decide(candidates.first());

        debug!(
            query_hashes = query.len(),
            distinct_hashes = distinct.len(),
            hit_hashes = found.len(),
            tracks = candidates.len(),
            matched = matches!(outcome, MatchOutcome::Matched(_)),
            "voted on alignment"
        );

        Ok(MatchReport {
            outcome,
            candidates,
            query_hashes: query.len(),
            distinct_hashes: distinct.len(),
        })
    }

    /// One candidate per track that shares any hash with the query, by
    /// descending vote count and then ascending track id.
    pub fn rank(&self, query: &[Fingerprint], found: &LookupResult) -> Vec<MatchCandidate> {
        let bucket = self.config.bucket_ms.max(1) as i64;
        let mut votes: FastMap<TrackId, TrackVotes> = fast_map();

        for fp in query {
            let Some(occurrences) = found.get(&fp.hash) else {
                continue;
            };
            for &(track_id, stored_offset) in occurrences {
                let delta = stored_offset as i64 - fp.time_offset as i64;
                // Round to the nearest bucket centre.
                let slot = (delta + bucket / 2).div_euclid(bucket);

                let entry = votes.entry(track_id).or_insert_with(|| TrackVotes {
                    buckets: fast_map(),
                    matched: 0,
                });
                *entry.buckets.entry(slot).or_default() += 1;
                entry.matched += 1;
            }
        }

        let mut candidates: Vec<MatchCandidate> = votes
            .into_iter()
            .filter_map(|(track_id, track_votes)| {
                let (slot, count) = track_votes
                    .buckets
                    .into_iter()
                    .max_by_key(|&(slot, count)| (count, Reverse(slot)))?;
                Some(MatchCandidate {
                    track_id,
                    vote_count: count,
                    offset_ms: slot * bucket,
                    confidence: (count as f32 / query.len() as f32).min(1.0),
                    matched_hashes: track_votes.matched,
                })
            })
            .collect();

        candidates.sort_by_key(|c| (Reverse(c.vote_count), c.track_id));
        candidates
    }

    /// The best candidate matches when it has at least `min_votes` aligned
    /// votes and at least `min_confidence`.
    pub fn decide(&self, best: Option<&MatchCandidate>) -> MatchOutcome {
        match best {
            Some(candidate)
                if candidate.vote_count >= self.config.min_votes
                    && candidate.confidence >= self.config.min_confidence =>
            {
                MatchOutcome::Matched(candidate.clone())
            }
            _ => MatchOutcome::NoMatch,
        }
    }
}

/// Equal votes: the track with more stored fingerprints first, then the
/// lowest id.
fn break_ties(candidates: &mut [MatchCandidate], sizes: &HashMap<TrackId, u64>) {
    candidates.sort_by(|a, b| {
        sizes
            .get(&b.track_id)
            .cmp(&sizes.get(&a.track_id))
            .then(a.track_id.cmp(&b.track_id))
    });
}
