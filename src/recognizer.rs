use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio_processor::{AudioProcessor, SampleBuffer, SampleSource};
use crate::config::Config;
use crate::db::{FingerprintStore, NewTrack, StoreStats, Track, TrackId, with_deadline};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::matcher::{MatchCandidate, MatchOutcome, Matcher};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Ingested { track: Track, fingerprints: u64 },
    /// The same content was fingerprinted before; nothing was stored.
    AlreadyIngested { track: Track },
}

impl IngestOutcome {
    pub fn track(&self) -> &Track {
        match self {
            IngestOutcome::Ingested { track, .. } | IngestOutcome::AlreadyIngested { track } => {
                track
            }
        }
    }
}

/// Result of one job in [`Recognizer::ingest_all`].
#[derive(Debug)]
pub struct IngestReport {
    pub source: String,
    pub result: Result<IngestOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    pub outcome: MatchOutcome,
    /// Catalog entry of the matched track.
    pub track: Option<Track>,
    pub candidates: Vec<MatchCandidate>,
    pub query_hashes: usize,
    pub distinct_hashes: usize,
    pub fingerprint_ms: u64,
    pub match_ms: u64,
}

/// Serializes ingests of the same content within this process.
#[derive(Debug, Default)]
struct ContentClaims {
    held: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl ContentClaims {
    /// Waits until no other ingest holds `content_hash`, then holds it
    /// until the guard drops. Aborted tasks drop their guard too.
    async fn claim(&self, content_hash: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            held.retain(|_, lock| lock.strong_count() > 0);
            match held.get(content_hash).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    held.insert(content_hash.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

/// Decode, fingerprint, then store or match.
///
/// Cheap to clone; clones share the store and the fingerprinting state.
pub struct Recognizer<S> {
    store: Arc<S>,
    config: Arc<Config>,
    fingerprinter: Arc<Fingerprinter>,
    matcher: Arc<Matcher>,
    claims: Arc<ContentClaims>,
}

impl<S> Clone for Recognizer<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            fingerprinter: self.fingerprinter.clone(),
            matcher: self.matcher.clone(),
            claims: self.claims.clone(),
        }
    }
}

impl<S: FingerprintStore> Recognizer<S> {
    pub fn new(store: Arc<S>, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            fingerprinter: Arc::new(Fingerprinter::new(&config)),
            matcher: Arc::new(Matcher::new(&config.matching)),
            claims: Arc::default(),
            config: Arc::new(config),
            store,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Decoder producing buffers at the rate the fingerprinter expects.
    pub fn audio_processor(&self) -> AudioProcessor {
        AudioProcessor::new(
            self.config.spectrogram.sample_rate,
            self.config.ingest.low_pass_hz,
        )
    }

    fn timeout(&self) -> Duration {
        self.config.store_timeout()
    }

    /// Age past which an unfingerprinted track cannot belong to a running
    /// ingest: its `create_track` and `insert_many` each finish or fail
    /// within the store timeout.
    fn abandoned_after(&self) -> Duration {
        self.timeout() * 2
    }

    /// Fingerprints a reference and adds it to the catalog.
    ///
    /// Content that is already fingerprinted is skipped; concurrent ingests
    /// of the same content wait for each other and all but one skip. A
    /// track left unfingerprinted by an abandoned ingest is replaced, one
    /// that may still be in flight elsewhere fails the call with
    /// [`Error::IngestInProgress`]. If storing fails, the new track row is
    /// removed again and nothing of it is matchable.
    pub async fn ingest<Src>(&self, source: Src) -> Result<IngestOutcome>
    where
        Src: SampleSource + Send + Sync + 'static,
    {
        let started = Instant::now();
        let timeout = self.timeout();
        let source = Arc::new(source);
        let name = source.name();

        let hasher = source.clone();
        let content_hash = blocking("content hash", move || hasher.content_hash()).await?;

        let _claim = match content_hash.as_deref() {
            Some(hash) => Some(self.claims.claim(hash).await),
            None => None,
        };

        if let Some(hash) = content_hash.as_deref() {
            let existing = with_deadline(timeout, self.store.find_by_content_hash(hash, timeout))
                .await?;
            match existing {
                Some(track) if track.fingerprinted => {
                    info!(track_id = %track.id, %name, "already ingested, skipping");
                    return Ok(IngestOutcome::AlreadyIngested { track });
                }
                Some(pending) if pending.age() < self.abandoned_after() => {
                    warn!(track_id = %pending.id, %name, "same content is being ingested elsewhere");
                    return Err(Error::IngestInProgress(pending.id));
                }
                Some(stale) => {
                    warn!(track_id = %stale.id, %name, "removing track left by a failed ingest");
                    match with_deadline(timeout, self.store.remove_track(stale.id, timeout)).await {
                        Ok(_) | Err(Error::UnknownTrack(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
                None => {}
            }
        }

        let fingerprinter = self.fingerprinter.clone();
        let limit = self.config.ingest.fingerprint_limit_secs;
        let decoder = source.clone();
        let (duration_ms, fingerprints) = blocking("fingerprinting", move || {
            let mut buffer = decoder.produce_sample_buffer()?;
            let duration_ms = buffer.duration_ms();
            if let Some(seconds) = limit {
                buffer.truncate_secs(seconds);
            }
            Ok((duration_ms, fingerprinter.fingerprint(&buffer)?))
        })
        .await
        .inspect_err(|err| warn!(%name, %err, "could not fingerprint reference"))?;

        let created = with_deadline(
            timeout,
            self.store.create_track(
                NewTrack {
                    name: name.clone(),
                    source_path: source.source_path(),
                    content_hash: content_hash.clone(),
                    duration_ms,
                },
                timeout,
            ),
        )
        .await;
        let track = match created {
            Ok(track) => track,
            Err(Error::DuplicateContent(id)) => return self.claimed_elsewhere(id, &name).await,
            Err(err) => return Err(err),
        };

        let stored =
            match with_deadline(timeout, self.store.insert_many(track.id, fingerprints, timeout))
                .await
            {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(track_id = %track.id, %name, %err, "insert failed, removing track");
                    if let Err(cleanup) =
                        with_deadline(timeout, self.store.remove_track(track.id, timeout)).await
                    {
                        warn!(track_id = %track.id, %cleanup, "could not remove track");
                    }
                    return Err(err);
                }
            };

        info!(
            track_id = %track.id,
            %name,
            fingerprints = stored,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ingested track"
        );

        Ok(IngestOutcome::Ingested {
            track: Track {
                fingerprint_count: stored,
                fingerprinted: true,
                ..track
            },
            fingerprints: stored,
        })
    }

    /// Outcome when another process catalogued the same content first.
    async fn claimed_elsewhere(&self, id: TrackId, name: &str) -> Result<IngestOutcome> {
        let timeout = self.timeout();
        let found = with_deadline(timeout, self.store.tracks(&[id], timeout)).await?;
        match found.into_iter().next() {
            Some(track) if track.fingerprinted => {
                info!(track_id = %id, %name, "ingested elsewhere meanwhile, skipping");
                Ok(IngestOutcome::AlreadyIngested { track })
            }
            _ => Err(Error::IngestInProgress(id)),
        }
    }

    /// Runs [`Recognizer::ingest`] as its own task. Aborting the handle
    /// leaves other ingests untouched.
    pub fn spawn_ingest<Src>(&self, source: Src) -> JoinHandle<Result<IngestOutcome>>
    where
        Src: SampleSource + Send + Sync + 'static,
    {
        let recognizer = self.clone();
        tokio::spawn(async move { recognizer.ingest(source).await })
    }

    /// Ingests every source with at most `ingest.concurrency` running at
    /// once. Reports come back in input order.
    pub async fn ingest_all<Src>(&self, sources: Vec<Src>) -> Vec<IngestReport>
    where
        Src: SampleSource + Send + Sync + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.config.ingest.concurrency.max(1)));

        let jobs: Vec<(String, JoinHandle<Result<IngestOutcome>>)> = sources
            .into_iter()
            .map(|source| {
                let name = source.name();
                let permits = permits.clone();
                let recognizer = self.clone();
                let handle = tokio::spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::Cancelled("ingest worker".to_string()))?;
                    recognizer.ingest(source).await
                });
                (name, handle)
            })
            .collect();

        let mut reports = Vec::with_capacity(jobs.len());
        for (source, handle) in jobs {
            let result = match handle.await {
                Ok(result) => result,
                Err(join) => {
                    warn!(%source, %join, "ingest worker did not finish");
                    Err(Error::Cancelled(format!("ingest of {source}")))
                }
            };
            reports.push(IngestReport { source, result });
        }
        reports
    }

    pub async fn recognize<Src>(&self, source: Src) -> Result<Recognition>
    where
        Src: SampleSource + Send + 'static,
    {
        let buffer = blocking("decoding", move || source.produce_sample_buffer()).await?;
        self.recognize_samples(buffer).await
    }

    /// Matches an already decoded clip.
    pub async fn recognize_samples(&self, buffer: SampleBuffer) -> Result<Recognition> {
        let timeout = self.timeout();

        let fingerprint_started = Instant::now();
        let fingerprinter = self.fingerprinter.clone();
        let query: Vec<Fingerprint> =
            blocking("fingerprinting", move || fingerprinter.fingerprint(&buffer)).await?;
        let fingerprint_ms = fingerprint_started.elapsed().as_millis() as u64;

        let match_started = Instant::now();
        let report = with_deadline(
            timeout,
            self.matcher.find_match(self.store.as_ref(), &query, timeout),
        )
        .await?;

        let track = match report.outcome.candidate() {
            Some(best) => with_deadline(timeout, self.store.tracks(&[best.track_id], timeout))
                .await?
                .into_iter()
                .next(),
            None => None,
        };
        let match_ms = match_started.elapsed().as_millis() as u64;

        debug!(
            query_hashes = report.query_hashes,
            fingerprint_ms,
            match_ms,
            matched = track.as_ref().map(|t| t.id.0),
            "recognized clip"
        );

        Ok(Recognition {
            outcome: report.outcome,
            track,
            candidates: report.candidates,
            query_hashes: report.query_hashes,
            distinct_hashes: report.distinct_hashes,
            fingerprint_ms,
            match_ms,
        })
    }

    pub async fn remove_track(&self, track_id: TrackId) -> Result<u64> {
        let timeout = self.timeout();
        let removed = with_deadline(timeout, self.store.remove_track(track_id, timeout)).await?;
        info!(%track_id, removed, "removed track");
        Ok(removed)
    }

    pub async fn list_tracks(&self) -> Result<Vec<Track>> {
        let timeout = self.timeout();
        with_deadline(timeout, self.store.list_tracks(timeout)).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let timeout = self.timeout();
        with_deadline(timeout, self.store.stats(timeout)).await
    }

    pub async fn purge_unfingerprinted(&self) -> Result<Vec<TrackId>> {
        let timeout = self.timeout();
        let purged = with_deadline(timeout, self.store.purge_unfingerprinted(timeout)).await?;
        if !purged.is_empty() {
            info!(count = purged.len(), "purged tracks without fingerprints");
        }
        Ok(purged)
    }
}

async fn blocking<T, F>(stage: &str, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|_| Error::Cancelled(stage.to_string()))?
}
