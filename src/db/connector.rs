use std::collections::HashSet;
use std::time::{Duration, Instant, SystemTime};

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::{delete, insert_into, sql_query, update};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::db::bindings::{FingerprintRow, NewTrackRow, TrackRow};
use crate::db::store::{
    FingerprintStore, LookupResult, NewTrack, StoreStats, Track, TrackId, distinct_records,
};
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, HashCode};

const BATCH_SIZE: usize = 5000;

type PgPool = Pool<ConnectionManager<PgConnection>>;

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

/// Postgres catalog behind an r2d2 pool.
///
/// Diesel is synchronous, so every operation runs on tokio's blocking pool
/// inside its own transaction, bounded both by a server-side
/// `statement_timeout` and by the caller's deadline.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn connect(config: &StoreConfig) -> Result<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("DATABASE_URL must be set".to_string()))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_millis(config.timeout_ms))
            .build(ConnectionManager::<PgConnection>::new(url))
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        info!(pool_size = config.pool_size, "connected to postgres");
        Ok(Self { pool })
    }

    async fn run<T, F>(&self, timeout: Duration, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection, &Deadline) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let deadline = Deadline::after(timeout);

        let task = tokio::task::spawn_blocking(move || {
            let mut pooled = pool
                .get_timeout(deadline.remaining()?)
                .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
            let conn: &mut PgConnection = &mut pooled;
            conn.transaction(|conn| {
                deadline.limit_statements(conn)?;
                op(conn, &deadline)
            })
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::StoreUnavailable(join.to_string())),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }
}

/// The point by which a store call must have finished. Checked between
/// statements so a transaction past it rolls back instead of committing.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    fn remaining(&self) -> Result<Duration> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(Error::Timeout(self.timeout));
        }
        Ok(left)
    }

    fn statement_timeout_ms(&self) -> Result<u128> {
        Ok(self.remaining()?.as_millis().max(1))
    }

    /// Caps the next statements of the transaction at the time left.
    fn limit_statements(&self, conn: &mut PgConnection) -> Result<()> {
        let ms = self.statement_timeout_ms()?;
        sql_query(format!("SET LOCAL statement_timeout = {ms}")).execute(conn)?;
        Ok(())
    }
}

impl FingerprintStore for PgStore {
    async fn create_track(&self, track: NewTrack, timeout: Duration) -> Result<Track> {
        self.run(timeout, move |conn, _| {
            use crate::schema::tracks::dsl as t;

            let row = NewTrackRow {
                name: track.name,
                source_path: track.source_path,
                content_hash: track.content_hash,
                duration_ms: track.duration_ms as i64,
                created_at: SystemTime::now(),
            };
            let inserted: Option<TrackRow> = insert_into(t::tracks)
                .values(&row)
                .on_conflict(t::content_hash)
                .do_nothing()
                .returning(TrackRow::as_returning())
                .get_result(conn)
                .optional()?;
            if let Some(inserted) = inserted {
                return Ok(Track::from(inserted));
            }

            let existing: i32 = t::tracks
                .filter(t::content_hash.eq(row.content_hash))
                .select(t::id)
                .first(conn)?;
            Err(Error::DuplicateContent(TrackId(existing)))
        })
        .await
    }

    async fn insert_many(
        &self,
        track_id: TrackId,
        fingerprints: Vec<Fingerprint>,
        timeout: Duration,
    ) -> Result<u64> {
        let rows: Vec<FingerprintRow> = distinct_records(&fingerprints)
            .into_iter()
            .map(|(hash, offset)| FingerprintRow {
                track_id: track_id.0,
                hash: hash as i64,
                offset_ms: offset as i32,
            })
            .collect();

        self.run(timeout, move |conn, deadline| {
            use crate::schema::tracks::dsl as t;

            let done: Option<bool> = t::tracks
                .filter(t::id.eq(track_id.0))
                .select(t::fingerprinted)
                .for_update()
                .first(conn)
                .optional()?;
            match done {
                None => return Err(Error::UnknownTrack(track_id)),
                Some(true) => return Err(Error::AlreadyFingerprinted(track_id)),
                Some(false) => {}
            }

            let mut stored = 0u64;
            for (batch_no, batch) in rows.chunks(BATCH_SIZE).enumerate() {
                if let Err(err) = deadline.limit_statements(conn) {
                    warn!(%track_id, batch_no, %err, "out of time, rolling back track");
                    return Err(err);
                }
                let written = insert_into(crate::schema::fingerprints::table)
                    .values(batch)
                    .on_conflict_do_nothing()
                    .execute(conn);
                match written {
                    Ok(count) => stored += count as u64,
                    Err(err) if batch_no > 0 => {
                        warn!(%track_id, batch_no, %err, "batch failed, rolling back track");
                        return Err(Error::PartialIngestFailure {
                            track_id,
                            source: Box::new(err.into()),
                        });
                    }
                    Err(err) => return Err(err.into()),
                }
                debug!(%track_id, rows = batch.len(), "pushed batch");
            }

            deadline.limit_statements(conn)?;
            update(t::tracks.filter(t::id.eq(track_id.0)))
                .set((t::fingerprinted.eq(true), t::fingerprint_count.eq(stored as i64)))
                .execute(conn)?;

            Ok(stored)
        })
        .await
    }

    async fn lookup(&self, hashes: &HashSet<HashCode>, timeout: Duration) -> Result<LookupResult> {
        let wanted: Vec<i64> = hashes.iter().map(|&h| h as i64).collect();

        self.run(timeout, move |conn, _| {
            use crate::schema::fingerprints::dsl::*;

            let records: Vec<FingerprintRow> = fingerprints
                .filter(hash.eq_any(wanted))
                .select(FingerprintRow::as_select())
                .load(conn)?;

            let mut found = LookupResult::new();
            for rec in records {
                found
                    .entry(rec.hash as HashCode)
                    .or_default()
                    .push((TrackId(rec.track_id), rec.offset_ms as u32));
            }
            for occurrences in found.values_mut() {
                occurrences.sort_unstable();
            }
            Ok(found)
        })
        .await
    }

    async fn remove_track(&self, track_id: TrackId, timeout: Duration) -> Result<u64> {
        self.run(timeout, move |conn, _| {
            use crate::schema::{fingerprints, tracks};

            // Waits for an insert still holding the row, so its records go too.
            let locked: Option<i32> = tracks::table
                .filter(tracks::id.eq(track_id.0))
                .select(tracks::id)
                .for_update()
                .first(conn)
                .optional()?;
            if locked.is_none() {
                return Err(Error::UnknownTrack(track_id));
            }

            let removed =
                delete(fingerprints::table.filter(fingerprints::track_id.eq(track_id.0)))
                    .execute(conn)?;
            delete(tracks::table.filter(tracks::id.eq(track_id.0))).execute(conn)?;
            Ok(removed as u64)
        })
        .await
    }

    async fn tracks(&self, ids: &[TrackId], timeout: Duration) -> Result<Vec<Track>> {
        let wanted: Vec<i32> = ids.iter().map(|t| t.0).collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        self.run(timeout, move |conn, _| {
            use crate::schema::tracks::dsl::*;

            let rows: Vec<TrackRow> = tracks
                .filter(id.eq_any(wanted))
                .order(id)
                .select(TrackRow::as_select())
                .load(conn)?;
            Ok(rows.into_iter().map(Track::from).collect())
        })
        .await
    }

    async fn list_tracks(&self, timeout: Duration) -> Result<Vec<Track>> {
        self.run(timeout, |conn, _| {
            use crate::schema::tracks::dsl::*;

            let rows: Vec<TrackRow> = tracks.order(id).select(TrackRow::as_select()).load(conn)?;
            Ok(rows.into_iter().map(Track::from).collect())
        })
        .await
    }

    async fn find_by_content_hash(
        &self,
        wanted: &str,
        timeout: Duration,
    ) -> Result<Option<Track>> {
        let wanted = wanted.to_string();

        self.run(timeout, move |conn, _| {
            use crate::schema::tracks::dsl::*;

            let row: Option<TrackRow> = tracks
                .filter(content_hash.eq(wanted))
                .order(id)
                .select(TrackRow::as_select())
                .first(conn)
                .optional()?;
            Ok(row.map(Track::from))
        })
        .await
    }

    async fn purge_unfingerprinted(&self, timeout: Duration) -> Result<Vec<TrackId>> {
        self.run(timeout, |conn, _| {
            use crate::schema::tracks::dsl::*;

            let purged: Vec<i32> = delete(tracks.filter(fingerprinted.eq(false)))
                .returning(id)
                .get_results(conn)?;
            Ok(purged.into_iter().map(TrackId).collect())
        })
        .await
    }

    async fn stats(&self, timeout: Duration) -> Result<StoreStats> {
        self.run(timeout, |conn, _| {
            use crate::schema::{fingerprints, tracks};

            let track_count: i64 = tracks::table.count().get_result(conn)?;
            let fingerprinted: i64 = tracks::table
                .filter(tracks::fingerprinted.eq(true))
                .count()
                .get_result(conn)?;
            let fingerprint_count: i64 = fingerprints::table.count().get_result(conn)?;

            Ok(StoreStats {
                tracks: track_count as u64,
                fingerprinted_tracks: fingerprinted as u64,
                fingerprints: fingerprint_count as u64,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_reports_time_left() {
        let deadline = Deadline::after(Duration::from_secs(30));
        let left = deadline.remaining().unwrap();
        assert!(left <= Duration::from_secs(30));
        assert!(left > Duration::from_secs(29));
        assert!(deadline.statement_timeout_ms().unwrap() > 29_000);
    }

    #[test]
    fn expired_deadline_is_a_timeout() {
        let deadline = Deadline::after(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            deadline.remaining(),
            Err(Error::Timeout(d)) if d == Duration::from_millis(1)
        ));
        assert!(matches!(deadline.statement_timeout_ms(), Err(Error::Timeout(_))));
    }
}
