use std::time::SystemTime;

use diesel::prelude::*;

use crate::db::store::{Track, TrackId};

#[derive(Queryable, Selectable, Insertable, Debug, Clone, Copy)]
#[diesel(table_name = crate::schema::fingerprints)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct FingerprintRow {
    pub track_id: i32,
    pub hash: i64,
    pub offset_ms: i32,
}

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = crate::schema::tracks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TrackRow {
    pub id: i32,
    pub name: String,
    pub source_path: Option<String>,
    pub content_hash: Option<String>,
    pub duration_ms: i64,
    pub fingerprint_count: i64,
    pub fingerprinted: bool,
    pub created_at: SystemTime,
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::tracks)]
pub struct NewTrackRow {
    pub name: String,
    pub source_path: Option<String>,
    pub content_hash: Option<String>,
    pub duration_ms: i64,
    pub created_at: SystemTime,
}

impl From<TrackRow> for Track {
    fn from(row: TrackRow) -> Self {
        Track {
            id: TrackId(row.id),
            name: row.name,
            source_path: row.source_path,
            content_hash: row.content_hash,
            duration_ms: row.duration_ms.max(0) as u64,
            fingerprint_count: row.fingerprint_count.max(0) as u64,
            fingerprinted: row.fingerprinted,
            created_at: row.created_at,
        }
    }
}
