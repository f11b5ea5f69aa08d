//! HTTP front end over a [`Recognizer`].
//!
//! `POST /recognize` takes an encoded clip as the raw request body. The
//! catalog routes expose listing, removal and counts.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;
use tracing::{info, warn};

use crate::audio_processor::BytesSource;
use crate::db::{FingerprintStore, StoreStats, Track, TrackId};
use crate::error::{Error, Result};
use crate::recognizer::{Recognition, Recognizer};

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Library errors mapped to JSON responses.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InsufficientSamples { .. }
            | Error::SampleRateMismatch { .. }
            | Error::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::UnknownTrack(_) => StatusCode::NOT_FOUND,
            Error::AlreadyFingerprinted(_)
            | Error::DuplicateContent(_)
            | Error::IngestInProgress(_) => StatusCode::CONFLICT,
            Error::StoreUnavailable(_) | Error::PartialIngestFailure { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(%status, err = %self.0, "request failed");
        }

        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    pub track_id: TrackId,
    pub removed_fingerprints: u64,
}

pub fn router<S: FingerprintStore>(recognizer: Recognizer<S>) -> Router {
    Router::new()
        .route("/recognize", post(recognize::<S>))
        .route("/tracks", get(list_tracks::<S>))
        .route("/tracks/{id}", delete(remove_track::<S>))
        .route("/stats", get(stats::<S>))
        .route("/health", get(|| async { "healthy" }))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(recognizer)
}

pub async fn serve<S: FingerprintStore>(recognizer: Recognizer<S>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(recognizer)).await?;
    Ok(())
}

async fn recognize<S: FingerprintStore>(
    State(recognizer): State<Recognizer<S>>,
    body: Bytes,
) -> Result<Json<Recognition>, ApiError> {
    let source = BytesSource::new("upload", body.to_vec(), recognizer.audio_processor());
    Ok(Json(recognizer.recognize(source).await?))
}

async fn list_tracks<S: FingerprintStore>(
    State(recognizer): State<Recognizer<S>>,
) -> Result<Json<Vec<Track>>, ApiError> {
    Ok(Json(recognizer.list_tracks().await?))
}

async fn remove_track<S: FingerprintStore>(
    State(recognizer): State<Recognizer<S>>,
    Path(id): Path<i32>,
) -> Result<Json<RemovedResponse>, ApiError> {
    let track_id = TrackId(id);
    let removed_fingerprints = recognizer.remove_track(track_id).await?;
    Ok(Json(RemovedResponse {
        track_id,
        removed_fingerprints,
    }))
}

async fn stats<S: FingerprintStore>(
    State(recognizer): State<Recognizer<S>>,
) -> Result<Json<StoreStats>, ApiError> {
    Ok(Json(recognizer.stats().await?))
}
