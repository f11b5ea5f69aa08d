mod common;

use std::fs;
use std::time::Duration;

use songmark::testing::{self, synthetic_track, with_noise};
use songmark::db::NewTrack;
use songmark::{
    Error, FileSource, FingerprintStore, IngestOutcome, MatchOutcome, MemorySource, MemoryStore,
    Recognizer, SampleSource, TrackId,
};

use common::{RacingStore, memory_recognizer, recognizer_with, temp_path, write_wav};

const RATE: u32 = 11025;

async fn ingest(recognizer: &Recognizer<MemoryStore>, name: &str, seed: u64, secs: f32) -> TrackId {
    let outcome = recognizer
        .ingest(MemorySource::new(name, synthetic_track(seed, secs, RATE)))
        .await
        .unwrap();
    outcome.track().id
}

#[tokio::test]
async fn excerpt_at_ninety_seconds_matches_its_reference() {
    let recognizer = memory_recognizer();
    let reference = synthetic_track(7, 180.0, RATE);
    let id = recognizer
        .ingest(MemorySource::new("reference", reference.clone()))
        .await
        .unwrap()
        .track()
        .id;
    ingest(&recognizer, "other-a", 8, 60.0).await;
    ingest(&recognizer, "other-b", 9, 60.0).await;

    let recognition = recognizer
        .recognize_samples(reference.slice_ms(90_000, 5_000))
        .await
        .unwrap();

    let MatchOutcome::Matched(best) = &recognition.outcome else {
        panic!("expected a match, got {:?}", recognition.outcome);
    };
    assert_eq!(best.track_id, id);
    assert!((best.offset_ms - 90_000).abs() <= 100, "offset {}", best.offset_ms);
    assert!(best.confidence > recognizer.config().matching.min_confidence);
    assert!(best.vote_count >= recognizer.config().matching.min_votes);
    assert_eq!(recognition.track.as_ref().map(|t| t.name.as_str()), Some("reference"));
    assert_eq!(recognition.candidates[0].track_id, id);
}

#[tokio::test]
async fn unrelated_audio_is_no_match() {
    let recognizer = memory_recognizer();
    ingest(&recognizer, "reference", 7, 60.0).await;
    ingest(&recognizer, "other", 8, 60.0).await;

    let recognition = recognizer
        .recognize_samples(synthetic_track(999, 5.0, RATE))
        .await
        .unwrap();

    assert_eq!(recognition.outcome, MatchOutcome::NoMatch);
    assert!(recognition.track.is_none());
    assert!(recognition.query_hashes > 0);
}

#[tokio::test]
async fn silence_is_an_empty_query() {
    let recognizer = memory_recognizer();
    ingest(&recognizer, "reference", 7, 30.0).await;

    for clip in [
        testing::silence(5.0, RATE),
        testing::white_noise(5, 5.0, RATE, 1e-4),
    ] {
        let recognition = recognizer.recognize_samples(clip).await.unwrap();
        assert_eq!(recognition.outcome, MatchOutcome::EmptyQuery);
        assert_eq!(recognition.query_hashes, 0);
    }
}

#[tokio::test]
async fn noisy_excerpt_still_matches() {
    let recognizer = memory_recognizer();
    let reference = synthetic_track(21, 60.0, RATE);
    let id = recognizer
        .ingest(MemorySource::new("reference", reference.clone()))
        .await
        .unwrap()
        .track()
        .id;
    ingest(&recognizer, "other", 22, 60.0).await;

    let noisy = with_noise(&reference.slice_ms(30_000, 6_000), 3, 0.02);
    let recognition = recognizer.recognize_samples(noisy).await.unwrap();

    let best = recognition.outcome.candidate().expect("noisy excerpt should match");
    assert_eq!(best.track_id, id);
    assert!((best.offset_ms - 30_000).abs() <= 100);
}

#[tokio::test]
async fn removed_track_stops_matching() {
    let recognizer = memory_recognizer();
    let reference = synthetic_track(40, 30.0, RATE);
    let id = recognizer
        .ingest(MemorySource::new("gone", reference.clone()))
        .await
        .unwrap()
        .track()
        .id;
    let kept = ingest(&recognizer, "kept", 41, 30.0).await;

    assert!(recognizer.remove_track(id).await.unwrap() > 0);

    let recognition = recognizer
        .recognize_samples(reference.slice_ms(10_000, 5_000))
        .await
        .unwrap();
    assert_eq!(recognition.outcome, MatchOutcome::NoMatch);

    let tracks = recognizer.list_tracks().await.unwrap();
    assert_eq!(tracks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![kept]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_ingest_keeps_tracks_apart() {
    let recognizer = memory_recognizer();
    let references: Vec<MemorySource> = (0..6)
        .map(|i| MemorySource::new(format!("track-{i}"), synthetic_track(300 + i, 20.0, RATE)))
        .collect();

    let reports = recognizer.ingest_all(references.clone()).await;
    assert_eq!(reports.len(), 6);

    let mut ids = Vec::new();
    for (report, reference) in reports.iter().zip(&references) {
        assert_eq!(report.source, reference.name());
        match &report.result {
            Ok(IngestOutcome::Ingested { track, .. }) => ids.push(track.id),
            other => panic!("unexpected ingest result {other:?}"),
        }
    }
    let mut distinct = ids.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), 6);

    for (i, id) in ids.iter().enumerate() {
        let excerpt = synthetic_track(300 + i as u64, 20.0, RATE).slice_ms(8_000, 5_000);
        let recognition = recognizer.recognize_samples(excerpt).await.unwrap();
        assert_eq!(recognition.outcome.candidate().map(|c| c.track_id), Some(*id));
    }

    let stats = recognizer.stats().await.unwrap();
    assert_eq!(stats.tracks, 6);
    assert_eq!(stats.fingerprinted_tracks, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aborted_ingest_leaves_others_intact() {
    let recognizer = memory_recognizer();

    let doomed = recognizer.spawn_ingest(MemorySource::new("doomed", synthetic_track(50, 60.0, RATE)));
    let survivor = recognizer.spawn_ingest(MemorySource::new("survivor", synthetic_track(51, 20.0, RATE)));
    doomed.abort();

    let survivor = survivor.await.unwrap().unwrap();
    if let Err(err) = doomed.await {
        assert!(err.is_cancelled());
    }

    recognizer.purge_unfingerprinted().await.unwrap();
    let tracks = recognizer.list_tracks().await.unwrap();
    assert!(tracks.iter().all(|t| t.fingerprinted));
    assert!(tracks.iter().any(|t| t.id == survivor.track().id));

    let recognition = recognizer
        .recognize_samples(synthetic_track(51, 20.0, RATE).slice_ms(5_000, 5_000))
        .await
        .unwrap();
    assert_eq!(
        recognition.outcome.candidate().map(|c| c.track_id),
        Some(survivor.track().id)
    );
}

#[tokio::test]
async fn wav_files_are_resampled_and_not_ingested_twice() {
    let recognizer = memory_recognizer();
    let path = temp_path("reference-22k.wav");
    write_wav(&path, &synthetic_track(60, 20.0, 22050));

    let first = recognizer
        .ingest(FileSource::new(&path, recognizer.audio_processor()))
        .await
        .unwrap();
    let second = recognizer
        .ingest(FileSource::new(&path, recognizer.audio_processor()))
        .await
        .unwrap();
    let recognition = recognizer
        .recognize(FileSource::new(&path, recognizer.audio_processor()))
        .await
        .unwrap();
    fs::remove_file(&path).ok();

    let IngestOutcome::Ingested { track, .. } = &first else {
        panic!("expected a fresh ingest, got {first:?}");
    };
    assert_eq!(track.content_hash.as_ref().map(String::len), Some(64));
    assert!(track.source_path.is_some());
    assert!((track.duration_ms as i64 - 20_000).abs() <= 1);
    assert!(matches!(&second, IngestOutcome::AlreadyIngested { track: t } if t.id == track.id));

    let best = recognition.outcome.candidate().expect("full file should match");
    assert_eq!(best.track_id, track.id);
    assert!(best.offset_ms.abs() <= 100);
    assert_eq!(recognizer.stats().await.unwrap().tracks, 1);
}

fn claim_row(source: &FileSource) -> NewTrack {
    NewTrack {
        name: "left behind".to_string(),
        source_path: None,
        content_hash: source.content_hash().unwrap(),
        duration_ms: 0,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_file_ingested_in_parallel_is_stored_once() {
    let recognizer = memory_recognizer();
    let path = temp_path("duplicate.wav");
    write_wav(&path, &synthetic_track(80, 15.0, RATE));

    let sources: Vec<FileSource> = (0..4)
        .map(|_| FileSource::new(&path, recognizer.audio_processor()))
        .collect();
    let reports = recognizer.ingest_all(sources).await;
    fs::remove_file(&path).ok();

    let mut ingested = Vec::new();
    let mut skipped = Vec::new();
    for report in reports {
        match report.result {
            Ok(IngestOutcome::Ingested { track, .. }) => ingested.push(track.id),
            Ok(IngestOutcome::AlreadyIngested { track }) => skipped.push(track.id),
            Err(err) => panic!("unexpected ingest error {err}"),
        }
    }
    assert_eq!(ingested.len(), 1);
    assert_eq!(skipped, vec![ingested[0]; 3]);

    let stats = recognizer.stats().await.unwrap();
    assert_eq!(stats.tracks, 1);
    assert_eq!(stats.fingerprinted_tracks, 1);
}

#[tokio::test]
async fn stale_track_from_failed_ingest_is_replaced() {
    let recognizer = recognizer_with(MemoryStore::new(), 100);
    let path = temp_path("stale.wav");
    write_wav(&path, &synthetic_track(70, 10.0, RATE));
    let source = FileSource::new(&path, recognizer.audio_processor());

    let stale = recognizer
        .store()
        .create_track(claim_row(&source), recognizer.config().store_timeout())
        .await
        .unwrap();
    // Older than any ingest could still be working on it.
    tokio::time::sleep(Duration::from_millis(250)).await;

    let outcome = recognizer.ingest(source).await.unwrap();
    fs::remove_file(&path).ok();

    assert!(matches!(outcome, IngestOutcome::Ingested { .. }));
    let ids: Vec<TrackId> = recognizer
        .list_tracks()
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec![outcome.track().id]);
    assert_ne!(outcome.track().id, stale.id);
}

#[tokio::test]
async fn track_of_an_ingest_still_running_is_left_alone() {
    let recognizer = memory_recognizer();
    let path = temp_path("in-flight.wav");
    write_wav(&path, &synthetic_track(71, 10.0, RATE));
    let source = FileSource::new(&path, recognizer.audio_processor());

    let pending = recognizer
        .store()
        .create_track(claim_row(&source), recognizer.config().store_timeout())
        .await
        .unwrap();

    let result = recognizer.ingest(source).await;
    fs::remove_file(&path).ok();

    match result {
        Err(err @ Error::IngestInProgress(id)) => {
            assert_eq!(id, pending.id);
            assert!(err.is_retryable());
        }
        other => panic!("expected IngestInProgress, got {other:?}"),
    }
    let tracks = recognizer.list_tracks().await.unwrap();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].id, pending.id);
}

#[tokio::test]
async fn content_catalogued_elsewhere_mid_ingest_is_skipped() {
    let recognizer = recognizer_with(RacingStore::default(), 10_000);
    let path = temp_path("raced.wav");
    write_wav(&path, &synthetic_track(72, 10.0, RATE));

    let outcome = recognizer
        .ingest(FileSource::new(&path, recognizer.audio_processor()))
        .await
        .unwrap();
    fs::remove_file(&path).ok();

    let IngestOutcome::AlreadyIngested { track } = outcome else {
        panic!("expected the other writer's track, got {outcome:?}");
    };
    assert_eq!(track.name, "other writer");
    assert_eq!(recognizer.stats().await.unwrap().tracks, 1);
}
