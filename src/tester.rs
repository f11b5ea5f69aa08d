use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::audio_processor::{SampleBuffer, SampleSource};
use crate::db::FingerprintStore;
use crate::error::{Error, Result};
use crate::matcher::MatchOutcome;
use crate::recognizer::Recognizer;

#[derive(Debug, Clone, Copy)]
pub struct SnippetTest {
    pub snippets_per_track: usize,
    pub snippet_ms: u64,
}

impl Default for SnippetTest {
    fn default() -> Self {
        Self {
            snippets_per_track: 3,
            snippet_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnippetResult {
    pub reference: String,
    pub start_ms: u64,
    pub predicted: Option<String>,
    pub offset_ms: Option<i64>,
    pub confidence: f32,
    pub correct: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TestSummary {
    pub total: usize,
    pub correct: usize,
    /// References too short to cut a snippet from, or that failed to decode.
    pub skipped: Vec<String>,
    pub results: Vec<SnippetResult>,
}

impl TestSummary {
    pub fn accuracy(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f32 / self.total as f32
        }
    }
}

/// Cuts random snippets from each reference and checks that recognition
/// names the reference they came from. References are expected to be in
/// the catalog already, under their source name.
pub async fn run_random_snippet_test<S, Src, R>(
    recognizer: &Recognizer<S>,
    references: Vec<Src>,
    test: SnippetTest,
    rng: &mut R,
) -> Result<TestSummary>
where
    S: FingerprintStore,
    Src: SampleSource + Send + 'static,
    R: Rng,
{
    let mut summary = TestSummary::default();

    for reference in references {
        let name = reference.name();
        let decoded: Result<SampleBuffer> =
            tokio::task::spawn_blocking(move || reference.produce_sample_buffer())
                .await
                .map_err(|_| Error::Cancelled(format!("decoding {name}")))
                .and_then(|decoded| decoded);
        let buffer = match decoded {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!(%name, %err, "skipping reference that failed to decode");
                summary.skipped.push(name);
                continue;
            }
        };

        let duration_ms = buffer.duration_ms();
        if duration_ms < test.snippet_ms + 1_000 {
            warn!(%name, duration_ms, "skipping reference, too short");
            summary.skipped.push(name);
            continue;
        }

        for _ in 0..test.snippets_per_track {
            let start_ms = rng.random_range(0..=duration_ms - test.snippet_ms);
            let recognition = recognizer
                .recognize_samples(buffer.slice_ms(start_ms, test.snippet_ms))
                .await?;

            let (predicted, offset_ms, confidence) = match &recognition.outcome {
                MatchOutcome::Matched(best) => (
                    recognition.track.as_ref().map(|t| t.name.clone()),
                    Some(best.offset_ms),
                    best.confidence,
                ),
                _ => (None, None, 0.0),
            };
            let correct = predicted.as_deref() == Some(name.as_str());

            info!(
                reference = %name,
                start_ms,
                predicted = predicted.as_deref().unwrap_or("-"),
                confidence,
                correct,
                "snippet"
            );

            summary.total += 1;
            summary.correct += correct as usize;
            summary.results.push(SnippetResult {
                reference: name.clone(),
                start_ms,
                predicted,
                offset_ms,
                confidence,
                correct,
            });
        }
    }

    info!(
        total = summary.total,
        correct = summary.correct,
        accuracy = summary.accuracy(),
        "random snippet test finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::audio_processor::MemorySource;
    use crate::config::Config;
    use crate::db::MemoryStore;
    use crate::testing;

    #[tokio::test]
    async fn snippets_of_ingested_tracks_are_recognized() {
        let recognizer =
            Recognizer::new(Arc::new(MemoryStore::new()), Config::default()).unwrap();
        let references: Vec<MemorySource> = (0..3)
            .map(|seed| {
                MemorySource::new(
                    format!("track-{seed}"),
                    testing::synthetic_track(100 + seed, 40.0, 11025),
                )
            })
            .collect();
        for report in recognizer.ingest_all(references.clone()).await {
            report.result.unwrap();
        }

        let mut rng = StdRng::seed_from_u64(17);
        let summary = run_random_snippet_test(
            &recognizer,
            references,
            SnippetTest {
                snippets_per_track: 2,
                snippet_ms: 5_000,
            },
            &mut rng,
        )
        .await
        .unwrap();

        assert_eq!(summary.total, 6);
        assert_eq!(summary.correct, 6);
        assert!(summary.skipped.is_empty());
        for result in &summary.results {
            let offset = result.offset_ms.unwrap();
            assert!((offset - result.start_ms as i64).abs() <= 100);
        }
    }

    #[tokio::test]
    async fn short_references_are_skipped() {
        let recognizer =
            Recognizer::new(Arc::new(MemoryStore::new()), Config::default()).unwrap();
        let short = MemorySource::new("short", testing::synthetic_track(1, 4.0, 11025));

        let summary = run_random_snippet_test(
            &recognizer,
            vec![short],
            SnippetTest::default(),
            &mut StdRng::seed_from_u64(1),
        )
        .await
        .unwrap();

        assert_eq!(summary.total, 0);
        assert_eq!(summary.skipped, vec!["short".to_string()]);
        assert_eq!(summary.accuracy(), 0.0);
    }
}
