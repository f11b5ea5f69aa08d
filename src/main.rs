use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{ArgGroup, Parser};
use tracing_subscriber::EnvFilter;

use songmark::db::PgStore;
use songmark::tester::{self, SnippetTest};
use songmark::{
    Config, FileSource, IngestOutcome, MatchOutcome, Recognition, Recognizer, TrackId, server,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(&["ingest", "recognise", "match", "random_test", "remove", "list", "stats", "purge", "serve"]),
))]
struct Args {
    /// Ingest files into the catalog
    #[arg(long)]
    ingest: bool,

    /// Recognise audio from microphone input
    #[arg(long)]
    recognise: bool,

    /// Match a snippet file against the catalog
    #[arg(long = "match", id = "match")]
    match_: bool,

    /// Audio files for --ingest, --match and --random-test
    #[arg(short, long, num_args = 1..)]
    file: Vec<PathBuf>,

    /// Recognise random snippets cut from already ingested files
    #[arg(long)]
    random_test: bool,

    /// Remove a track and its fingerprints
    #[arg(long, value_name = "TRACK_ID")]
    remove: Option<i32>,

    /// List the catalog
    #[arg(long)]
    list: bool,

    /// Show catalog counts
    #[arg(long)]
    stats: bool,

    /// Drop tracks left without fingerprints by failed ingests
    #[arg(long)]
    purge: bool,

    /// Serve the HTTP API on this address
    #[arg(long, value_name = "ADDR")]
    serve: Option<SocketAddr>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Seconds to record for --recognise
    #[arg(long, default_value_t = 5)]
    seconds: u64,

    /// Snippets per file for --random-test
    #[arg(long, default_value_t = 3)]
    snippets: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("loading configuration")?;
    let store = PgStore::connect(&config.store).context("connecting to the fingerprint store")?;
    let recognizer = Recognizer::new(Arc::new(store), config).context("building recognizer")?;

    if args.ingest {
        ingest_files(&recognizer, &args.file, args.json).await
    } else if args.recognise {
        recognise_microphone(&recognizer, args.seconds, args.json).await
    } else if args.match_ {
        let [file] = args.file.as_slice() else {
            bail!("--match requires exactly one --file <path>");
        };
        let source = FileSource::new(file, recognizer.audio_processor());
        let recognition = recognizer
            .recognize(source)
            .await
            .with_context(|| format!("matching {}", file.display()))?;
        print_recognition(&recognition, args.json)
    } else if args.random_test {
        random_test(&recognizer, &args.file, args.snippets, args.json).await
    } else if let Some(id) = args.remove {
        let removed = recognizer
            .remove_track(TrackId(id))
            .await
            .with_context(|| format!("removing track {id}"))?;
        println!("Removed track {id} ({removed} fingerprints)");
        Ok(())
    } else if args.list {
        let tracks = recognizer.list_tracks().await.context("listing tracks")?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&tracks)?);
        } else {
            for track in tracks {
                println!(
                    "{:>6}  {:<40}  {:>8}  {:>8} fps{}",
                    track.id.0,
                    track.name,
                    format_offset(track.duration_ms as i64),
                    track.fingerprint_count,
                    if track.fingerprinted { "" } else { "  (incomplete)" }
                );
            }
        }
        Ok(())
    } else if args.stats {
        let stats = recognizer.stats().await.context("reading catalog stats")?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!(
                "tracks: {} ({} fingerprinted)\nfingerprints: {}",
                stats.tracks, stats.fingerprinted_tracks, stats.fingerprints
            );
        }
        Ok(())
    } else if args.purge {
        let purged = recognizer
            .purge_unfingerprinted()
            .await
            .context("purging incomplete tracks")?;
        println!("Purged {} incomplete tracks", purged.len());
        Ok(())
    } else if let Some(addr) = args.serve {
        server::serve(recognizer, addr)
            .await
            .with_context(|| format!("serving on {addr}"))
    } else {
        Ok(())
    }
}

async fn ingest_files(
    recognizer: &Recognizer<PgStore>,
    files: &[PathBuf],
    json: bool,
) -> anyhow::Result<()> {
    if files.is_empty() {
        bail!("--ingest requires --file <path>");
    }

    let sources: Vec<FileSource> = files
        .iter()
        .map(|path| FileSource::new(path, recognizer.audio_processor()))
        .collect();
    let reports = recognizer.ingest_all(sources).await;

    let mut failed = 0;
    for report in &reports {
        match &report.result {
            Ok(outcome) if json => println!("{}", serde_json::to_string(outcome)?),
            Ok(IngestOutcome::Ingested { track, fingerprints }) => println!(
                "Ingested '{}' as track {} ({} fingerprints)",
                report.source, track.id, fingerprints
            ),
            Ok(IngestOutcome::AlreadyIngested { track }) => println!(
                "Skipped '{}', already ingested as track {}",
                report.source, track.id
            ),
            Err(err) => {
                failed += 1;
                if json {
                    println!(
                        "{}",
                        serde_json::json!({ "source": report.source, "error": err.to_string() })
                    );
                } else {
                    eprintln!("Failed '{}': {}", report.source, err);
                }
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} files failed to ingest", reports.len());
    }
    Ok(())
}

#[cfg(feature = "microphone")]
async fn recognise_microphone(
    recognizer: &Recognizer<PgStore>,
    seconds: u64,
    json: bool,
) -> anyhow::Result<()> {
    use songmark::MicrophoneSource;
    use std::time::Duration;

    println!("Recording for {seconds} seconds...");
    let source = MicrophoneSource::new(Duration::from_secs(seconds), recognizer.audio_processor());
    let recognition = recognizer
        .recognize(source)
        .await
        .context("recognising microphone input")?;
    print_recognition(&recognition, json)
}

#[cfg(not(feature = "microphone"))]
async fn recognise_microphone(
    _recognizer: &Recognizer<PgStore>,
    _seconds: u64,
    _json: bool,
) -> anyhow::Result<()> {
    bail!("built without microphone support; rebuild with --features microphone")
}

async fn random_test(
    recognizer: &Recognizer<PgStore>,
    files: &[PathBuf],
    snippets: usize,
    json: bool,
) -> anyhow::Result<()> {
    if files.is_empty() {
        bail!("--random-test requires --file <path>...");
    }

    let references: Vec<FileSource> = files
        .iter()
        .map(|path| FileSource::new(path, recognizer.audio_processor()))
        .collect();
    let test = SnippetTest {
        snippets_per_track: snippets,
        ..SnippetTest::default()
    };
    let summary = tester::run_random_snippet_test(recognizer, references, test, &mut rand::rng())
        .await
        .context("running random snippet test")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for result in &summary.results {
            println!(
                "{} {} @ {} -> {}",
                if result.correct { "ok  " } else { "MISS" },
                result.reference,
                format_offset(result.start_ms as i64),
                result.predicted.as_deref().unwrap_or("no match")
            );
        }
        for skipped in &summary.skipped {
            println!("skipped {skipped}");
        }
        println!(
            "Correct matches: {} / {}\nAccuracy: {:.2}%",
            summary.correct,
            summary.total,
            summary.accuracy() * 100.0
        );
    }
    Ok(())
}

fn print_recognition(recognition: &Recognition, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(recognition)?);
        return Ok(());
    }

    match &recognition.outcome {
        MatchOutcome::Matched(best) => {
            let name = recognition
                .track
                .as_ref()
                .map(|t| t.name.as_str())
                .unwrap_or("<unknown>");
            println!(
                "Match: track {} \"{}\" at {} (votes {}, confidence {:.2})",
                best.track_id,
                name,
                format_offset(best.offset_ms),
                best.vote_count,
                best.confidence
            );
        }
        MatchOutcome::NoMatch => println!("No match"),
        MatchOutcome::EmptyQuery => {
            println!("No fingerprints could be extracted; the clip may be silent")
        }
    }

    for candidate in &recognition.candidates {
        println!(
            "  track={} votes={} hits={} offset={} confidence={:.3}",
            candidate.track_id,
            candidate.vote_count,
            candidate.matched_hashes,
            format_offset(candidate.offset_ms),
            candidate.confidence
        );
    }
    println!(
        "{} hashes ({} distinct), fingerprint {} ms, match {} ms",
        recognition.query_hashes,
        recognition.distinct_hashes,
        recognition.fingerprint_ms,
        recognition.match_ms
    );
    Ok(())
}

fn format_offset(offset_ms: i64) -> String {
    let sign = if offset_ms < 0 { "-" } else { "" };
    let secs = offset_ms.unsigned_abs() / 1000;
    format!("{}{:02}:{:02}", sign, secs / 60, secs % 60)
}
