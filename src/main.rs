mod crawl;
mod db;
mod entity;
mod error;
mod fetch;
mod journal;
mod parser;
mod persist;
mod session;
mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::crawl::{CrawlDriver, RunContext};
use crate::entity::EntityId;
use crate::fetch::HttpFetcher;
use crate::journal::{read_lines, Checkpoint};
use crate::parser::registry::CVLAC;
use crate::parser::sections::Router;
use crate::settings::Settings;

#[derive(Parser)]
#[command(name = "cvlac_harvester", about = "Resumable CvLAC researcher CV harvester")]
struct Cli {
    /// Config file (default: ./cvlac.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Fetch, parse and store a range of CV IDs
    Crawl {
        /// First ID of the range
        #[arg(long)]
        start: Option<u64>,
        /// Number of IDs to crawl
        #[arg(short = 'n', long)]
        total: Option<u64>,
        /// IDs per shard
        #[arg(long)]
        shard_size: Option<u64>,
        /// Concurrent workers
        #[arg(short, long)]
        workers: Option<usize>,
        /// Skip rows that already exist instead of updating them
        #[arg(long)]
        keep_existing: bool,
        /// No progress bar
        #[arg(short, long)]
        quiet: bool,
    },
    /// Checkpoint, error log, last session and table counts
    Status,
    /// Forget which IDs were attempted, so the next crawl retries them
    ResetCheckpoint {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
    /// Parse saved CV pages and print the extracted records as JSON
    Extract {
        /// HTML files; the ID is taken from each file stem
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Init => {
            let conn = db::connect(&settings.db_path, settings.db_busy_timeout())?;
            db::init_schema(&conn)?;
            println!("Schema ready at {}", settings.db_path.display());
            Ok(())
        }
        Commands::Crawl {
            start,
            total,
            shard_size,
            workers,
            keep_existing,
            quiet,
        } => {
            if let Some(start) = start {
                settings.start = start;
            }
            if let Some(total) = total {
                settings.total = total;
            }
            if let Some(shard_size) = shard_size {
                settings.shard_size = shard_size;
            }
            if let Some(workers) = workers {
                settings.workers = workers;
            }
            if keep_existing {
                settings.update_existing = false;
            }
            settings.validate()?;

            let conn = db::connect(&settings.db_path, settings.db_busy_timeout())?;
            db::init_schema(&conn)?;
            drop(conn);

            let fetcher = HttpFetcher::new(&settings.url_template, settings.fetch_timeout())?;
            let total = settings.total;
            let ctx = Arc::new(RunContext::open(settings)?);

            let cancel = ctx.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted; finishing in-flight IDs");
                    cancel.cancel();
                }
            });

            println!(
                "Crawling IDs {}..{} with {} workers...",
                ctx.settings.start,
                ctx.settings.start.saturating_add(total),
                ctx.settings.workers
            );
            let mut driver = CrawlDriver::new(Arc::clone(&ctx), fetcher, &CVLAC);
            if !quiet {
                driver = driver.with_progress(progress_bar(total));
            }
            let summary = driver.run().await?;
            summary.print();
            if let Some(path) = ctx.session.path() {
                println!("Session report: {}", path.display());
            }
            Ok(())
        }
        Commands::Status => status(&settings),
        Commands::ResetCheckpoint { yes } => {
            if !yes {
                bail!("Refusing to clear the checkpoint without --yes");
            }
            let path = settings.checkpoint_path();
            Checkpoint::clear(&path).with_context(|| format!("Failed to clear {:?}", path))?;
            println!("Checkpoint cleared: {}", path.display());
            Ok(())
        }
        Commands::Extract { files } => {
            let out = extract_files(&files, &settings.entity_column);
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn status(settings: &Settings) -> anyhow::Result<()> {
    let attempted = read_lines(&settings.checkpoint_path())?.len();
    let processed = read_lines(&settings.processed_path())?.len();
    let errors = read_lines(&settings.error_log_path())?.len();
    println!("Attempted: {}", attempted);
    println!("Processed: {}", processed);
    println!("Errors:    {}", errors);

    if let Some(report) = session::latest(&settings.sessions_dir())? {
        println!("\nLast session {}", report.session_id);
        println!("  started:  {}", report.started_at.to_rfc3339());
        match report.ended_at {
            Some(ended) => println!("  ended:    {}", ended.to_rfc3339()),
            None => println!("  ended:    (still running or interrupted)"),
        }
        println!(
            "  CVs:      {} ({} ok, {} failed)",
            report.cvlacs_processed, report.success_count, report.error_count
        );
        if let Some(rate) = report.success_rate {
            println!("  success:  {:.1}%", rate);
        }
    }

    if settings.db_path.exists() {
        let conn = db::connect(&settings.db_path, settings.db_busy_timeout())?;
        let counts = db::table_counts(&conn, &CVLAC.tables())?;
        println!("\n{:<24} | {:>8}", "Table", "Rows");
        println!("{}", "-".repeat(35));
        for (table, n) in counts {
            println!("{:<24} | {:>8}", table, n);
        }
    }
    Ok(())
}

/// Dry run: route each file through the catalog without touching the store.
fn extract_files(files: &[PathBuf], entity_column: &str) -> Vec<serde_json::Value> {
    use rayon::prelude::*;

    files
        .par_iter()
        .map(|path| extract_file(path, entity_column))
        .collect()
}

fn extract_file(path: &Path, entity_column: &str) -> serde_json::Value {
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse::<EntityId>().ok())
        .unwrap_or(EntityId::new(0));
    let file = path.display().to_string();

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => return serde_json::json!({ "file": file, "status": "error", "error": e.to_string() }),
    };
    let doc = match parser::parse_document(&bytes) {
        Ok(doc) => doc,
        Err(e) => return serde_json::json!({ "file": file, "status": "error", "error": e.to_string() }),
    };
    let router = Router::new(&CVLAC, entity_column);
    let routing = match router.route(&doc, id) {
        Ok(routing) => routing,
        Err(_) => return serde_json::json!({ "file": file, "cvlac_id": id.to_string(), "status": "empty" }),
    };
    let subject = routing.subject().to_string();
    let records: Vec<serde_json::Value> = routing
        .filter(|r| r.has_data())
        .map(|r| {
            serde_json::json!({
                "table": r.table,
                "fields": db::record_to_json(&r.record),
                "warnings": r.warnings.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
            })
        })
        .collect();

    serde_json::json!({
        "file": file,
        "cvlac_id": id.to_string(),
        "status": "ok",
        "subject": subject,
        "records": records,
    })
}

fn progress_bar(len: u64) -> indicatif::ProgressBar {
    use indicatif::{ProgressBar, ProgressStyle};

    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_reads_id_from_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0000000042.html");
        std::fs::copy("tests/fixtures/cvlac_full.html", &path).unwrap();
        let empty = dir.path().join("vacio.html");
        std::fs::copy("tests/fixtures/cvlac_empty.html", &empty).unwrap();

        let out = extract_files(&[path, empty, dir.path().join("missing.html")], "cvlac_id");
        assert_eq!(out[0]["status"], "ok");
        assert_eq!(out[0]["cvlac_id"], "0000000042");
        assert_eq!(out[0]["subject"], "JUAN CARLOS PEREZ GOMEZ");
        let records = out[0]["records"].as_array().unwrap();
        assert!(records.iter().any(|r| r["table"] == "articulos"));
        assert_eq!(out[1]["status"], "empty");
        assert_eq!(out[1]["cvlac_id"], "0000000000");
        assert_eq!(out[2]["status"], "error");
    }

    #[test]
    fn durations_are_humanized() {
        assert_eq!(format_duration(std::time::Duration::from_secs(75)), "1m 15s");
        assert_eq!(format_duration(std::time::Duration::from_secs(3725)), "1h 2m 5s");
    }
}
