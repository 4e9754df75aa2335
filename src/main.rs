use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

mod config;
mod db;
mod error;
mod hash;
mod identity;
mod index;
mod orchestrator;
mod provider;
mod resume;
mod retry;
mod session;

use config::Config;
use db::Database;
use orchestrator::{UploadPolicy, Uploader};
use session::TransferProgress;
use tokio::sync::mpsc::UnboundedReceiver;

/// Exit status for failures worth retrying later (EX_TEMPFAIL)
const EXIT_RETRYABLE: u8 = 75;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Upload files to storage backends and print shareable links", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file and print its link
    Upload {
        /// Path to the file to upload
        file: PathBuf,

        /// Upload only to this backend
        #[arg(long)]
        backend: Option<String>,

        /// Upload to --backend even if another backend already has the file
        #[arg(long)]
        allow_duplicates: bool,

        /// Chunk size, e.g. 320K or 5M
        #[arg(long, value_parser = parse_size)]
        chunk_size: Option<u64>,
    },

    /// Print the content identity of a file
    Hash {
        file: PathBuf,
    },

    /// Show where a file has already been uploaded
    Lookup {
        file: PathBuf,
    },

    /// List every recorded upload
    List {
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Show configured backends in priority order
    Backends,

    /// Show interrupted uploads that can be resumed
    Sessions,
}

/// Parse a byte count with an optional K, M or G suffix (powers of 1024)
fn parse_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let digits = trimmed.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let suffix = trimmed[digits.len()..].to_ascii_uppercase();

    let multiplier: u64 = match suffix.trim_end_matches('B') {
        "" => 1,
        "K" | "KI" => 1024,
        "M" | "MI" => 1024 * 1024,
        "G" | "GI" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix in {input:?}")),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size {input:?}"))?;

    match value.checked_mul(multiplier) {
        Some(0) => Err("size must be greater than zero".to_string()),
        Some(bytes) => Ok(bytes),
        None => Err(format!("size {input:?} is too large")),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr; stdout carries only links and listings
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Hashing needs neither configuration nor the index
    if let Commands::Hash { file } = &cli.command {
        return print_identity(file).await;
    }

    let config = Config::load().await.context("Failed to load configuration")?;
    let db = Database::open(&config.db_path())
        .await
        .with_context(|| format!("Failed to open index at {}", config.db_path().display()))?;
    let uploader = Uploader::from_config(&config, db.clone())?;

    let status = run(cli.command, &config, &uploader).await;
    db.close().await;
    status
}

/// Log transfer progress in steps of a tenth of the file
async fn log_progress(file: PathBuf, mut reports: UnboundedReceiver<TransferProgress>) {
    let mut logged = 0;
    while let Some(report) = reports.recv().await {
        let tenths = report.committed.saturating_mul(10) / report.total.max(1);
        if tenths > logged {
            logged = tenths;
            tracing::info!(
                "{}: {}% ({} of {} bytes)",
                file.display(),
                tenths * 10,
                report.committed,
                report.total
            );
        }
    }
}

async fn print_identity(file: &Path) -> Result<ExitCode> {
    let identity = identity::identify(file).await?;
    println!("{identity}");
    Ok(ExitCode::SUCCESS)
}

async fn run(command: Commands, config: &Config, uploader: &Uploader) -> Result<ExitCode> {
    match command {
        Commands::Upload {
            file,
            backend,
            allow_duplicates,
            chunk_size,
        } => {
            let mut policy = UploadPolicy::from_config(config);
            policy.preferred_backend = backend;
            policy.allow_duplicate_across_backends |= allow_duplicates;
            policy.chunk_size_override = chunk_size;

            let (progress, reports) = tokio::sync::mpsc::unbounded_channel();
            policy.progress = Some(progress);
            let progress_log = tokio::spawn(log_progress(file.clone(), reports));

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted; stopping at the next chunk boundary");
                    on_interrupt.cancel();
                }
            });

            let result = uploader.upload(&file, &policy, &cancel).await;
            drop(policy);
            if let Err(e) = progress_log.await {
                tracing::debug!("Progress logger ended abnormally: {}", e);
            }

            match result {
                Ok(receipt) => {
                    if !receipt.reused {
                        tracing::info!("Uploaded {} to {}", file.display(), receipt.entry.backend_id);
                    }
                    println!("{}", receipt.link());
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    tracing::error!("{:#}", anyhow::Error::from(err));
                    if retryable {
                        Ok(ExitCode::from(EXIT_RETRYABLE))
                    } else {
                        Ok(ExitCode::FAILURE)
                    }
                }
            }
        }
        Commands::Hash { file } => print_identity(&file).await,
        Commands::Lookup { file } => {
            let (identity, entries) = uploader.locate(&file).await?;
            if entries.is_empty() {
                tracing::info!("{} has not been uploaded", identity);
                return Ok(ExitCode::FAILURE);
            }
            for entry in entries {
                println!("{}\t{}", entry.backend_id, entry.link);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::List { json } => {
            let mut entries = uploader.index().all();
            while let Some(entry) = entries.next().await {
                let entry = entry?;
                if json {
                    println!("{}", serde_json::to_string(&entry)?);
                } else {
                    println!(
                        "{}\t{}\t{}\t{}",
                        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.identity,
                        entry.backend_id,
                        entry.link
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backends => {
            for backend in uploader.descriptors() {
                let limit = if backend.max_object_size == u64::MAX {
                    "unlimited".to_string()
                } else {
                    format!("{} bytes", backend.max_object_size)
                };
                let mut capabilities = Vec::new();
                if backend.supports_resume {
                    capabilities.push("resume");
                }
                if backend.supports_delete {
                    capabilities.push("delete");
                }
                println!(
                    "{}\tpriority {}\tmax {}\t{}",
                    backend.id,
                    backend.priority,
                    limit,
                    capabilities.join(",")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sessions => {
            for session in uploader.sessions().list().await? {
                println!(
                    "{}\t{}\tattempt {}\tlast active {}",
                    session.identity(),
                    session.backend_id(),
                    session.attempt,
                    session.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_upload_arguments() {
        let cli = Cli::try_parse_from([
            "ferry",
            "upload",
            "report.pdf",
            "--backend",
            "archive",
            "--chunk-size",
            "320K",
        ])
        .unwrap();

        match cli.command {
            Commands::Upload {
                file,
                backend,
                allow_duplicates,
                chunk_size,
            } => {
                assert_eq!(file, PathBuf::from("report.pdf"));
                assert_eq!(backend.as_deref(), Some("archive"));
                assert!(!allow_duplicates);
                assert_eq!(chunk_size, Some(320 * 1024));
            }
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("5M"), Ok(5 * 1024 * 1024));
        assert_eq!(parse_size("5mb"), Ok(5 * 1024 * 1024));
        assert_eq!(parse_size("1GiB"), Ok(1024 * 1024 * 1024));
        assert!(parse_size("0").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("M").is_err());
    }
}
