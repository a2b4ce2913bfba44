//! Site Backup Tool
//!
//! Copies a web application and its database off their hosts, packs them into
//! a chunked archive and uploads the chunks to an S3-compatible bucket.

// sitebackup/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use backup::logic::RunOutcome;
use config::AppConfig;
use errors::{AppError, StoreError};

const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    match run_app().await {
        Ok(outcome) => {
            match outcome {
                RunOutcome::Uploaded {
                    chunks,
                    resumed_from: 0,
                } => println!("✅ Uploaded {} chunk(s).", chunks),
                RunOutcome::Uploaded {
                    chunks,
                    resumed_from,
                } => println!(
                    "✅ Resumed at chunk {} and completed the upload of {} chunk(s).",
                    resumed_from, chunks
                ),
                RunOutcome::AlreadyPresent { chunks } => {
                    println!("✅ All {} chunk(s) were already backed up. Nothing to do.", chunks)
                }
            }
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            if has_transport_failure(&e) {
                print_transport_guidance();
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_app() -> Result<RunOutcome> {
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let app_config = AppConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    println!("🚀 Starting Backup Process for {}...", app_config.site_name);
    let outcome = backup::run_backup_flow(&app_config)
        .await
        .context("Backup process failed")?;
    Ok(outcome)
}

fn has_transport_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<AppError>(),
            Some(AppError::Store(store)) if store.is_transport()
        ) || cause
            .downcast_ref::<StoreError>()
            .is_some_and(StoreError::is_transport)
    })
}

fn print_transport_guidance() {
    eprintln!("⚠️ The connection to the object store was interrupted.");
    eprintln!("   Run the tool again: chunks already in the bucket are skipped and the");
    eprintln!("   upload resumes at the first missing chunk.");
    eprintln!("   If uploads keep failing with 'connection reset by peer', the TCP window");
    eprintln!("   sizing of older Linux kernels may be at fault. Try:");
    eprintln!("     sysctl -w net.ipv4.tcp_wmem=\"4096 16384 512000\"");
    eprintln!("     sysctl -w net.ipv4.tcp_rmem=\"4096 87380 512000\"");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_found_through_context() {
        let err = anyhow::Error::new(AppError::Store(StoreError::Transport {
            operation: "PutObject",
            target: "bucket/key".to_string(),
            message: "connection reset by peer".to_string(),
        }))
        .context("Backup process failed");
        assert!(has_transport_failure(&err));
    }

    #[test]
    fn other_failures_get_no_transport_guidance() {
        let err = anyhow::Error::new(AppError::Config("site_name must be set".to_string()))
            .context("Failed to load application configuration");
        assert!(!has_transport_failure(&err));
    }
}
