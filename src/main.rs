//! facefan engine: watch the drop zone, process photos, mirror the tree.
//!
//! ## Usage
//!
//! ```bash
//! facefan                    # run with the default config
//! facefan --config my.toml   # explicit config file
//! facefan --dry-run          # log intended effects without mutating
//! ```

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use facefan::analyzer::onnx::OnnxAnalyzerFactory;
use facefan::config::Config;
use facefan::sync::FlagEvent;
use facefan::{logging, supervisor};

struct Args {
    config_path: Option<PathBuf>,
    dry_run: bool,
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let mut args = Args { config_path: None, dry_run: false };

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < argv.len() {
                    args.config_path = Some(PathBuf::from(&argv[i + 1]));
                    i += 1;
                }
            }
            "--dry-run" | "-n" => {
                args.dry_run = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    args
}

fn print_help() {
    println!(
        r#"facefan - event-photo ingestion and face-clustering engine

USAGE:
    facefan [OPTIONS]

OPTIONS:
    --config, -c PATH   Path to config file
    --dry-run, -n       Log intended routing/remote effects without mutating
    --help, -h          Show this help message

ENVIRONMENT:
    FACEFAN_CONFIG      Path to config file (overrides default location)
    FACEFAN_LOG         Log level (trace, debug, info, warn, error)

The engine watches <event_root>/Incoming for new photos, detects and
clusters faces, fans photos out into People/<name>/Solo|Group, and keeps a
durable queue of uploads to the remote mirror. Enroll guests with the
facefan-enroll binary."#
    );
}

fn main() -> Result<()> {
    let args = parse_args();

    logging::init(None)?;

    let mut config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if args.dry_run {
        config.routing.dry_run = true;
    }

    info!("==================================================");
    info!("  facefan engine");
    info!("==================================================");
    info!(event_root = ?config.event_root, "event root");
    info!(db = ?config.database.path, "database");
    info!(workers = config.processing.worker_count, "worker pool");
    info!(threshold = config.processing.cluster_threshold, "cluster threshold");
    info!(dry_run = config.routing.dry_run, "dry run");
    info!("==================================================");

    let shutdown = Arc::new(FlagEvent::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            shutdown.set();
        })?;
    }

    let analyzer_factory = OnnxAnalyzerFactory::shared();

    // The remote-store backend is injected by deployments that have one;
    // without it the engine runs local-only and keeps the queue durable.
    supervisor::run(&config, analyzer_factory, None, shutdown)
}
