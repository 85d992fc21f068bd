use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use demo_recorder::config::DEFAULT_POLL_INTERVAL_MS;
use demo_recorder::logging::init_tracing;
use demo_recorder::{
    Artifact, AudioInput, Calibration, DirectoryStorage, Listener, RecordingConfig,
    UploadCoordinator, UploadConfig, UploadState,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "demo-recorder")]
#[command(about = "Records while the microphone hears something and uploads each recording", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Power level (dBFS) the signal must rise above to start and fall below to stop
    #[arg(long, allow_hyphen_values = true, global = true)]
    threshold: Option<f64>,

    /// Seconds of sound required before recording starts
    #[arg(long, value_name = "SECS", global = true)]
    min_trigger_time: Option<f64>,

    /// Seconds of quiet required before recording stops
    #[arg(long, value_name = "SECS", global = true)]
    min_record_time: Option<f64>,

    /// Milliseconds between sensor readings
    #[arg(long, value_name = "MS", default_value_t = DEFAULT_POLL_INTERVAL_MS, global = true)]
    poll_interval: u64,

    /// Directory finished recordings are written to
    #[arg(long, value_name = "DIR", default_value = "./recordings", global = true)]
    output_dir: PathBuf,

    /// Directory acting as the upload bucket (overrides DR_BUCKET_DIR)
    #[arg(long, value_name = "DIR", global = true)]
    bucket_dir: Option<PathBuf>,

    /// Key prefix inside the bucket (overrides DR_KEY_PREFIX)
    #[arg(long, value_name = "PREFIX", global = true)]
    key_prefix: Option<String>,

    /// Give up on a file after this many retries (default: retry forever)
    #[arg(long, value_name = "N", global = true)]
    max_retries: Option<u32>,

    /// Milliseconds to wait before retrying a failed upload
    #[arg(long, value_name = "MS", global = true)]
    retry_delay: Option<u64>,

    /// Print status as JSON lines instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen and record on activity (the default)
    Listen,
    /// Upload existing recordings; each file is deleted once stored
    Upload {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Serialize)]
struct StatusLine<'a, T: Serialize> {
    kind: &'a str,
    status: &'a T,
}

fn print_status<T: Serialize + std::fmt::Display>(json: bool, kind: &str, status: &T) {
    if json {
        match serde_json::to_string(&StatusLine { kind, status }) {
            Ok(line) => println!("{}", line),
            Err(e) => error!(error = %e, "could not encode status"),
        }
    } else {
        let text = status.to_string();
        if !text.is_empty() {
            println!("{}", text);
        }
    }
}

fn upload_config(args: &Args) -> UploadConfig {
    let mut config = UploadConfig::from_env();

    // CLI args override environment variables
    if let Some(dir) = &args.bucket_dir {
        config.bucket_dir = dir.clone();
    }
    if let Some(prefix) = &args.key_prefix {
        config.key_prefix = prefix.trim_matches('/').to_string();
    }
    if let Some(max) = args.max_retries {
        config.max_retries = Some(max);
    }
    if let Some(delay) = args.retry_delay {
        config.retry_delay = Duration::from_millis(delay);
    }

    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let config = upload_config(&args);
    let storage = Arc::new(DirectoryStorage::new(config.bucket_dir.clone()));
    let uploads = UploadCoordinator::new(storage, config)?;

    match &args.command {
        Some(Command::Upload { files }) => upload_files(&args, uploads, files).await,
        Some(Command::Listen) | None => listen(&args, uploads).await,
    }
}

async fn upload_files(args: &Args, uploads: UploadCoordinator, files: &[PathBuf]) -> Result<()> {
    let mut keys = Vec::new();
    for file in files {
        let artifact = Artifact::for_recording(file, &uploads.config().key_prefix)
            .with_context(|| format!("cannot upload {}", file.display()))?;
        keys.push(artifact.key.clone());
        uploads.submit(artifact);
    }

    let mut progress = uploads.subscribe();
    let settled = uploads.settled();
    tokio::pin!(settled);

    loop {
        tokio::select! {
            _ = &mut settled => break,
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = progress.borrow_and_update().clone();
                print_status(args.json, "uploads", &view);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    let failed: Vec<String> = keys
        .iter()
        .filter_map(|key| uploads.task(key).map(|task| (key, task.state)))
        .filter(|(_, state)| !matches!(state, UploadState::InFlight(_) | UploadState::RetryPending))
        .map(|(key, state)| format!("{} ({:?})", key, state))
        .collect();

    if failed.is_empty() {
        println!("All uploads finished.");
        Ok(())
    } else {
        anyhow::bail!("uploads did not complete: {}", failed.join(", "))
    }
}

async fn listen(args: &Args, uploads: UploadCoordinator) -> Result<()> {
    let calibration = Calibration::from_cli_args(
        args.threshold,
        args.min_trigger_time,
        args.min_record_time,
    );
    let recording = RecordingConfig {
        output_dir: args.output_dir.clone(),
    };

    // Without an input device there is no session to run.
    let mut listener = match Listener::start(
        AudioInput::open,
        uploads.clone(),
        &recording,
        Duration::from_millis(args.poll_interval),
        &calibration,
    ) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("❌ Cannot proceed: {}", e);
            return Err(e.into());
        }
    };

    let config = listener.detector().configuration();
    println!("Waiting for audio activity...");
    println!(
        "Threshold {:.1} dB, {:.2}s to start, {:.2}s to stop. Press Ctrl-C to quit.",
        config.threshold,
        config.dwell_to_start.as_secs_f64(),
        config.dwell_to_stop.as_secs_f64()
    );

    let mut status = listener.session().subscribe_status();
    let mut progress = uploads.subscribe();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                print_status(args.json, "detector", &current);
            }
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = progress.borrow_and_update().clone();
                print_status(args.json, "uploads", &view);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    if let Err(e) = listener.stop() {
        error!(error = %e, "could not finish the open recording");
    }

    if uploads.has_active() {
        println!("Waiting for uploads to finish (Ctrl-C again to quit)...");
        tokio::select! {
            _ = uploads.settled() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    Ok(())
}
