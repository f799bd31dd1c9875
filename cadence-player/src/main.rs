//! Cadence Player (cadence-player) - Main entry point
//!
//! Plays synthetic audio and video streams through loopback pipelines on a
//! dedicated job thread and reports the decoder statistics.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cadence_common::logging;
use cadence_player::decoder::PipelineStats;
use cadence_player::job::JobThread;
use cadence_player::session::{PlaybackSession, SessionPlan, SessionReport};
use cadence_player::PlayerConfig;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Streams to play
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StreamSelection {
    Audio,
    Video,
    Both,
}

/// Command-line arguments for cadence-player
#[derive(Parser, Debug)]
#[command(name = "cadence-player")]
#[command(about = "Job-queue driven media decoder demo")]
#[command(version)]
struct Args {
    /// Configuration file (overrides CADENCE_CONFIG and the user config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input buffers pushed per stream
    #[arg(short, long, default_value = "120")]
    buffers: usize,

    /// Streams to play
    #[arg(short, long, value_enum, default_value = "both")]
    stream: StreamSelection,

    /// Print the final statistics as JSON
    #[arg(long)]
    stats_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("cadence_player=info,cadence_common=info")
        .context("Failed to initialize logging")?;

    let args = Args::parse();

    let config = PlayerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    info!(
        "Update interval {}ms, watermarks {}/{}, frame pool {}",
        config.update_interval_ms,
        config.low_water_mark,
        config.high_water_mark,
        config.frame_pool_size
    );

    let plan = SessionPlan {
        audio: args.stream != StreamSelection::Video,
        video: args.stream != StreamSelection::Audio,
        buffers_per_stream: args.buffers,
        ..SessionPlan::default()
    };

    let job_thread = Arc::new(JobThread::spawn("playback").context("Failed to start job thread")?);
    let (done_tx, done_rx) = oneshot::channel();

    let start_thread = Arc::clone(&job_thread);
    let session = tokio::task::spawn_blocking(move || -> Result<PlaybackSession> {
        let queue = start_thread.queue();
        start_thread
            .run_sync(move || {
                PlaybackSession::start(&queue, &config, plan, move || {
                    let _ = done_tx.send(());
                })
            })
            .context("Playback thread stopped before the session started")?
            .context("Failed to start playback session")
    })
    .await
    .context("Session start task failed")??;
    info!("Playback started ({} buffers per stream)", plan.buffers_per_stream);

    let interrupted = tokio::select! {
        _ = done_rx => false,
        _ = shutdown_signal() => true,
    };

    // The session's decoders must be dropped on the job thread.
    let report = tokio::task::spawn_blocking(move || -> Result<SessionReport> {
        let report = job_thread
            .run_sync(move || {
                let report = session.report();
                drop(session);
                report
            })
            .context("Playback thread stopped before teardown")?;
        drop(job_thread);
        Ok(report)
    })
    .await
    .context("Teardown task failed")??;

    if interrupted {
        warn!("Playback interrupted after {}ms", report.elapsed_ms);
    }

    if args.stats_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        log_report(&report);
    }

    info!("Shutdown complete");
    Ok(())
}

fn log_report(report: &SessionReport) {
    let streams = [("audio", &report.audio), ("video", &report.video)];
    for (name, stream) in streams {
        let Some(stream) = stream else { continue };
        let PipelineStats {
            inputs_consumed,
            outputs_delivered,
            backpressure_retries,
            flow_pauses,
            errors,
            ..
        } = stream.stats;
        info!(
            "{}: {} in, {} out, {} read, {} retries, {} pauses, {} errors, finished={}",
            name,
            inputs_consumed,
            outputs_delivered,
            stream.outputs_read,
            backpressure_retries,
            flow_pauses,
            errors,
            stream.finished
        );
        if let Some(error) = &stream.error {
            warn!("{}: {}", name, error);
        }
    }
    if let Some(pool) = &report.frame_pool {
        info!(
            "frame pool: {} slots, {} in use, {} allocations, {} saturations",
            pool.capacity, pool.in_use, pool.allocations, pool.saturations
        );
    }
    info!("elapsed {}ms", report.elapsed_ms);
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
