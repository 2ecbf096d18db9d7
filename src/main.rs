//! voice-broadcast command-line entry point.
//!
//! # Startup sequence
//!
//! 1. Parse the command line.
//! 2. Initialise logging.
//! 3. Load [`AppConfig`] (`--config` path or the platform default; a
//!    missing file yields defaults) and apply command-line overrides.
//! 4. Create the [`tokio`] runtime (multi-thread, 2 workers).
//! 5. Run the subcommand until it finishes or Ctrl-C arrives.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use voice_broadcast::{
    audio::{list_devices, CpalOutput, FormatConverter, PlaybackEvent, PlaybackSequencer},
    config::{AppConfig, Args, Command},
    pipeline::Broadcaster,
    stream::TransportState,
};

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    // 1. Command line
    let args = Args::parse();

    // 2. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_filter()))
        .init();

    // 3. Configuration
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => AppConfig::load().unwrap_or_else(|e| {
            log::warn!("Failed to load config ({e}); using defaults");
            AppConfig::default()
        }),
    };

    if let Command::Devices = args.command {
        return cmd_devices();
    }

    // 4. Tokio runtime (2 workers: upload request + keep-alive / signals)
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    // 5. Subcommand
    match args.command {
        Command::Stream { server, broadcast } => {
            if let Some(server) = server {
                config.server.server_url = server;
            }
            if let Some(broadcast) = broadcast {
                config.server.broadcast_id = broadcast;
            }
            rt.block_on(cmd_stream(config))
        }
        Command::Play { file, chunk_bytes } => {
            let chunk_bytes = chunk_bytes.unwrap_or(config.audio.playback_chunk_bytes);
            rt.block_on(cmd_play(&config, &file, chunk_bytes))
        }
        Command::Devices => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

fn cmd_devices() -> anyhow::Result<()> {
    let devices = list_devices()?;

    println!("Input devices:");
    for name in &devices.inputs {
        println!("  {name}");
    }
    println!("Output devices:");
    for name in &devices.outputs {
        println!("  {name}");
    }
    Ok(())
}

async fn cmd_stream(config: AppConfig) -> anyhow::Result<()> {
    let broadcaster = Broadcaster::with_default_devices(config)?;
    broadcaster.start_recording().await?;
    log::info!("{}; press Ctrl-C to stop", broadcaster.status().label());

    let ended = upload_ended(broadcaster.transport_changes());
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            log::info!("Ctrl-C received, stopping");
        }
        state = ended => {
            log::error!("upload ended unexpectedly ({})", state.label());
        }
    }

    broadcaster.stop_recording().await;
    Ok(())
}

/// Resolves when the upload reaches a terminal state.
async fn upload_ended(changes: Option<watch::Receiver<TransportState>>) -> TransportState {
    let Some(mut changes) = changes else {
        return TransportState::Closed;
    };
    // Bound before returning: the `Ref` temporary borrows `changes`.
    let state = match changes.wait_for(TransportState::is_terminal).await {
        Ok(state) => *state,
        Err(_) => TransportState::Closed,
    };
    state
}

async fn cmd_play(config: &AppConfig, file: &Path, chunk_bytes: usize) -> anyhow::Result<()> {
    let pcm = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    if pcm.is_empty() {
        log::warn!("{} is empty, nothing to play", file.display());
        return Ok(());
    }

    let converter = FormatConverter::new(config.audio.interpolation);
    let output = CpalOutput::new(config.audio.output_device.as_deref(), converter)?;
    let sequencer = PlaybackSequencer::new(Arc::new(output));
    let events = sequencer.subscribe();

    // Whole frames only.
    let chunk_bytes = chunk_bytes.max(2) & !1;
    for chunk in pcm.chunks(chunk_bytes) {
        sequencer.play(chunk)?;
    }
    log::info!(
        "playing {} ({} bytes in {} chunk(s))",
        file.display(),
        pcm.len(),
        pcm.len().div_ceil(chunk_bytes)
    );

    let finished = tokio::task::spawn_blocking(move || events.recv());
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            sequencer.stop();
            log::info!("playback stopped");
        }
        event = finished => {
            match event? {
                Ok(PlaybackEvent::Complete) => log::info!("playback complete"),
                Ok(PlaybackEvent::Stopped) => log::info!("playback stopped"),
                Err(_) => log::warn!("playback ended without a completion event"),
            }
        }
    }
    Ok(())
}
