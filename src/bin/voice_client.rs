//! Voice Client Application
//!
//! Joins a relay server, speaks from the microphone and plays every other
//! participant through the default output device.
//!
//! Usage: voice-client [--config <path>] [--server <url>] [--listen-only] [--null-audio] [--list-devices]

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use relay_voice_client::{
    audio::{list_devices, SimulatedOutputFactory},
    config::ClientConfig,
    events::{AppEvent, EventKind},
    SessionBackends, VoiceSession,
};

/// Interval between buffer status reports
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Clock step for the simulated output
const NULL_AUDIO_TICK: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    server: Option<String>,
    listen_only: bool,
    null_audio: bool,
    list_devices: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config = Some(iter.next().context("--config needs a path")?.into()),
            "--server" => args.server = Some(iter.next().context("--server needs a url")?),
            "--listen-only" => args.listen_only = true,
            "--null-audio" => args.null_audio = true,
            "--list-devices" => args.list_devices = true,
            other => bail!("unknown argument: {}", other),
        }
    }

    Ok(args)
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        let direction = match (device.is_input, device.is_output) {
            (true, true) => "in/out",
            (true, false) => "in",
            _ => "out",
        };
        println!("  {}{} ({}):", device.name, default_marker, direction);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;

    print_devices();
    if args.list_devices {
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::load_or_default()?,
    };
    if let Some(server) = args.server {
        config.server.base_url = server;
    }

    tracing::info!("Starting voice client against {}", config.server.base());

    let client_id = Uuid::new_v4();
    let mut backends = SessionBackends::native(&config, client_id)?;

    // Without a sound card the peers' timelines still advance in real time
    let mut ticker_task = None;
    if args.null_audio {
        let outputs = Arc::new(SimulatedOutputFactory::new(config.audio.sample_rate));
        backends.outputs = outputs.clone();

        ticker_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(NULL_AUDIO_TICK);
            loop {
                ticker.tick().await;
                outputs.advance_all(NULL_AUDIO_TICK.as_secs_f64());
            }
        }));
        tracing::info!("Playback goes to a simulated output");
    }

    let mut session = VoiceSession::with_backends(config, client_id, backends)?;

    let log_event = |event: &AppEvent| match event {
        AppEvent::UserJoin { id } => tracing::info!("{} joined", id),
        AppEvent::UserLeave { id } => tracing::info!("{} left", id),
        AppEvent::UserSpeak { id } => tracing::info!("{} is speaking", id),
        AppEvent::AudioSticker { sticker, url } => tracing::info!("Sticker {} ({})", sticker, url),
    };
    for kind in [EventKind::UserJoin, EventKind::UserLeave, EventKind::UserSpeak, EventKind::AudioSticker] {
        session.events().on(kind, log_event);
    }

    session.connect().await.context("failed to connect to relay server")?;

    match session.get_users().await {
        Ok(users) => tracing::info!("{} user(s) online: {:?}", users.len(), users),
        Err(e) => tracing::warn!("Could not fetch user list: {}", e),
    }

    if !args.listen_only {
        if let Err(e) = session.speak_on().await {
            tracing::warn!("Microphone unavailable, listening only: {}", e);
        }
    }

    tracing::info!("Voice client running. Press Ctrl+C to stop.");

    let mut status_interval = tokio::time::interval(STATUS_INTERVAL);
    status_interval.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
            _ = status_interval.tick() => {
                if !session.is_connected() {
                    tracing::warn!("Connection to relay server lost");
                    break;
                }

                for status in session.router().statuses() {
                    tracing::info!(
                        "{}: queued={} playing={} admitted={} discarded={} underruns={}",
                        status.peer,
                        status.queued,
                        status.is_playing,
                        status.stats.admitted,
                        status.stats.discarded,
                        status.stats.underruns
                    );
                }
            }
        }
    }

    session.disconnect().await;
    if let Some(task) = ticker_task {
        task.abort();
    }

    tracing::info!("Voice client stopped");
    Ok(())
}
