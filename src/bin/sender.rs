//! Sender application
//!
//! Captures microphone audio and streams it to the receiver over UDP.
//! Arguments: destination host (required), port, preset
//! (voice-clean | high-quality | low-latency), gain (1.0-8.0).

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_link::audio::capture::{CapturePipeline, CpalSourceFactory};
use mic_link::audio::device::list_devices;
use mic_link::config::StreamingConfig;
use mic_link::constants::DEFAULT_PORT;
use mic_link::settings::PersistedSettings;

struct SenderArgs {
    host: String,
    port: u16,
    preset: String,
    gain: f32,
}

fn parse_args(args: &[String], settings: &PersistedSettings) -> Result<SenderArgs, String> {
    let host = match args.first().filter(|s| !s.trim().is_empty()) {
        Some(host) => host.clone(),
        None => {
            let Some(last) = settings
                .last_destination
                .as_ref()
                .and_then(|d| d.split(':').next())
            else {
                return Err(
                    "Usage: sender <host> [port] [voice-clean|high-quality|low-latency] [gain]"
                        .into(),
                );
            };
            last.to_string()
        }
    };

    let port = match args.get(1).filter(|s| !s.trim().is_empty()) {
        Some(raw) => match raw.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => return Err(format!("Invalid port: '{raw}'. Expected 1-65535.")),
        },
        None => DEFAULT_PORT,
    };

    let preset = args
        .get(2)
        .filter(|s| !s.trim().is_empty())
        .cloned()
        .or_else(|| settings.preset.clone())
        .unwrap_or_else(|| "voice-clean".into());
    if config_for_preset(&preset).is_none() {
        return Err(format!(
            "Invalid preset: '{preset}'. Expected voice-clean, high-quality, or low-latency."
        ));
    }

    let gain = match args.get(3).filter(|s| !s.trim().is_empty()) {
        Some(raw) => match raw.parse::<f32>() {
            Ok(gain) if (1.0..=8.0).contains(&gain) => gain,
            _ => return Err(format!("Invalid gain: '{raw}'. Expected 1.0-8.0.")),
        },
        None => settings.gain.unwrap_or(1.0),
    };

    Ok(SenderArgs {
        host,
        port,
        preset,
        gain,
    })
}

fn config_for_preset(preset: &str) -> Option<StreamingConfig> {
    match preset {
        "voice-clean" => Some(StreamingConfig::voice_clean()),
        "high-quality" => Some(StreamingConfig::high_quality_voice()),
        "low-latency" => Some(StreamingConfig::low_latency()),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = PersistedSettings::load();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let parsed = match parse_args(&args, &settings) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    match run(parsed, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: SenderArgs, mut settings: PersistedSettings) -> Result<()> {
    println!("=== Available Audio Devices ===");
    for device in list_devices() {
        if device.is_input {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!(
                "  {}{} ({} ch max)",
                device.name, default_marker, device.max_channels
            );
        }
    }
    println!();

    let config = config_for_preset(&args.preset)
        .unwrap_or_else(StreamingConfig::voice_clean);
    let destination = format!("{}:{}", args.host, args.port);
    tracing::info!(
        destination = %destination,
        config = %config.summary(),
        gain = %args.gain,
        "starting sender"
    );

    let pipeline = CapturePipeline::new(Arc::new(CpalSourceFactory));
    pipeline.set_gain(args.gain);
    pipeline.start(&args.host, args.port, config)?;

    let mut status_rx = pipeline.status_watch();
    let printer = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow().clone();
            let mut line = format!(
                "[status] streaming={}, packets/sec={}, input=\"{}\", dsp: {}",
                status.streaming, status.packets_per_second, status.active_input,
                status.dsp_summary,
            );
            if status.clipping_warning {
                line.push_str(", CLIPPING");
            }
            if let Some(warning) = &status.routing_warning {
                line.push_str(&format!(", routing: {warning}"));
            }
            if let Some(error) = &status.last_error {
                line.push_str(&format!(", lastError: {error}"));
            }
            println!("{line}");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    pipeline.stop();
    printer.abort();

    settings.last_destination = Some(format!("{}:{}", args.host, args.port));
    settings.preset = Some(args.preset);
    settings.gain = Some(args.gain);
    if let Err(e) = settings.save() {
        tracing::warn!(error = %e, "failed to persist settings");
    }

    Ok(())
}
