//! Receiver application
//!
//! Listens for the phone's UDP Opus stream and plays it on the selected
//! render device. Positional arguments, each optional and independently
//! validated: port, device substring, output latency ms, buffer length ms,
//! test tone seconds, jitter target delay ms, channels, bind address,
//! lock-sender ip.

use std::net::IpAddr;
use std::process::ExitCode;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_link::config::{DeviceSelector, ReceiverConfig};
use mic_link::engine::{EngineEvent, ReceiverEngine, ReceiverState};
use mic_link::error::{EngineError, Error};

fn parse_positive(args: &[String], index: usize, default: u32, name: &str) -> Result<u32, String> {
    let Some(raw) = args.get(index).filter(|s| !s.trim().is_empty()) else {
        return Ok(default);
    };
    match raw.parse::<u32>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(format!("Invalid {name}: '{raw}'. Expected a positive integer.")),
    }
}

fn parse_non_negative(
    args: &[String],
    index: usize,
    default: u32,
    name: &str,
) -> Result<u32, String> {
    let Some(raw) = args.get(index).filter(|s| !s.trim().is_empty()) else {
        return Ok(default);
    };
    raw.parse::<u32>()
        .map_err(|_| format!("Invalid {name}: '{raw}'. Expected a non-negative integer."))
}

fn parse_channels(args: &[String], index: usize, default: u16) -> Result<u16, String> {
    let Some(raw) = args.get(index).filter(|s| !s.trim().is_empty()) else {
        return Ok(default);
    };
    match raw.parse::<u16>() {
        Ok(value) if value == 1 || value == 2 => Ok(value),
        _ => Err(format!("Invalid channels: '{raw}'. Expected 1 or 2.")),
    }
}

fn parse_ip(args: &[String], index: usize, name: &str) -> Result<Option<IpAddr>, String> {
    let Some(raw) = args.get(index).filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    raw.parse::<IpAddr>()
        .map(Some)
        .map_err(|_| format!("Invalid {name}: '{raw}'. Expected an IP address."))
}

fn parse_config(args: &[String]) -> Result<ReceiverConfig, String> {
    let defaults = ReceiverConfig::default();

    let listen_port = parse_positive(args, 0, u32::from(defaults.listen_port), "port")?;
    let listen_port = u16::try_from(listen_port)
        .map_err(|_| format!("Invalid port: '{listen_port}'. Expected 1-65535."))?;

    let device = match args.get(1).filter(|s| !s.trim().is_empty()) {
        Some(substring) => DeviceSelector::NameSubstring(substring.clone()),
        None => DeviceSelector::SystemDefault,
    };

    let config = ReceiverConfig {
        listen_port,
        device,
        output_latency_ms: parse_positive(args, 2, defaults.output_latency_ms, "outputLatencyMs")?,
        buffer_length_ms: parse_positive(args, 3, defaults.buffer_length_ms, "bufferLengthMs")?,
        test_tone_seconds: parse_non_negative(
            args,
            4,
            defaults.test_tone_seconds,
            "testToneSeconds",
        )?,
        jitter_target_delay_ms: parse_non_negative(
            args,
            5,
            defaults.jitter_target_delay_ms,
            "jitterTargetDelayMs",
        )?,
        channels: parse_channels(args, 6, defaults.channels)?,
        bind_address: parse_ip(args, 7, "bindAddress")?.unwrap_or(defaults.bind_address),
        lock_to_sender_ip: parse_ip(args, 8, "lockSenderIp")?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match parse_config(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ReceiverConfig) -> Result<()> {
    let engine = ReceiverEngine::new();

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::State(state) => println!("[state] {state:?}"),
                EngineEvent::Stats(stats) => println!("[stats] {}", stats.summary()),
                EngineEvent::Log(line) => println!("{line}"),
            }
        }
    });

    engine.start(config).await?;

    // Run until Ctrl-C or an asynchronous session fault
    let mut state_rx = engine.state_watch();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("shutdown requested");
        }
        _ = async {
            while state_rx.changed().await.is_ok() {
                if *state_rx.borrow() == ReceiverState::Faulted {
                    break;
                }
            }
        } => {}
    }

    match engine.stop().await {
        Ok(()) => {}
        Err(Error::Engine(EngineError::DeviceDisconnected)) => {
            eprintln!(
                "Selected output device was disconnected. Re-select an active render \
                 device and start the receiver again."
            );
        }
        Err(e) => return Err(e.into()),
    }

    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_with_no_args() {
        let config = parse_config(&[]).unwrap();
        assert_eq!(config.listen_port, 5555);
        assert_eq!(config.channels, 1);
        assert_eq!(config.device, DeviceSelector::SystemDefault);
    }

    #[test]
    fn test_full_argument_list() {
        let config = parse_config(&args(&[
            "6000",
            "CABLE Input",
            "40",
            "400",
            "2",
            "80",
            "2",
            "127.0.0.1",
            "192.168.1.50",
        ]))
        .unwrap();
        assert_eq!(config.listen_port, 6000);
        assert_eq!(
            config.device,
            DeviceSelector::NameSubstring("CABLE Input".into())
        );
        assert_eq!(config.output_latency_ms, 40);
        assert_eq!(config.buffer_length_ms, 400);
        assert_eq!(config.test_tone_seconds, 2);
        assert_eq!(config.jitter_target_delay_ms, 80);
        assert_eq!(config.channels, 2);
        assert_eq!(config.bind_address, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(
            config.lock_to_sender_ip,
            Some("192.168.1.50".parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn test_specific_rejections() {
        assert!(parse_config(&args(&["0"])).is_err());
        assert!(parse_config(&args(&["abc"])).is_err());
        assert!(parse_config(&args(&["5555", "", "-5"])).is_err());
        assert!(parse_config(&args(&["5555", "", "50", "500", "0", "60", "3"])).is_err());
        assert!(
            parse_config(&args(&["5555", "", "50", "500", "0", "60", "1", "not-an-ip"])).is_err()
        );
    }

    #[test]
    fn test_blank_args_fall_back_to_defaults() {
        let config = parse_config(&args(&["", "", "", "", "", ""])).unwrap();
        assert_eq!(config.listen_port, 5555);
        assert_eq!(config.output_latency_ms, 50);
        assert_eq!(config.jitter_target_delay_ms, 60);
    }
}
