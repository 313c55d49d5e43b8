//! Receiver session: UDP receive loop, jitter buffer, decode, playback
//!
//! One session owns everything on the receive side. The loop is the single
//! writer for every packet counter, so the statistics tick can read them
//! without any lock shared with the hot path; only the playback buffer's
//! counters cross a thread boundary, and those are atomics.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, watch};

use crate::audio::playback::PlaybackEngine;
use crate::codec::FrameDecoder;
use crate::config::ReceiverConfig;
use crate::constants::{
    DEVICE_MONITOR_INTERVAL, MAX_BUFFERED_PACKETS, MAX_PACKET_SIZE, STATS_INTERVAL,
    TEST_TONE_FREQUENCY_HZ, UNDERRUN_LOW_WATER_MS,
};
use crate::engine::EngineEvent;
use crate::error::{EngineError, Error, NetworkError};
use crate::network::jitter::{EnqueueOutcome, SequenceJitterBuffer};
use crate::protocol::{decode_header, HEADER_LEN};
use crate::stats::ReceiverStats;

/// Request to inject a test tone into the running session
pub(crate) struct ToneRequest {
    pub duration_secs: u32,
    pub frequency_hz: f32,
}

/// Bind the listen socket with an enlarged receive buffer.
///
/// UDP bursts during a jitter spike can outrun the default kernel buffer;
/// one megabyte absorbs them.
fn bind_receive_socket(addr: SocketAddr) -> Result<UdpSocket, Error> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_recv_buffer_size(1 << 20)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{addr}: {e}")))?;
    UdpSocket::from_std(socket.into()).map_err(|e| Error::Network(NetworkError::BindFailed(e.to_string())))
}

/// Session-local counters; the receive loop is their only writer
#[derive(Default)]
struct SessionCounters {
    packets_this_window: u64,
    packets_total: u64,
    decode_errors: u64,
    underruns: u64,
    malformed_packets: u64,
    reordered_packets: u64,
    late_packets_dropped: u64,
    missing_packets_skipped: u64,
}

impl SessionCounters {
    fn snapshot(&self, playback: &PlaybackEngine) -> ReceiverStats {
        ReceiverStats {
            packets_per_second: self.packets_this_window,
            packets_total: self.packets_total,
            decode_errors: self.decode_errors,
            buffered_ms: playback.buffered_ms(),
            overflows: playback.overflow_count(),
            underruns: self.underruns,
            malformed_packets: self.malformed_packets,
            reordered_packets: self.reordered_packets,
            late_packets_dropped: self.late_packets_dropped,
            missing_packets_skipped: self.missing_packets_skipped,
        }
    }
}

/// Run one receive session until cancellation, fault, or device loss.
pub(crate) async fn run_session(
    config: ReceiverConfig,
    events: broadcast::Sender<EngineEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut tone_rx: mpsc::Receiver<ToneRequest>,
) -> Result<(), Error> {
    let mut playback = PlaybackEngine::start(&config)?;

    emit_log(
        &events,
        format!(
            "Selected output device: {} (format path: {})",
            playback.device_name(),
            playback.format_path()
        ),
    );
    emit_log(
        &events,
        format!(
            "Startup config: bindAddress={}, port={}, outputLatencyMs={}, bufferLengthMs={}, \
             jitterTargetDelayMs={}, lockSenderIp={:?}, channels={}",
            config.bind_address,
            config.listen_port,
            config.output_latency_ms,
            config.buffer_length_ms,
            config.jitter_target_delay_ms,
            config.lock_to_sender_ip,
            config.channels,
        ),
    );

    if config.test_tone_seconds > 0 {
        playback.queue_test_tone(config.test_tone_seconds, TEST_TONE_FREQUENCY_HZ);
        emit_log(
            &events,
            format!(
                "Queued {}s test tone at {} Hz",
                config.test_tone_seconds, TEST_TONE_FREQUENCY_HZ
            ),
        );
    }

    let listen_addr = SocketAddr::new(config.bind_address, config.listen_port);
    let socket = match bind_receive_socket(listen_addr) {
        Ok(socket) => socket,
        Err(e) => {
            playback.stop();
            return Err(e);
        }
    };

    let mut decoder = match FrameDecoder::new(config.channels) {
        Ok(decoder) => decoder,
        Err(e) => {
            playback.stop();
            return Err(e.into());
        }
    };

    let target_packets = config.jitter_target_packets();
    let mut jitter = SequenceJitterBuffer::new(target_packets, MAX_BUFFERED_PACKETS);
    emit_log(
        &events,
        format!(
            "Listening for UDP Opus packets on {listen_addr} with jitter target={target_packets} packets"
        ),
    );

    // Device liveness poll; enumeration is blocking, so it lives on the
    // blocking pool and signals the loop through a channel
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);
    let monitor_stop = Arc::new(AtomicBool::new(false));
    let monitor_handle = {
        let monitor_stop = monitor_stop.clone();
        let device_name = playback.device_name().to_string();
        tokio::task::spawn_blocking(move || {
            while !monitor_stop.load(Ordering::Relaxed) {
                std::thread::sleep(DEVICE_MONITOR_INTERVAL);
                if monitor_stop.load(Ordering::Relaxed) {
                    break;
                }
                if !crate::audio::device::is_output_device_present(&device_name) {
                    let _ = disconnect_tx.blocking_send(());
                    break;
                }
            }
        })
    };

    let mut counters = SessionCounters::default();
    let mut receive_errors = 0u64;
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut stats_interval = tokio::time::interval(STATS_INTERVAL);
    stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut device_disconnected = false;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                break;
            }
            _ = disconnect_rx.recv() => {
                emit_log(&events, "Selected output device is no longer available. Stopping receiver.".into());
                device_disconnected = true;
                break;
            }
            Some(request) = tone_rx.recv() => {
                playback.queue_test_tone(request.duration_secs, request.frequency_hz);
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, peer)) => {
                        handle_datagram(
                            &buf[..len],
                            peer,
                            &config,
                            &mut counters,
                            &mut jitter,
                            &mut decoder,
                            &playback,
                        );
                    }
                    Err(e) => {
                        receive_errors += 1;
                        if receive_errors <= 3 {
                            tracing::warn!(error = %e, "UDP receive error");
                        }
                    }
                }
            }
            _ = stats_interval.tick() => {
                if playback.primed() && playback.buffered_ms() < UNDERRUN_LOW_WATER_MS {
                    counters.underruns += 1;
                    tracing::info!(
                        buffered_ms = playback.buffered_ms(),
                        underruns = counters.underruns,
                        "playback underrun risk"
                    );
                }
                if let Some(error) = playback.take_error() {
                    tracing::warn!(error = %error, "playback stream reported an error");
                }
                let stats = counters.snapshot(&playback);
                let _ = events.send(EngineEvent::Stats(stats));
                counters.packets_this_window = 0;
            }
        }
    }

    // Final statistics with the per-second window cleared
    counters.packets_this_window = 0;
    let stats = counters.snapshot(&playback);
    emit_log(&events, format!("Receiver stopped. {}", stats.summary()));
    let _ = events.send(EngineEvent::Stats(stats));

    monitor_stop.store(true, Ordering::SeqCst);
    let _ = tokio::time::timeout(Duration::from_secs(2), monitor_handle).await;

    playback.stop();

    if device_disconnected {
        return Err(Error::Engine(EngineError::DeviceDisconnected));
    }
    Ok(())
}

fn handle_datagram(
    datagram: &[u8],
    peer: SocketAddr,
    config: &ReceiverConfig,
    counters: &mut SessionCounters,
    jitter: &mut SequenceJitterBuffer,
    decoder: &mut FrameDecoder,
    playback: &PlaybackEngine,
) {
    if let Some(locked_ip) = config.lock_to_sender_ip {
        if peer.ip() != locked_ip {
            return;
        }
    }

    counters.packets_this_window += 1;
    counters.packets_total += 1;

    if datagram.len() <= HEADER_LEN {
        counters.malformed_packets += 1;
        return;
    }

    // Header validity was implied by the length check above
    let Ok((sequence, timestamp_ms)) = decode_header(datagram) else {
        counters.malformed_packets += 1;
        return;
    };
    let payload = Bytes::copy_from_slice(&datagram[HEADER_LEN..]);

    match jitter.enqueue(sequence, timestamp_ms, payload) {
        EnqueueOutcome::Reordered => counters.reordered_packets += 1,
        EnqueueOutcome::LateDropped => counters.late_packets_dropped += 1,
        EnqueueOutcome::Accepted => {}
    }

    while let Some((next_payload, skipped)) = jitter.try_dequeue() {
        counters.missing_packets_skipped += u64::from(skipped);
        match decoder.decode(&next_payload) {
            Ok(samples) => playback.push(&samples),
            Err(_) => counters.decode_errors += 1,
        }
    }
}

fn emit_log(events: &broadcast::Sender<EngineEvent>, message: String) {
    tracing::info!("{message}");
    let _ = events.send(EngineEvent::Log(message));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_receive_socket_rejects_in_use_port() {
        let first = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = first.local_addr().unwrap();
        assert!(bind_receive_socket(addr).is_err());
    }
}
