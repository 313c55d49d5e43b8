//! Receiver playback engine
//!
//! Owns the selected render endpoint and the ring-style playback buffer at
//! the internal format (48kHz, configured channels, f32). When the device's
//! native configuration differs, a linear-interpolation resampler with
//! channel up/down mapping bridges the ring to the device callback.
//! Playback begins immediately on start; silence plays until audio arrives.

use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver};

use crate::audio::buffer::PlaybackBuffer;
use crate::audio::device::{max_output_channels, select_render_device};
use crate::config::ReceiverConfig;
use crate::constants::{SAMPLE_RATE, TEST_TONE_AMPLITUDE, THREAD_JOIN_TIMEOUT};
use crate::error::AudioError;

/// How the internal format reaches the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatPath {
    /// Device natively accepts 48kHz at the configured channel count
    Direct,
    /// Linear-interpolation resample and/or channel remap in the callback
    Resampled {
        device_rate: u32,
        device_channels: u16,
    },
}

impl std::fmt::Display for FormatPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Resampled {
                device_rate,
                device_channels,
            } => write!(
                f,
                "resampled via linear interpolation -> {device_rate}Hz/{device_channels}ch"
            ),
        }
    }
}

/// Render-side engine: device, ring buffer, optional resampler
pub struct PlaybackEngine {
    buffer: Arc<PlaybackBuffer>,
    device_name: String,
    format_path: FormatPath,
    channels: u16,
    shutdown_tx: Option<std_mpsc::Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
    done_rx: Receiver<()>,
    error_rx: Receiver<AudioError>,
}

impl PlaybackEngine {
    /// Select the render device and begin playback.
    pub fn start(config: &ReceiverConfig) -> Result<Self, AudioError> {
        let (device, device_name) = select_render_device(&config.device)?;

        if config.channels == 2 {
            let device_channels = max_output_channels(&device);
            if device_channels < 2 {
                return Err(AudioError::UnsupportedFormat(format!(
                    "device \"{device_name}\" does not report stereo support \
                     (maxChannels={device_channels})"
                )));
            }
        }

        let native = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        let device_rate = native.sample_rate().0;
        let device_channels = native.channels();

        let format_path = if device_rate == SAMPLE_RATE && device_channels == config.channels {
            FormatPath::Direct
        } else {
            FormatPath::Resampled {
                device_rate,
                device_channels,
            }
        };

        let buffer = Arc::new(PlaybackBuffer::new(
            SAMPLE_RATE,
            config.channels,
            config.buffer_length_ms,
        ));

        let requested_frames = device_rate * config.output_latency_ms / 1000;
        let stream_config = cpal::StreamConfig {
            channels: device_channels,
            sample_rate: cpal::SampleRate(device_rate),
            buffer_size: match native.buffer_size() {
                cpal::SupportedBufferSize::Range { min, max } => {
                    cpal::BufferSize::Fixed(requested_frames.clamp(*min, *max))
                }
                cpal::SupportedBufferSize::Unknown => cpal::BufferSize::Default,
            },
        };

        let bridge = OutputBridge::new(
            buffer.clone(),
            config.channels,
            device_channels,
            device_rate,
        );

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (done_tx, done_rx) = bounded::<()>(1);
        let (init_tx, init_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("playback-stream".into())
            .spawn(move || {
                let mut bridge = bridge;
                let err_fn = move |e: cpal::StreamError| {
                    let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                };
                let stream = device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        bridge.fill(data);
                    },
                    err_fn,
                    None,
                );
                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            let _ = init_tx.send(Err(AudioError::StreamError(e.to_string())));
                        } else {
                            let _ = init_tx.send(Ok(()));
                            let _ = shutdown_rx.recv();
                            drop(stream);
                        }
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(AudioError::StreamError(e.to_string())));
                    }
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match init_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                return Err(AudioError::StreamError(
                    "playback stream thread died during init".into(),
                ))
            }
        }

        tracing::info!(
            device = %device_name,
            format_path = %format_path,
            internal_channels = config.channels,
            "playback started"
        );

        Ok(Self {
            buffer,
            device_name,
            format_path,
            channels: config.channels,
            shutdown_tx: Some(shutdown_tx),
            thread_handle: Some(handle),
            done_rx,
            error_rx,
        })
    }

    /// Feed one decoded and remapped frame into the sink.
    pub fn push(&self, samples: &[f32]) {
        self.buffer.push_samples(samples);
    }

    /// Inject a sine tone directly into the sink at the internal format.
    pub fn queue_test_tone(&self, duration_secs: u32, frequency_hz: f32) {
        let sample_count = (SAMPLE_RATE * duration_secs) as usize;
        let channels = self.channels as usize;
        let mut samples = Vec::with_capacity(sample_count * channels);
        for i in 0..sample_count {
            let t = i as f32 / SAMPLE_RATE as f32;
            let value = (t * frequency_hz * 2.0 * std::f32::consts::PI).sin()
                * TEST_TONE_AMPLITUDE;
            for _ in 0..channels {
                samples.push(value);
            }
        }
        self.buffer.push_samples(&samples);
        tracing::info!(duration_secs, frequency_hz = %frequency_hz, "queued test tone");
    }

    pub fn buffered_ms(&self) -> f64 {
        self.buffer.buffered_ms()
    }

    pub fn overflow_count(&self) -> u64 {
        self.buffer.overflow_count()
    }

    pub fn primed(&self) -> bool {
        self.buffer.primed()
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn format_path(&self) -> FormatPath {
        self.format_path
    }

    /// Drain any pending stream error
    pub fn take_error(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }

    /// Stop playback and release the device; bounded and idempotent.
    pub fn stop(&mut self) {
        self.shutdown_tx = None;
        if let Some(handle) = self.thread_handle.take() {
            if self.done_rx.recv_timeout(THREAD_JOIN_TIMEOUT).is_ok() {
                let _ = handle.join();
            } else {
                tracing::warn!("playback thread did not stop in time; detaching");
            }
            tracing::info!(device = %self.device_name, "playback stopped");
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Maps the internal 48kHz ring onto the device's native format inside the
/// output callback
struct OutputBridge {
    ring: Arc<PlaybackBuffer>,
    internal_channels: usize,
    device_channels: usize,
    /// Internal frames consumed per device frame
    ratio: f64,
    /// Fractional read position between the two staged internal frames
    position: f64,
    previous_frame: Vec<f32>,
    current_frame: Vec<f32>,
    scratch: Vec<f32>,
}

impl OutputBridge {
    fn new(
        ring: Arc<PlaybackBuffer>,
        internal_channels: u16,
        device_channels: u16,
        device_rate: u32,
    ) -> Self {
        let internal_channels = internal_channels as usize;
        Self {
            ring,
            internal_channels,
            device_channels: device_channels as usize,
            ratio: f64::from(SAMPLE_RATE) / f64::from(device_rate),
            position: 1.0,
            previous_frame: vec![0.0; internal_channels],
            current_frame: vec![0.0; internal_channels],
            scratch: Vec::new(),
        }
    }

    fn fill(&mut self, out: &mut [f32]) {
        let identity = self.internal_channels == self.device_channels
            && (self.ratio - 1.0).abs() < f64::EPSILON;
        if identity {
            self.ring.read_into(out);
            return;
        }

        let out_frames = out.len() / self.device_channels;
        for frame_index in 0..out_frames {
            self.position += self.ratio;
            while self.position >= 1.0 {
                self.advance_internal_frame();
                self.position -= 1.0;
            }
            let t = self.position as f32;

            let out_frame = &mut out[frame_index * self.device_channels..]
                [..self.device_channels];
            for (channel, slot) in out_frame.iter_mut().enumerate() {
                *slot = map_channel(
                    &self.previous_frame,
                    &self.current_frame,
                    t,
                    channel,
                    self.internal_channels,
                    self.device_channels,
                );
            }
        }
    }

    /// Shift one interleaved internal frame out of the ring.
    fn advance_internal_frame(&mut self) {
        std::mem::swap(&mut self.previous_frame, &mut self.current_frame);
        self.scratch.resize(self.internal_channels, 0.0);
        self.ring.read_into(&mut self.scratch);
        self.current_frame.copy_from_slice(&self.scratch);
    }
}

/// Interpolate one output channel from the staged internal frames,
/// duplicating mono upward and averaging stereo downward.
fn map_channel(
    previous: &[f32],
    current: &[f32],
    t: f32,
    out_channel: usize,
    internal_channels: usize,
    device_channels: usize,
) -> f32 {
    let sample_at = |frame: &[f32]| -> f32 {
        match (internal_channels, device_channels) {
            (i, d) if i == d => frame[out_channel],
            (1, _) => frame[0],
            (2, 1) => (frame[0] + frame[1]) / 2.0,
            // Extra surround channels beyond stereo stay silent
            (2, _) => {
                if out_channel < 2 {
                    frame[out_channel]
                } else {
                    0.0
                }
            }
            _ => frame[out_channel % internal_channels],
        }
    };
    let a = sample_at(previous);
    let b = sample_at(current);
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(internal_ch: u16, device_ch: u16, device_rate: u32) -> OutputBridge {
        let ring = Arc::new(PlaybackBuffer::new(SAMPLE_RATE, internal_ch, 500));
        OutputBridge::new(ring, internal_ch, device_ch, device_rate)
    }

    #[test]
    fn test_identity_path_passes_samples_through() {
        let mut bridge = bridge(1, 1, SAMPLE_RATE);
        bridge.ring.push_samples(&[0.1, 0.2, 0.3, 0.4]);

        let mut out = [0.0f32; 4];
        bridge.fill(&mut out);
        assert_eq!(out, [0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_mono_to_stereo_duplicates_channels() {
        let mut bridge = bridge(1, 2, SAMPLE_RATE);
        bridge.ring.push_samples(&[0.5, -0.5]);

        let mut out = [0.0f32; 4];
        bridge.fill(&mut out);
        // Same-rate path still interpolates frame-by-frame; left == right
        assert_eq!(out[0], out[1]);
        assert_eq!(out[2], out[3]);
    }

    #[test]
    fn test_downsampling_consumes_more_internal_frames() {
        // 48kHz internal onto a 24kHz device: two internal frames per
        // device frame
        let mut bridge = bridge(1, 1, 24_000);
        bridge.ring.push_samples(&vec![0.25; 96]);

        let mut out = [0.0f32; 32];
        bridge.fill(&mut out);
        let consumed = 96 - bridge.ring.buffered_samples();
        assert!((63..=65).contains(&consumed), "consumed {consumed}");
        assert!(out.iter().skip(2).all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_empty_ring_produces_silence() {
        let mut bridge = bridge(2, 2, SAMPLE_RATE);
        let mut out = [1.0f32; 8];
        bridge.fill(&mut out);
        assert_eq!(out, [0.0; 8]);
    }

    #[test]
    fn test_format_path_display() {
        assert_eq!(FormatPath::Direct.to_string(), "direct");
        let resampled = FormatPath::Resampled {
            device_rate: 44_100,
            device_channels: 2,
        };
        assert!(resampled.to_string().contains("44100"));
    }
}
