//! Sender capture pipeline
//!
//! Owns the capture source, the gain stage, the Opus encoder, and a UDP
//! transmitter. A dedicated capture thread reads fixed-duration frames and
//! ships them; an independent status thread publishes a one-second status
//! snapshot. The cpal stream lives on its own thread (it is `!Send`), so
//! the source handed to the capture loop is a thin blocking reader.
//!
//! The codec cannot be reconfigured in place; configuration changes are a
//! stop-then-start cycle under one pipeline-switch lock so no frame is
//! ever encoded against a half-updated configuration.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::audio::buffer::{SampleQueue, SharedSampleQueue};
use crate::audio::device::select_capture_device;
use crate::audio::gain::{GainHandle, GainStage};
use crate::codec::FrameEncoder;
use crate::config::StreamingConfig;
use crate::constants::{
    CAPTURE_QUEUE_CAPACITY, CLIP_WARNING_SAMPLES_PER_SEC, SAMPLE_RATE, STATS_INTERVAL,
    THREAD_JOIN_TIMEOUT,
};
use crate::error::{AudioError, Error};
use crate::network::sender::{resolve_destination, UdpTransmitter};
use crate::stats::SenderStatus;

/// Capture pipeline lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Starting,
    Capturing,
    Stopping,
}

/// Best-effort platform voice-processing effect outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectStatus {
    Enabled,
    Disabled,
    Unavailable,
}

impl EffectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Compose the DSP summary string shown in sender status.
pub fn effects_summary(aec: EffectStatus, ns: EffectStatus, agc: EffectStatus) -> String {
    format!(
        "aec={}, ns={}, agc={}",
        aec.as_str(),
        ns.as_str(),
        agc.as_str()
    )
}

/// Parameters a source needs to open its device
#[derive(Debug, Clone)]
pub struct CaptureSpec {
    pub channels: u16,
    /// Total interleaved samples per frame
    pub samples_per_frame: usize,
    /// Requested device buffer; the driver minimum wins when larger
    pub buffer_size_samples: usize,
    pub preferred_device: Option<String>,
}

/// Blocking PCM source owned by the capture loop
///
/// Implementations own the platform device, any attached voice-processing
/// effects, and any OS audio-mode change; dropping the source releases all
/// of it exactly once.
pub trait CaptureSource: Send {
    /// Read up to one frame of interleaved 16-bit PCM.
    ///
    /// Returns the number of samples delivered, which may be short when
    /// the device under-delivers; the caller drops partial frames.
    fn read(&mut self, frame: &mut [i16]) -> Result<usize, AudioError>;

    /// Fire-and-forget input routing hint; `false` means the platform
    /// rejected it and streaming continues on the previous route.
    fn apply_route_preference(&mut self, device_label: &str) -> bool {
        let _ = device_label;
        false
    }

    /// Friendly label of the active input
    fn active_label(&self) -> String;

    /// Voice-processing effect summary for status reporting
    fn dsp_summary(&self) -> String {
        effects_summary(
            EffectStatus::Unavailable,
            EffectStatus::Unavailable,
            EffectStatus::Unavailable,
        )
    }
}

/// Opens a capture source per session; the pipeline re-invokes it on every
/// restart
pub trait SourceFactory: Send + Sync {
    fn open(&self, spec: &CaptureSpec) -> Result<Box<dyn CaptureSource>, AudioError>;
}

impl<F> SourceFactory for F
where
    F: Fn(&CaptureSpec) -> Result<Box<dyn CaptureSource>, AudioError> + Send + Sync,
{
    fn open(&self, spec: &CaptureSpec) -> Result<Box<dyn CaptureSource>, AudioError> {
        self(spec)
    }
}

enum ControlMessage {
    Route(String),
}

#[derive(Default)]
struct StatusFields {
    dsp_summary: String,
    active_input: String,
    routing_warning: Option<String>,
    last_error: Option<String>,
    packets_per_second: u64,
    clipping_warning: bool,
}

struct SharedStatus {
    streaming: AtomicBool,
    packets_window: AtomicU64,
    short_reads: AtomicU64,
    fields: Mutex<StatusFields>,
}

impl SharedStatus {
    fn new() -> Self {
        Self {
            streaming: AtomicBool::new(false),
            packets_window: AtomicU64::new(0),
            short_reads: AtomicU64::new(0),
            fields: Mutex::new(StatusFields::default()),
        }
    }

    fn snapshot(&self) -> SenderStatus {
        let fields = self.fields.lock();
        SenderStatus {
            streaming: self.streaming.load(Ordering::Relaxed),
            packets_per_second: fields.packets_per_second,
            dsp_summary: fields.dsp_summary.clone(),
            active_input: fields.active_input.clone(),
            routing_warning: fields.routing_warning.clone(),
            clipping_warning: fields.clipping_warning,
            last_error: fields.last_error.clone(),
        }
    }

    fn set_last_error(&self, message: String) {
        self.fields.lock().last_error = Some(message);
    }
}

struct Session {
    active: Arc<AtomicBool>,
    control_tx: Sender<ControlMessage>,
    capture_done_rx: Receiver<()>,
    status_done_rx: Receiver<()>,
    capture_handle: JoinHandle<()>,
    status_handle: JoinHandle<()>,
    destination: SocketAddr,
    config: StreamingConfig,
}

/// Sender-side capture/encode/transmit pipeline
pub struct CapturePipeline {
    factory: Arc<dyn SourceFactory>,
    /// Serializes start/stop/reconfigure so restarts are atomic
    switch_lock: Mutex<()>,
    session: Mutex<Option<Session>>,
    shared: Arc<SharedStatus>,
    gain: Arc<GainStage>,
    preferred_input: Mutex<Option<String>>,
    state_tx: Arc<watch::Sender<PipelineState>>,
    state_rx: watch::Receiver<PipelineState>,
    status_tx: Arc<watch::Sender<SenderStatus>>,
    status_rx: watch::Receiver<SenderStatus>,
}

impl CapturePipeline {
    pub fn new(factory: Arc<dyn SourceFactory>) -> Self {
        let (state_tx, state_rx) = watch::channel(PipelineState::Idle);
        let (status_tx, status_rx) = watch::channel(SenderStatus::default());
        Self {
            factory,
            switch_lock: Mutex::new(()),
            session: Mutex::new(None),
            shared: Arc::new(SharedStatus::new()),
            gain: Arc::new(GainStage::new(1.0)),
            preferred_input: Mutex::new(None),
            state_tx: Arc::new(state_tx),
            state_rx,
            status_tx: Arc::new(status_tx),
            status_rx,
        }
    }

    /// Observe lifecycle transitions
    pub fn state_watch(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    /// Observe the one-second status snapshots
    pub fn status_watch(&self) -> watch::Receiver<SenderStatus> {
        self.status_rx.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Relaxed)
    }

    pub fn gain_handle(&self) -> GainHandle {
        self.gain.handle()
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.handle().set_gain(gain);
    }

    /// Start streaming to `host:port`. A start while already capturing is
    /// a no-op.
    pub fn start(&self, host: &str, port: u16, config: StreamingConfig) -> Result<(), Error> {
        let _switch = self.switch_lock.lock();
        self.start_locked(host, port, config)
    }

    /// Stop streaming and release every resource. Safe to call when never
    /// started and safe to call repeatedly.
    pub fn stop(&self) {
        let _switch = self.switch_lock.lock();
        self.stop_locked();
    }

    /// Apply a new configuration as one atomic stop-then-start cycle.
    pub fn reconfigure(&self, host: &str, port: u16, config: StreamingConfig) -> Result<(), Error> {
        let _switch = self.switch_lock.lock();
        self.stop_locked();
        self.start_locked(host, port, config)
    }

    /// Re-apply an input routing preference to the running source without
    /// restarting. The preference also applies to future sessions.
    pub fn set_input_route(&self, device_label: &str) {
        *self.preferred_input.lock() = Some(device_label.to_string());
        if let Some(session) = self.session.lock().as_ref() {
            let _ = session
                .control_tx
                .try_send(ControlMessage::Route(device_label.to_string()));
        }
    }

    fn start_locked(&self, host: &str, port: u16, config: StreamingConfig) -> Result<(), Error> {
        {
            let mut session = self.session.lock();
            if session.is_some() {
                if self.is_streaming() {
                    tracing::debug!("capture pipeline already running");
                    return Ok(());
                }
                // The previous session ended on its own error; clean it up
                // before starting fresh
                drop(session.take());
            }
        }

        self.state_tx.send_replace(PipelineState::Starting);

        let destination = match resolve_destination(host, port) {
            Ok(addr) => addr,
            Err(e) => return self.fail_start(e.into()),
        };

        let spec = CaptureSpec {
            channels: config.channels,
            samples_per_frame: config.samples_per_frame(),
            buffer_size_samples: config.samples_per_frame() * 4,
            preferred_device: self.preferred_input.lock().clone(),
        };

        let source = match self.factory.open(&spec) {
            Ok(source) => source,
            Err(e) => return self.fail_start(e.into()),
        };

        let transmitter = match UdpTransmitter::connect(destination) {
            Ok(tx) => tx,
            Err(e) => {
                drop(source);
                return self.fail_start(e.into());
            }
        };

        let encoder = match FrameEncoder::new(config.clone()) {
            Ok(encoder) => encoder,
            Err(e) => {
                drop(transmitter);
                drop(source);
                return self.fail_start(e.into());
            }
        };

        {
            let mut fields = self.shared.fields.lock();
            fields.dsp_summary = source.dsp_summary();
            fields.active_input = source.active_label();
            fields.routing_warning = None;
            fields.last_error = None;
            fields.packets_per_second = 0;
            fields.clipping_warning = false;
        }
        self.shared.packets_window.store(0, Ordering::Relaxed);
        self.shared.short_reads.store(0, Ordering::Relaxed);
        self.shared.streaming.store(true, Ordering::SeqCst);

        let active = Arc::new(AtomicBool::new(true));
        let (control_tx, control_rx) = bounded::<ControlMessage>(8);
        let (capture_done_tx, capture_done_rx) = bounded::<()>(1);
        let (status_done_tx, status_done_rx) = bounded::<()>(1);

        let capture_spawn = {
            let active = active.clone();
            let shared = self.shared.clone();
            let gain = self.gain.clone();
            let status_tx = self.status_tx.clone();
            thread::Builder::new().name("mic-capture".into()).spawn(move || {
                capture_loop(
                    source,
                    encoder,
                    transmitter,
                    gain,
                    active,
                    shared,
                    control_rx,
                    status_tx,
                );
                let _ = capture_done_tx.send(());
            })
        };
        let capture_handle = match capture_spawn {
            Ok(handle) => handle,
            Err(e) => {
                active.store(false, Ordering::SeqCst);
                return self.fail_start(Error::Audio(AudioError::StreamError(e.to_string())));
            }
        };

        let status_spawn = {
            let active = active.clone();
            let shared = self.shared.clone();
            let gain = self.gain.handle();
            let status_tx = self.status_tx.clone();
            thread::Builder::new().name("mic-status".into()).spawn(move || {
                status_loop(shared, gain, active, status_tx);
                let _ = status_done_tx.send(());
            })
        };
        let status_handle = match status_spawn {
            Ok(handle) => handle,
            Err(e) => {
                active.store(false, Ordering::SeqCst);
                let _ = capture_done_rx.recv_timeout(THREAD_JOIN_TIMEOUT);
                let _ = capture_handle.join();
                return self.fail_start(Error::Audio(AudioError::StreamError(e.to_string())));
            }
        };

        tracing::info!(
            destination = %destination,
            config = %config.summary(),
            "capture pipeline started"
        );

        *self.session.lock() = Some(Session {
            active,
            control_tx,
            capture_done_rx,
            status_done_rx,
            capture_handle,
            status_handle,
            destination,
            config,
        });

        self.state_tx.send_replace(PipelineState::Capturing);
        let _ = self.status_tx.send(self.shared.snapshot());
        Ok(())
    }

    fn fail_start(&self, error: Error) -> Result<(), Error> {
        tracing::error!(error = %error, "capture pipeline start failed");
        self.shared.set_last_error(error.to_string());
        self.shared.streaming.store(false, Ordering::SeqCst);
        self.state_tx.send_replace(PipelineState::Idle);
        let _ = self.status_tx.send(self.shared.snapshot());
        Err(error)
    }

    fn stop_locked(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };

        self.state_tx.send_replace(PipelineState::Stopping);
        session.active.store(false, Ordering::SeqCst);

        join_bounded(
            session.capture_done_rx,
            session.capture_handle,
            "mic-capture",
        );
        join_bounded(session.status_done_rx, session.status_handle, "mic-status");

        self.shared.streaming.store(false, Ordering::SeqCst);
        self.shared.fields.lock().packets_per_second = 0;
        self.state_tx.send_replace(PipelineState::Idle);
        let _ = self.status_tx.send(self.shared.snapshot());
        tracing::info!(
            destination = %session.destination,
            config = %session.config.summary(),
            "capture pipeline stopped"
        );
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait for the thread's completion signal, then join; detach if the
/// bounded wait elapses so shutdown can never hang.
fn join_bounded(done_rx: Receiver<()>, handle: JoinHandle<()>, name: &str) {
    if done_rx.recv_timeout(THREAD_JOIN_TIMEOUT).is_ok() {
        let _ = handle.join();
    } else {
        tracing::warn!(thread = name, "thread did not stop in time; detaching");
    }
}

#[allow(clippy::too_many_arguments)]
fn capture_loop(
    mut source: Box<dyn CaptureSource>,
    mut encoder: FrameEncoder,
    mut transmitter: UdpTransmitter,
    gain: Arc<GainStage>,
    active: Arc<AtomicBool>,
    shared: Arc<SharedStatus>,
    control_rx: Receiver<ControlMessage>,
    status_tx: Arc<watch::Sender<SenderStatus>>,
) {
    let frame_len = encoder.samples_per_frame();
    let mut frame = vec![0i16; frame_len];
    let mut sequence: u32 = 0;
    let started = Instant::now();

    while active.load(Ordering::Relaxed) {
        while let Ok(message) = control_rx.try_recv() {
            match message {
                ControlMessage::Route(label) => {
                    if source.apply_route_preference(&label) {
                        let mut fields = shared.fields.lock();
                        fields.routing_warning = None;
                        fields.active_input = source.active_label();
                    } else {
                        tracing::warn!(label = %label, "input routing preference was not applied");
                        shared.fields.lock().routing_warning = Some(format!(
                            "input routing request \"{label}\" was not applied"
                        ));
                    }
                    // Routing outcomes surface immediately, not on the next
                    // status tick
                    let _ = status_tx.send(shared.snapshot());
                }
            }
        }

        let read = match source.read(&mut frame) {
            Ok(read) => read,
            Err(e) => {
                tracing::error!(error = %e, "capture read failed; stopping capture loop");
                shared.set_last_error(e.to_string());
                break;
            }
        };
        if read == 0 {
            continue;
        }
        if read < frame_len {
            // A truncated frame is undefined input for the fixed-duration
            // codec; drop it
            shared.short_reads.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        gain.apply(&mut frame);

        match encoder.encode(&frame) {
            Ok(None) => continue,
            Ok(Some(payload)) => {
                let timestamp_ms = started.elapsed().as_millis() as u32;
                if let Err(e) = transmitter.send_frame(sequence, timestamp_ms, &payload) {
                    tracing::error!(error = %e, "UDP send failed; stopping capture loop");
                    shared.set_last_error(e.to_string());
                    break;
                }
                sequence = sequence.wrapping_add(1);
                shared.packets_window.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(error = %e, "encoding failed; stopping capture loop");
                shared.set_last_error(e.to_string());
                break;
            }
        }
    }

    // Teardown order: encoder, socket, then the source, which releases its
    // effects and device and restores the OS audio mode
    active.store(false, Ordering::SeqCst);
    shared.streaming.store(false, Ordering::SeqCst);
    drop(encoder);
    drop(transmitter);
    drop(source);
    let _ = status_tx.send(shared.snapshot());
    tracing::info!(packets = sequence, "capture loop stopped");
}

fn status_loop(
    shared: Arc<SharedStatus>,
    gain: GainHandle,
    active: Arc<AtomicBool>,
    status_tx: Arc<watch::Sender<SenderStatus>>,
) {
    let mut last_clipped = gain.clipped_total();

    while sleep_while_active(&active, STATS_INTERVAL) {
        let packets = shared.packets_window.swap(0, Ordering::Relaxed);
        let clipped_now = gain.clipped_total();
        let clipping = clipped_now - last_clipped > CLIP_WARNING_SAMPLES_PER_SEC;
        last_clipped = clipped_now;

        {
            let mut fields = shared.fields.lock();
            fields.packets_per_second = packets;
            fields.clipping_warning = clipping;
        }
        let _ = status_tx.send(shared.snapshot());
    }

    // Final snapshot so subscribers observe streaming=false promptly
    shared.fields.lock().packets_per_second = 0;
    let _ = status_tx.send(shared.snapshot());
}

/// Sleep in short slices so cancellation is observed well under a second.
fn sleep_while_active(active: &AtomicBool, total: Duration) -> bool {
    let slice = Duration::from_millis(100);
    let mut remaining = total;
    while !remaining.is_zero() {
        if !active.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining -= step;
    }
    active.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// cpal-backed capture source
// ---------------------------------------------------------------------------

/// Opens cpal input devices for production use
pub struct CpalSourceFactory;

impl SourceFactory for CpalSourceFactory {
    fn open(&self, spec: &CaptureSpec) -> Result<Box<dyn CaptureSource>, AudioError> {
        Ok(Box::new(CpalCaptureSource::open(spec)?))
    }
}

/// Capture source reading from a cpal input stream
///
/// The stream lives on a dedicated thread; its callback pushes interleaved
/// 16-bit chunks into a lock-free queue that `read` drains. Desktop hosts
/// expose no per-stream echo-cancellation/noise-suppression effects through
/// cpal, so the DSP summary reports all three as unavailable.
pub struct CpalCaptureSource {
    queue: SharedSampleQueue,
    pending: VecDeque<i16>,
    device_name: String,
    shutdown_tx: Option<std_mpsc::Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<AudioError>,
    read_timeout: Duration,
}

impl CpalCaptureSource {
    pub fn open(spec: &CaptureSpec) -> Result<Self, AudioError> {
        let (device, device_name) = select_capture_device(spec.preferred_device.as_deref())?;

        let default_config = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        // Pick max(driver minimum, requested) frames per buffer when the
        // driver reports a range; otherwise leave the choice to the driver
        let requested_frames = (spec.buffer_size_samples / spec.channels as usize) as u32;
        let buffer_size = match default_config.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max } => {
                cpal::BufferSize::Fixed(requested_frames.clamp(*min, *max))
            }
            cpal::SupportedBufferSize::Unknown => cpal::BufferSize::Default,
        };

        let stream_config = cpal::StreamConfig {
            channels: spec.channels,
            sample_rate: cpal::SampleRate(SAMPLE_RATE),
            buffer_size,
        };
        let sample_format = default_config.sample_format();

        let queue: SharedSampleQueue = Arc::new(SampleQueue::new(CAPTURE_QUEUE_CAPACITY));
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (init_tx, init_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread_queue = queue.clone();
        let handle = thread::Builder::new()
            .name("mic-capture-stream".into())
            .spawn(move || {
                let stream = build_input_stream(
                    &device,
                    &stream_config,
                    sample_format,
                    thread_queue,
                    error_tx,
                );
                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            let _ = init_tx.send(Err(AudioError::StreamError(e.to_string())));
                            return;
                        }
                        let _ = init_tx.send(Ok(()));
                        // Park until shutdown; the stream stays alive in
                        // this scope
                        let _ = shutdown_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                    }
                }
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
                    "capture stream thread died during init".into(),
                ))
            }
        }

        tracing::info!(device = %device_name, "capture stream opened");

        Ok(Self {
            queue,
            pending: VecDeque::new(),
            device_name,
            shutdown_tx: Some(shutdown_tx),
            thread_handle: Some(handle),
            error_rx,
            read_timeout: Duration::from_millis(250),
        })
    }
}

impl CaptureSource for CpalCaptureSource {
    fn read(&mut self, frame: &mut [i16]) -> Result<usize, AudioError> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            if let Ok(error) = self.error_rx.try_recv() {
                return Err(error);
            }

            while let Some(chunk) = self.queue.pop() {
                self.pending.extend(chunk);
            }

            if self.pending.len() >= frame.len() {
                for slot in frame.iter_mut() {
                    *slot = self.pending.pop_front().unwrap_or(0);
                }
                return Ok(frame.len());
            }

            if Instant::now() >= deadline {
                // Deliver whatever arrived; the caller drops short frames
                let available = self.pending.len().min(frame.len());
                for slot in frame.iter_mut().take(available) {
                    *slot = self.pending.pop_front().unwrap_or(0);
                }
                return Ok(available);
            }

            thread::sleep(Duration::from_millis(1));
        }
    }

    fn active_label(&self) -> String {
        self.device_name.clone()
    }
}

impl Drop for CpalCaptureSource {
    fn drop(&mut self) {
        self.shutdown_tx = None;
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        tracing::debug!(device = %self.device_name, "capture stream released");
    }
}

fn build_input_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: SharedSampleQueue,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError> {
    let err_fn = move |e: cpal::StreamError| {
        let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
    };

    let stream = match sample_format {
        cpal::SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                queue.push(data.to_vec());
            },
            err_fn,
            None,
        ),
        _ => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let chunk: Vec<i16> = data
                    .iter()
                    .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
                    .collect();
                queue.push(chunk);
            },
            err_fn,
            None,
        ),
    };

    stream.map_err(|e| AudioError::StreamError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    use crate::protocol::decode_header;

    /// Source producing a 440Hz tone at frame cadence
    struct ToneSource {
        phase: f32,
        label: String,
        accept_route: bool,
    }

    impl ToneSource {
        fn factory(accept_route: bool) -> Arc<dyn SourceFactory> {
            Arc::new(move |_spec: &CaptureSpec| {
                Ok(Box::new(ToneSource {
                    phase: 0.0,
                    label: "Test Microphone".into(),
                    accept_route,
                }) as Box<dyn CaptureSource>)
            })
        }
    }

    impl CaptureSource for ToneSource {
        fn read(&mut self, frame: &mut [i16]) -> Result<usize, AudioError> {
            for sample in frame.iter_mut() {
                *sample = (self.phase.sin() * 8000.0) as i16;
                self.phase += 440.0 * 2.0 * std::f32::consts::PI / 48_000.0;
            }
            thread::sleep(Duration::from_millis(5));
            Ok(frame.len())
        }

        fn apply_route_preference(&mut self, device_label: &str) -> bool {
            if self.accept_route {
                self.label = device_label.to_string();
            }
            self.accept_route
        }

        fn active_label(&self) -> String {
            self.label.clone()
        }
    }

    fn local_receiver() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    #[test]
    fn test_start_streams_packets_then_stop() {
        let (socket, port) = local_receiver();
        let pipeline = CapturePipeline::new(ToneSource::factory(false));

        pipeline
            .start("127.0.0.1", port, StreamingConfig::voice_clean())
            .unwrap();
        assert!(pipeline.is_streaming());
        assert_eq!(*pipeline.state_watch().borrow(), PipelineState::Capturing);

        let mut buf = [0u8; 2048];
        let first = socket.recv(&mut buf).unwrap();
        assert!(first > 8);
        let (seq0, _) = decode_header(&buf[..first]).unwrap();
        let second = socket.recv(&mut buf).unwrap();
        let (seq1, _) = decode_header(&buf[..second]).unwrap();
        assert_eq!(seq1, seq0.wrapping_add(1));

        pipeline.stop();
        assert!(!pipeline.is_streaming());
        assert_eq!(*pipeline.state_watch().borrow(), PipelineState::Idle);
    }

    #[test]
    fn test_start_is_idempotent() {
        let (_socket, port) = local_receiver();
        let pipeline = CapturePipeline::new(ToneSource::factory(false));

        pipeline
            .start("127.0.0.1", port, StreamingConfig::voice_clean())
            .unwrap();
        pipeline
            .start("127.0.0.1", port, StreamingConfig::voice_clean())
            .unwrap();
        pipeline.stop();
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let pipeline = CapturePipeline::new(ToneSource::factory(false));
        pipeline.stop();
        pipeline.stop();
    }

    #[test]
    fn test_invalid_destination_rejected_before_resources() {
        let pipeline = CapturePipeline::new(ToneSource::factory(false));
        let result = pipeline.start("", 5555, StreamingConfig::voice_clean());
        assert!(result.is_err());
        assert!(!pipeline.is_streaming());
        let status = pipeline.status_watch().borrow().clone();
        assert!(status.last_error.is_some());
    }

    #[test]
    fn test_short_reads_send_nothing() {
        struct ShortSource;
        impl CaptureSource for ShortSource {
            fn read(&mut self, frame: &mut [i16]) -> Result<usize, AudioError> {
                thread::sleep(Duration::from_millis(5));
                Ok(frame.len() / 2)
            }
            fn active_label(&self) -> String {
                "Short".into()
            }
        }

        let (socket, port) = local_receiver();
        socket
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();

        let factory: Arc<dyn SourceFactory> = Arc::new(|_spec: &CaptureSpec| {
            Ok(Box::new(ShortSource) as Box<dyn CaptureSource>)
        });
        let pipeline = CapturePipeline::new(factory);
        pipeline
            .start("127.0.0.1", port, StreamingConfig::voice_clean())
            .unwrap();

        let mut buf = [0u8; 2048];
        assert!(socket.recv(&mut buf).is_err());
        pipeline.stop();
    }

    #[test]
    fn test_rejected_route_raises_warning() {
        let (_socket, port) = local_receiver();
        let pipeline = CapturePipeline::new(ToneSource::factory(false));
        pipeline
            .start("127.0.0.1", port, StreamingConfig::voice_clean())
            .unwrap();

        pipeline.set_input_route("Headset Mic");
        thread::sleep(Duration::from_millis(200));

        let status = pipeline.status_watch().borrow().clone();
        assert!(status.routing_warning.is_some());
        pipeline.stop();
    }

    #[test]
    fn test_accepted_route_updates_label() {
        let (_socket, port) = local_receiver();
        let pipeline = CapturePipeline::new(ToneSource::factory(true));
        pipeline
            .start("127.0.0.1", port, StreamingConfig::voice_clean())
            .unwrap();

        pipeline.set_input_route("Headset Mic");
        thread::sleep(Duration::from_millis(200));

        let status = pipeline.status_watch().borrow().clone();
        assert!(status.routing_warning.is_none());
        assert_eq!(status.active_input, "Headset Mic");
        pipeline.stop();
    }

    #[test]
    fn test_reconfigure_restarts_with_new_config() {
        let (socket, port) = local_receiver();
        let pipeline = CapturePipeline::new(ToneSource::factory(false));
        pipeline
            .start("127.0.0.1", port, StreamingConfig::voice_clean())
            .unwrap();

        pipeline
            .reconfigure("127.0.0.1", port, StreamingConfig::low_latency())
            .unwrap();
        assert!(pipeline.is_streaming());

        // Fresh session restarts the sequence counter
        let mut buf = [0u8; 2048];
        let len = socket.recv(&mut buf).unwrap();
        assert!(len > 8);
        pipeline.stop();
    }
}
