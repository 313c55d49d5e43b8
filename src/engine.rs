//! Receiver engine state machine
//!
//! Exactly one non-stopped session may exist at a time. Start/stop requests
//! are serialized through a single async mutex; the wait for the run task's
//! completion happens outside that gate so a concurrent start cannot
//! deadlock against a stop in progress.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::ReceiverConfig;
use crate::constants::{SESSION_STOP_TIMEOUT, TEST_TONE_FREQUENCY_HZ};
use crate::error::{EngineError, Error};
use crate::network::receiver::{run_session, ToneRequest};
use crate::stats::ReceiverStats;

/// Receiver lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Terminal until the next stop/start cycle; reached on unrecoverable
    /// session error
    Faulted,
}

/// Event stream surfaced to the embedding application
#[derive(Debug, Clone)]
pub enum EngineEvent {
    State(ReceiverState),
    Stats(ReceiverStats),
    Log(String),
}

struct SessionSlot {
    run_task: Option<JoinHandle<Result<(), Error>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    tone_tx: Option<mpsc::Sender<ToneRequest>>,
}

/// Orchestrates receiver sessions and publishes their events
pub struct ReceiverEngine {
    gate: Mutex<SessionSlot>,
    state_tx: Arc<watch::Sender<ReceiverState>>,
    state_rx: watch::Receiver<ReceiverState>,
    events: broadcast::Sender<EngineEvent>,
}

impl ReceiverEngine {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ReceiverState::Stopped);
        let (events, _) = broadcast::channel(256);
        Self {
            gate: Mutex::new(SessionSlot {
                run_task: None,
                shutdown_tx: None,
                tone_tx: None,
            }),
            state_tx: Arc::new(state_tx),
            state_rx,
            events,
        }
    }

    /// Subscribe to state, statistics, and log events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Observe state transitions only.
    pub fn state_watch(&self) -> watch::Receiver<ReceiverState> {
        self.state_rx.clone()
    }

    pub fn state(&self) -> ReceiverState {
        *self.state_rx.borrow()
    }

    /// Start a session. Fails with `AlreadyRunning` while a session task is
    /// tracked, leaving the existing session untouched.
    pub async fn start(&self, config: ReceiverConfig) -> Result<(), Error> {
        let mut slot = self.gate.lock().await;
        if slot.run_task.is_some() {
            return Err(EngineError::AlreadyRunning.into());
        }

        config.validate()?;

        transition(&self.state_tx, &self.events, ReceiverState::Starting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tone_tx, tone_rx) = mpsc::channel(4);

        let events = self.events.clone();
        let state_tx = self.state_tx.clone();
        let run_task = tokio::spawn(async move {
            match run_session(config, events.clone(), shutdown_rx, tone_rx).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    transition(&state_tx, &events, ReceiverState::Faulted);
                    let message = format!("Receiver faulted: {e}");
                    tracing::error!("{message}");
                    let _ = events.send(EngineEvent::Log(message));
                    Err(e)
                }
            }
        });

        slot.run_task = Some(run_task);
        slot.shutdown_tx = Some(shutdown_tx);
        slot.tone_tx = Some(tone_tx);

        // The run task may still fault asynchronously; that is reported
        // through the event stream
        transition(&self.state_tx, &self.events, ReceiverState::Running);
        Ok(())
    }

    /// Stop the tracked session, if any. Safe to call when nothing is
    /// running and safe to call concurrently; late callers observe the
    /// first stop's completion.
    pub async fn stop(&self) -> Result<(), Error> {
        let run_task = {
            let mut slot = self.gate.lock().await;
            let Some(run_task) = slot.run_task.take() else {
                return Ok(());
            };
            transition(&self.state_tx, &self.events, ReceiverState::Stopping);
            if let Some(shutdown_tx) = slot.shutdown_tx.take() {
                let _ = shutdown_tx.send(true);
            }
            slot.tone_tx = None;
            run_task
        };

        // Await completion outside the gate so a concurrent start/stop is
        // never deadlocked; the wait is bounded regardless
        let result = match tokio::time::timeout(SESSION_STOP_TIMEOUT, run_task).await {
            Ok(Ok(session_result)) => session_result,
            Ok(Err(join_error)) => {
                tracing::error!(error = %join_error, "receiver run task panicked");
                Ok(())
            }
            Err(_) => {
                tracing::warn!("receiver run task did not stop in time; detaching");
                Ok(())
            }
        };

        let slot = self.gate.lock().await;
        // A start may have been admitted while this stop awaited the old
        // task; only report Stopped when the slot is still empty
        if slot.run_task.is_none() {
            transition(&self.state_tx, &self.events, ReceiverState::Stopped);
        }
        drop(slot);

        // A device-disconnect fault is surfaced to the stopper; an ordinary
        // cancellation is a graceful stop
        match result {
            Err(Error::Engine(EngineError::DeviceDisconnected)) => {
                Err(EngineError::DeviceDisconnected.into())
            }
            _ => Ok(()),
        }
    }

    /// Inject a sine test tone into the running session's playback sink.
    ///
    /// `frequency_hz` of `None` uses the 440 Hz default.
    pub async fn play_test_tone(
        &self,
        duration_secs: u32,
        frequency_hz: Option<f32>,
    ) -> Result<(), Error> {
        let slot = self.gate.lock().await;
        let Some(tone_tx) = slot.tone_tx.as_ref() else {
            return Err(EngineError::NotRunning.into());
        };
        tone_tx
            .send(ToneRequest {
                duration_secs,
                frequency_hz: frequency_hz.unwrap_or(TEST_TONE_FREQUENCY_HZ),
            })
            .await
            .map_err(|_| Error::Engine(EngineError::NotRunning))
    }
}

impl Default for ReceiverEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn transition(
    state_tx: &watch::Sender<ReceiverState>,
    events: &broadcast::Sender<EngineEvent>,
    state: ReceiverState,
) {
    state_tx.send_replace(state);
    tracing::info!(?state, "receiver state changed");
    let _ = events.send(EngineEvent::State(state));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSelector;

    fn test_config() -> ReceiverConfig {
        ReceiverConfig {
            listen_port: 0, // deliberately invalid for validation tests
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_session() {
        let engine = ReceiverEngine::new();
        let result = engine.start(test_config()).await;
        assert!(matches!(result, Err(Error::Config(_))));
        // Nothing was tracked; a stop is a clean no-op
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_start_is_already_running() {
        let engine = ReceiverEngine::new();
        let config = ReceiverConfig {
            listen_port: 39_217,
            device: DeviceSelector::NameSubstring("unlikely-device".into()),
            ..Default::default()
        };

        // The first start is accepted; its session may fault later on a
        // machine without audio devices, but the task stays tracked either
        // way
        engine.start(config.clone()).await.unwrap();
        let second = engine.start(config).await;
        assert!(matches!(
            second,
            Err(Error::Engine(EngineError::AlreadyRunning))
        ));

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), ReceiverState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let engine = ReceiverEngine::new();
        engine.stop().await.unwrap();
        engine.stop().await.unwrap();
        assert_eq!(engine.state(), ReceiverState::Stopped);
    }

    #[tokio::test]
    async fn test_tone_without_session_is_not_running() {
        let engine = ReceiverEngine::new();
        let result = engine.play_test_tone(1, None).await;
        assert!(matches!(
            result,
            Err(Error::Engine(EngineError::NotRunning))
        ));
    }

    #[tokio::test]
    async fn test_start_after_stop_is_allowed() {
        let engine = ReceiverEngine::new();
        let config = ReceiverConfig {
            listen_port: 39_218,
            ..Default::default()
        };
        engine.start(config.clone()).await.unwrap();
        engine.stop().await.unwrap();
        // Whether the first session ran or faulted, a fresh start must be
        // accepted once the slot is cleared
        engine.start(config).await.unwrap();
        engine.stop().await.unwrap();
    }
}
