//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod gain;
pub mod playback;

pub use buffer::PlaybackBuffer;
pub use capture::{CapturePipeline, CaptureSource, PipelineState, SourceFactory};
pub use gain::GainStage;
pub use playback::PlaybackEngine;
