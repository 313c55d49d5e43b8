//! UDP transport for the audio stream

pub mod jitter;
pub mod receiver;
pub mod sender;

pub use jitter::{EnqueueOutcome, SequenceJitterBuffer};
pub use sender::UdpTransmitter;
