//! Opus encoder bound to one streaming configuration
//!
//! The encoder is created once per capture session; a configuration change
//! requires tearing it down and building a new one.

use bytes::Bytes;
use opus::{Application, Bitrate, Channels, Encoder};

use crate::config::StreamingConfig;
use crate::error::CodecError;

/// Stateful Opus encoder for fixed-duration voice frames
pub struct FrameEncoder {
    encoder: Encoder,
    config: StreamingConfig,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl FrameEncoder {
    /// Create and fully configure an encoder.
    ///
    /// Any rejection from the codec here is fatal to pipeline startup.
    pub fn new(config: StreamingConfig) -> Result<Self, CodecError> {
        let channels = match config.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {other}"
                )))
            }
        };

        let mut encoder = Encoder::new(config.sample_rate(), channels, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(Bitrate::Bits(config.bitrate_bps as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {e}")))?;
        encoder
            .set_complexity(i32::from(config.complexity))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set complexity: {e}")))?;
        encoder
            .set_inband_fec(config.fec_enabled)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {e}")))?;
        if config.fec_enabled {
            encoder
                .set_packet_loss_perc(i32::from(config.expected_loss_percent))
                .map_err(|e| {
                    CodecError::EncoderInit(format!("Failed to set packet loss: {e}"))
                })?;
        }

        // Max Opus frame is about 1275 bytes; 4000 is the documented safe ceiling
        let encode_buffer = vec![0u8; 4000];

        Ok(Self {
            encoder,
            config,
            encode_buffer,
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Encode one fixed-size frame of interleaved 16-bit PCM.
    ///
    /// Returns `Ok(None)` when the codec produced no transmittable payload
    /// for this frame (a 0/1-byte DTX placeholder); the caller skips the
    /// send rather than putting an empty packet on the wire.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Option<Bytes>, CodecError> {
        if pcm.len() != self.config.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }

        let size = self
            .encoder
            .encode(pcm, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        if size <= 1 {
            return Ok(None);
        }

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;
        Ok(Some(Bytes::copy_from_slice(&self.encode_buffer[..size])))
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Samples per frame across all channels
    pub fn samples_per_frame(&self) -> usize {
        self.config.samples_per_frame()
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone, Copy)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
}
