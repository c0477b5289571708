//! Stream metadata and sequence/time conversions
//!
//! Sequence numbers are frame indices at the container's nominal frame rate.
//! All conversions between playback time and sequence numbers go through
//! `MediaInfo` so every actor agrees on the mapping.

use serde::{Deserialize, Serialize};

/// Guards float rounding at exact frame boundaries
const SEQ_EPSILON: f64 = 1e-9;

/// PCM layout delivered in `Frame::audio` (signed, little-endian, interleaved)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// Bytes per sample-frame (one sample for every channel)
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
}

/// Reply to a media info request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub audio: Option<AudioFormat>,
    pub video: VideoFormat,
    pub frame_rate: f64,
    pub duration_ms: Option<u64>,
}

impl MediaInfo {
    pub fn frame_interval_ms(&self) -> f64 {
        1000.0 / self.frame_rate
    }

    /// Frame covering playback position `ms` (floor)
    pub fn seq_at(&self, ms: f64) -> u64 {
        if ms <= 0.0 {
            return 0;
        }
        (ms * self.frame_rate / 1000.0 + SEQ_EPSILON).floor() as u64
    }

    /// First frame whose timestamp is at or after `ms` (ceil)
    pub fn seq_at_or_after(&self, ms: f64) -> u64 {
        if ms <= 0.0 {
            return 0;
        }
        (ms * self.frame_rate / 1000.0 - SEQ_EPSILON).ceil().max(0.0) as u64
    }

    /// Frame nearest to `ms`; used to interpret achieved seek positions
    pub fn seq_nearest(&self, ms: u64) -> u64 {
        (ms as f64 * self.frame_rate / 1000.0).round() as u64
    }

    /// Canonical timestamp of a frame
    pub fn timestamp_ms(&self, seq: u64) -> u64 {
        (seq as f64 * 1000.0 / self.frame_rate + SEQ_EPSILON).floor() as u64
    }

    /// Total frames, when the container reports a duration
    pub fn frame_count(&self) -> Option<u64> {
        self.duration_ms.map(|d| self.seq_at_or_after(d as f64))
    }

    /// Upper bound of decoded audio bytes per frame
    pub fn max_audio_bytes_per_frame(&self) -> usize {
        match self.audio {
            Some(format) => {
                let samples = (format.sample_rate as f64 / self.frame_rate).ceil() as usize + 1;
                samples * format.frame_bytes()
            }
            None => 0,
        }
    }
}
