//! Collaborator interfaces consumed by the engine.
//!
//! The engine never talks to FFmpeg, an audio device or a window directly.
//! Actors own boxed trait objects built by factories on their own threads,
//! so implementations do not need to be `Send` (cpal streams, FFmpeg
//! contexts). Concrete implementations live in `media/`; test doubles in
//! `testing`.

use std::path::Path;
use std::sync::Arc;

use image::RgbaImage;

use super::frame::Frame;
use super::media::{AudioFormat, MediaInfo};
use crate::error::Result;

/// Container decoder.
pub trait Decoder {
    /// Open a container and describe its streams
    fn open(&mut self, path: &Path) -> Result<MediaInfo>;

    /// Seek near `ms` and return the position actually reached.
    ///
    /// Seeks land on the decoder's index granularity (keyframes), so the
    /// achieved position may be before or after the request.
    fn seek(&mut self, ms: u64) -> Result<u64>;

    /// Decode the next frame into `frame.picture` / `frame.audio`.
    ///
    /// Returns `Ok(false)` at end of media. Sequence number and timestamp
    /// are assigned by the caller.
    fn read_next_frame(&mut self, frame: &mut Frame) -> Result<bool>;

    fn close(&mut self);
}

/// Audio line state changes reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEvent {
    /// Device began producing sound
    Start,
    /// Device stopped (paused, drained, or lost)
    Stop,
}

/// Callback invoked from the device's thread
pub type LineListener = Arc<dyn Fn(LineEvent) + Send + Sync>;

/// Audio output device.
pub trait AudioLine {
    fn open(&mut self, format: AudioFormat, listener: LineListener) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// Bytes the line accepts without blocking
    fn available(&self) -> usize;
    /// Queue bytes; returns how many were taken
    fn write(&mut self, data: &[u8]) -> usize;
    /// Discard queued but unplayed bytes
    fn flush(&mut self);
    fn close(&mut self);
}

/// Target rectangle in surface pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Something frames can be painted on. Moved between threads on hand-off.
pub trait PaintSurface: Send {
    /// Width and height in pixels
    fn size(&self) -> (u32, u32);
    /// Scale `image` into `rect`
    fn blit(&mut self, image: &RgbaImage, rect: Rect);
    fn clear(&mut self);
}

/// Builds a decoder on the fetcher thread
pub trait DecoderFactory: Send + Sync {
    fn create(&self) -> Box<dyn Decoder>;
}

impl<F> DecoderFactory for F
where
    F: Fn() -> Box<dyn Decoder> + Send + Sync,
{
    fn create(&self) -> Box<dyn Decoder> {
        self()
    }
}

/// Builds an audio line on the audio renderer thread. May fail (no device).
pub trait AudioLineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn AudioLine>>;
}

impl<F> AudioLineFactory for F
where
    F: Fn() -> Result<Box<dyn AudioLine>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn AudioLine>> {
        self()
    }
}
