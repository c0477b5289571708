//! Test doubles for the collaborator traits
//!
//! - `MockDecoder`: synthetic 25 fps stream, seeks land on keyframes
//! - `MockLine`: records written PCM, fires line events synchronously
//! - `MemorySurface`: records blits

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::RgbaImage;

use crate::entities::{
    AudioFormat, AudioLine, Decoder, DecoderFactory, Frame, LineEvent, LineListener, MediaInfo,
    PaintSurface, Rect, VideoFormat,
};
use crate::error::{EngineError, Result};

pub const MOCK_FPS: f64 = 25.0;
pub const MOCK_AUDIO: AudioFormat = AudioFormat { sample_rate: 48000, channels: 2, bits_per_sample: 16 };

/// Decoder producing `frames` frames; frame index is encoded in the pixels
pub struct MockDecoder {
    frames: u64,
    keyframe_interval: u64,
    /// Frames past the keyframe every seek lands on
    pub overshoot: u64,
    pub audio: Option<AudioFormat>,
    /// Time each decoded frame takes
    pub frame_delay: Duration,
    position: u64,
}

impl MockDecoder {
    pub fn new(frames: u64, keyframe_interval: u64) -> Self {
        Self {
            frames,
            keyframe_interval: keyframe_interval.max(1),
            overshoot: 0,
            audio: Some(MOCK_AUDIO),
            frame_delay: Duration::ZERO,
            position: 0,
        }
    }

    /// Index a mock frame was decoded from
    pub fn frame_index(frame: &Frame) -> Option<u64> {
        let bytes: [u8; 8] = frame.picture.pixels.get(..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    fn info(&self) -> MediaInfo {
        MediaInfo {
            audio: self.audio,
            video: VideoFormat { width: 4, height: 4 },
            frame_rate: MOCK_FPS,
            duration_ms: Some((self.frames as f64 * 1000.0 / MOCK_FPS) as u64),
        }
    }
}

impl Decoder for MockDecoder {
    fn open(&mut self, path: &Path) -> Result<MediaInfo> {
        if path.to_string_lossy().contains("missing") {
            return Err(EngineError::Media(format!("{}: no such file", path.display())));
        }
        Ok(self.info())
    }

    fn seek(&mut self, ms: u64) -> Result<u64> {
        let info = self.info();
        let target = info.seq_at(ms as f64);
        let keyframe = target - target % self.keyframe_interval;
        self.position = (keyframe + self.overshoot).min(self.frames);
        Ok(info.timestamp_ms(self.position))
    }

    fn read_next_frame(&mut self, frame: &mut Frame) -> Result<bool> {
        if self.position >= self.frames {
            return Ok(false);
        }
        if !self.frame_delay.is_zero() {
            std::thread::sleep(self.frame_delay);
        }
        let pixels = frame.picture.prepare(4, 4);
        pixels[..8].copy_from_slice(&self.position.to_le_bytes());
        if let Some(format) = self.audio {
            let samples = (format.sample_rate as f64 / MOCK_FPS) as usize;
            frame.audio.clear();
            frame.audio.resize(samples * format.frame_bytes(), self.position as u8);
        }
        self.position += 1;
        Ok(true)
    }

    fn close(&mut self) {}
}

pub fn mock_decoder_factory(frames: u64, keyframe_interval: u64) -> Arc<dyn DecoderFactory> {
    decoder_factory(move || MockDecoder::new(frames, keyframe_interval))
}

/// Factory for customised mock decoders
pub fn decoder_factory<F>(make: F) -> Arc<dyn DecoderFactory>
where
    F: Fn() -> MockDecoder + Send + Sync + 'static,
{
    Arc::new(move || -> Box<dyn Decoder> { Box::new(make()) })
}

#[derive(Default)]
struct LineState {
    capacity: usize,
    written: Vec<u8>,
    flushes: usize,
    fail_start: bool,
    listener: Option<LineListener>,
}

/// Audio line with shared, inspectable state
#[derive(Clone, Default)]
pub struct MockLine {
    state: Arc<Mutex<LineState>>,
}

impl MockLine {
    /// Line with `capacity` bytes of free buffer
    pub fn new(capacity: usize) -> Self {
        let line = Self::default();
        line.set_capacity(capacity);
        line
    }

    /// Line that takes everything
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.lock().capacity = capacity;
    }

    pub fn fail_start(&self) {
        self.lock().fail_start = true;
    }

    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }

    fn notify(&self, event: LineEvent) {
        let listener = self.lock().listener.clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }
}

impl AudioLine for MockLine {
    fn open(&mut self, _format: AudioFormat, listener: LineListener) -> Result<()> {
        self.lock().listener = Some(listener);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.lock().fail_start {
            return Err(EngineError::Device("mock device gone".into()));
        }
        self.notify(LineEvent::Start);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.notify(LineEvent::Stop);
        Ok(())
    }

    fn available(&self) -> usize {
        self.lock().capacity
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut state = self.lock();
        let taken = data.len().min(state.capacity);
        state.capacity -= taken;
        state.written.extend_from_slice(&data[..taken]);
        taken
    }

    fn flush(&mut self) {
        self.lock().flushes += 1;
    }

    fn close(&mut self) {
        self.lock().listener = None;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Blit {
    pub rect: Rect,
    pub image_size: (u32, u32),
}

#[derive(Default)]
struct SurfaceState {
    size: (u32, u32),
    blits: Vec<Blit>,
    clears: usize,
}

/// Surface recording what was painted
#[derive(Clone, Default)]
pub struct MemorySurface {
    state: Arc<Mutex<SurfaceState>>,
}

impl MemorySurface {
    pub fn new(width: u32, height: u32) -> Self {
        let surface = Self::default();
        surface.lock().size = (width, height);
        surface
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SurfaceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn blits(&self) -> Vec<Blit> {
        self.lock().blits.clone()
    }

    pub fn clears(&self) -> usize {
        self.lock().clears
    }
}

impl PaintSurface for MemorySurface {
    fn size(&self) -> (u32, u32) {
        self.lock().size
    }

    fn blit(&mut self, image: &RgbaImage, rect: Rect) {
        self.lock().blits.push(Blit { rect, image_size: image.dimensions() });
    }

    fn clear(&mut self) {
        self.lock().clears += 1;
    }
}
