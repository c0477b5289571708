//! Decoded frame buffers (RGBA picture + interleaved PCM audio)
//!
//! **Why**: Frames are allocated once per cache slot and refilled in place by
//! the fetcher. `reset()` keeps the vectors' capacity so a refill of a
//! same-sized video never reallocates.
//!
//! **Used by**: FrameFetcher (fill), FrameCache (ownership), renderers (read)

use image::RgbaImage;

/// RGBA8 picture, row-major, no padding
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Picture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Picture {
    /// Resize buffer for `width` x `height`, reusing capacity
    pub fn prepare(&mut self, width: u32, height: u32) -> &mut [u8] {
        self.width = width;
        self.height = height;
        self.pixels.resize(width as usize * height as usize * 4, 0);
        &mut self.pixels
    }

    pub fn clear(&mut self) {
        self.width = 0;
        self.height = 0;
        self.pixels.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.pixels.is_empty()
    }

    /// Copy out as an `image` buffer (None for gap/end frames)
    pub fn to_image(&self) -> Option<RgbaImage> {
        if self.is_empty() {
            return None;
        }
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
    }
}

/// One decoded audio+video unit at a sequence number
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub end_of_media: bool,
    /// Interleaved signed little-endian PCM (see `AudioFormat`)
    pub audio: Vec<u8>,
    pub picture: Picture,
}

impl Frame {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Clear contents before a refill (capacity retained)
    pub fn reset(&mut self) {
        self.seq = 0;
        self.timestamp_ms = 0;
        self.end_of_media = false;
        self.audio.clear();
        self.picture.clear();
    }

    /// Turn this buffer into a placeholder with no picture and no audio
    pub fn make_gap(&mut self, seq: u64, timestamp_ms: u64, end_of_media: bool) {
        self.reset();
        self.seq = seq;
        self.timestamp_ms = timestamp_ms;
        self.end_of_media = end_of_media;
    }

    /// Memory held by the buffers in bytes
    pub fn mem(&self) -> usize {
        self.audio.capacity() + self.picture.pixels.capacity()
    }
}
