//! VideoRenderer actor - paints the latest frame on the active surface
//!
//! Keeps the displayed frame's lease until the next one arrives and a copy
//! of its image for repaints (expose, resize, surface hand-off).

use std::time::Instant;

use image::RgbaImage;
use log::{debug, trace};

use super::actor::{Actor, Context};
use super::frame_cache::CachedFrame;
use crate::entities::{PaintSurface, Rect};
use crate::error::Result;

pub enum VideoMsg {
    Frame(CachedFrame),
    /// Replace the active surface and repaint on it
    SetSurface(Box<dyn PaintSurface>),
    Repaint,
    /// Forget the displayed frame (new video)
    Clear,
}

/// Largest 4:3 box centred in a `width` x `height` surface
pub fn letterbox(width: u32, height: u32) -> Rect {
    if width as u64 * 3 > height as u64 * 4 {
        let box_width = (height as u64 * 4 / 3) as u32;
        Rect { x: (width - box_width) / 2, y: 0, width: box_width, height }
    } else {
        let box_height = (width as u64 * 3 / 4) as u32;
        Rect { x: 0, y: (height - box_height) / 2, width, height: box_height }
    }
}

#[derive(Default)]
pub struct VideoRenderer {
    surface: Option<Box<dyn PaintSurface>>,
    current: Option<CachedFrame>,
    image: Option<RgbaImage>,
    painted: u64,
}

impl VideoRenderer {
    pub fn new(surface: Option<Box<dyn PaintSurface>>) -> Self {
        Self { surface, ..Default::default() }
    }

    pub fn current_seq(&self) -> Option<u64> {
        self.current.as_ref().map(|f| f.seq)
    }

    pub fn painted(&self) -> u64 {
        self.painted
    }

    pub fn show(&mut self, frame: CachedFrame) {
        trace!("Display frame {}", frame.seq);
        // Gap frames carry no picture; keep showing the last image
        if let Some(image) = frame.frame().picture.to_image() {
            self.image = Some(image);
        }
        if let Some(previous) = self.current.replace(frame) {
            previous.recycle();
        }
        self.paint();
    }

    pub fn set_surface(&mut self, surface: Box<dyn PaintSurface>) {
        let (w, h) = surface.size();
        debug!("Surface replaced ({}x{})", w, h);
        self.surface = Some(surface);
        self.paint();
    }

    pub fn clear(&mut self) {
        if let Some(previous) = self.current.take() {
            previous.recycle();
        }
        self.image = None;
        if let Some(surface) = self.surface.as_mut() {
            surface.clear();
        }
    }

    pub fn paint(&mut self) {
        let (Some(surface), Some(image)) = (self.surface.as_mut(), self.image.as_ref()) else {
            return;
        };
        let started = Instant::now();
        let (width, height) = surface.size();
        if width == 0 || height == 0 {
            return;
        }
        surface.clear();
        surface.blit(image, letterbox(width, height));
        self.painted += 1;
        trace!("Painted in {:.2}ms", started.elapsed().as_secs_f64() * 1000.0);
    }
}

impl Actor for VideoRenderer {
    type Msg = VideoMsg;

    fn handle(&mut self, msg: VideoMsg, _ctx: &mut Context<VideoMsg>) -> Result<()> {
        match msg {
            VideoMsg::Frame(frame) => self.show(frame),
            VideoMsg::SetSurface(surface) => self.set_surface(surface),
            VideoMsg::Repaint => self.paint(),
            VideoMsg::Clear => self.clear(),
        }
        Ok(())
    }

    fn stopped(&mut self) {
        debug!("VideoRenderer stopped after {} paints", self.painted);
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Frame;
    use crate::testing::MemorySurface;
    use std::sync::Arc;

    fn picture_frame(seq: u64, width: u32, height: u32) -> CachedFrame {
        let mut frame = Frame::empty();
        frame.seq = seq;
        frame.picture.prepare(width, height).fill(seq as u8);
        CachedFrame::detached(seq, 0, Arc::new(frame))
    }

    #[test]
    fn test_letterbox_wide_and_tall() {
        assert_eq!(letterbox(1920, 1080), Rect { x: 240, y: 0, width: 1440, height: 1080 });
        assert_eq!(letterbox(400, 600), Rect { x: 0, y: 150, width: 400, height: 300 });
        assert_eq!(letterbox(640, 480), Rect { x: 0, y: 0, width: 640, height: 480 });
    }

    #[test]
    fn test_show_paints_letterboxed() {
        let surface = MemorySurface::new(800, 480);
        let mut renderer = VideoRenderer::new(Some(Box::new(surface.clone())));
        renderer.show(picture_frame(3, 16, 9));

        let blits = surface.blits();
        assert_eq!(blits.len(), 1);
        assert_eq!(blits[0].rect, Rect { x: 80, y: 0, width: 640, height: 480 });
        assert_eq!(blits[0].image_size, (16, 9));
        assert_eq!(renderer.current_seq(), Some(3));
    }

    #[test]
    fn test_surface_handoff_keeps_last_image() {
        let first = MemorySurface::new(640, 480);
        let mut renderer = VideoRenderer::new(Some(Box::new(first.clone())));
        renderer.show(picture_frame(1, 8, 6));

        let second = MemorySurface::new(300, 300);
        renderer.set_surface(Box::new(second.clone()));
        let blits = second.blits();
        assert_eq!(blits.len(), 1);
        assert_eq!(blits[0].rect, Rect { x: 0, y: 37, width: 300, height: 225 });
        assert_eq!(first.blits().len(), 1);
    }

    #[test]
    fn test_gap_frame_keeps_previous_image() {
        let surface = MemorySurface::new(640, 480);
        let mut renderer = VideoRenderer::new(Some(Box::new(surface.clone())));
        renderer.show(picture_frame(1, 8, 6));

        let mut gap = Frame::empty();
        gap.make_gap(2, 80, false);
        renderer.show(CachedFrame::detached(2, 0, Arc::new(gap)));
        assert_eq!(surface.blits().len(), 2);
        assert_eq!(renderer.current_seq(), Some(2));
        // every paint wipes the surface first
        assert_eq!(surface.clears(), 2);

        renderer.clear();
        assert_eq!(surface.clears(), 3);
        assert_eq!(renderer.current_seq(), None);
        renderer.paint();
        assert_eq!(surface.blits().len(), 2);
        assert_eq!(surface.clears(), 3);
    }
}
