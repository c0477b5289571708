//! In-memory RGBA canvas
//!
//! Shares its pixels behind a mutex so the owner can read or save the
//! canvas while the video renderer paints on another thread.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use image::{Rgba, RgbaImage, imageops};

use crate::entities::{PaintSurface, Rect};

#[derive(Clone)]
pub struct ImageSurface {
    canvas: Arc<Mutex<RgbaImage>>,
}

impl ImageSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self { canvas: Arc::new(Mutex::new(RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255])))) }
    }

    fn lock(&self) -> MutexGuard<'_, RgbaImage> {
        self.canvas.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current canvas
    pub fn snapshot(&self) -> RgbaImage {
        self.lock().clone()
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        crate::paths::ensure_parent(path)?;
        self.snapshot()
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("Failed to save snapshot: {}", path.display()))
    }
}

impl PaintSurface for ImageSurface {
    fn size(&self) -> (u32, u32) {
        self.lock().dimensions()
    }

    fn blit(&mut self, image: &RgbaImage, rect: Rect) {
        if rect.width == 0 || rect.height == 0 {
            return;
        }
        let scaled = if image.dimensions() == (rect.width, rect.height) {
            image.clone()
        } else {
            imageops::resize(image, rect.width, rect.height, imageops::FilterType::Triangle)
        };
        imageops::replace(&mut *self.lock(), &scaled, rect.x as i64, rect.y as i64);
    }

    fn clear(&mut self) {
        for pixel in self.lock().pixels_mut() {
            *pixel = Rgba([0, 0, 0, 255]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blit_scales_into_rect() {
        let mut surface = ImageSurface::new(8, 4);
        let red = RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 255]));
        surface.blit(&red, Rect { x: 2, y: 0, width: 4, height: 4 });

        let canvas = surface.snapshot();
        assert_eq!(canvas.get_pixel(0, 0), &Rgba([0, 0, 0, 255]));
        assert_eq!(canvas.get_pixel(3, 2), &Rgba([255, 0, 0, 255]));
        assert_eq!(canvas.get_pixel(7, 3), &Rgba([0, 0, 0, 255]));

        surface.clear();
        assert_eq!(surface.snapshot().get_pixel(3, 2), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_save_png() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shots").join("last.png");
        let surface = ImageSurface::new(4, 4);
        surface.save_png(&path).expect("save");
        let loaded = image::open(&path).expect("open").to_rgba8();
        assert_eq!(loaded.dimensions(), (4, 4));
    }
}
