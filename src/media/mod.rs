//! Concrete collaborators: FFmpeg decoder, cpal audio line, image canvas

pub mod cpal_line;
pub mod ffmpeg;
pub mod surface;

pub use cpal_line::{CpalLine, new_cpal_line};
pub use ffmpeg::{FfmpegDecoder, OUTPUT_AUDIO, new_ffmpeg_decoder};
pub use surface::ImageSurface;
