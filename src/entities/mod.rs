//! Entities - plain data and collaborator interfaces
//!
//! No threads here. `core` builds the actors on top of these types.

pub mod frame;
pub mod media;
pub mod traits;

pub use frame::{Frame, Picture};
pub use media::{AudioFormat, MediaInfo, VideoFormat};
pub use traits::{
    AudioLine, AudioLineFactory, Decoder, DecoderFactory, LineEvent, LineListener, PaintSurface,
    Rect,
};
