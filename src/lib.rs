//! STEPFRAME - concurrent video/audio playback engine
//!
//! Re-exports all modules for use by the binary target.

// Core engine (actors, cache, controller)
pub mod core;

// App modules
pub mod cli;
pub mod config;
pub mod entities;
pub mod error;
pub mod media;
pub mod paths;

#[cfg(test)]
mod testing;

// Re-export commonly used types from core
pub use core::{Backend, Engine, PlaybackState, PlayerEvent};
pub use config::EngineConfig;
pub use error::{EngineError, Result};

// Re-export entities
pub use entities::{Frame, MediaInfo};
