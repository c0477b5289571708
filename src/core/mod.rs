//! Core engine - actors and the playback pipeline
//!
//! Controller -> FrameCache -> FrameFetcher for frames, Controller ->
//! AudioRenderer / VideoRenderer for output. Independent of any UI.

pub mod actor;
pub mod audio_renderer;
pub mod controller;
pub mod engine;
pub mod fetcher;
pub mod frame_cache;
pub mod timer;
pub mod video_renderer;

pub use actor::{Actor, ActorHandle, Addr, Context, ErrorReport, Recipient};
pub use audio_renderer::{AudioSyncEvent, ControlCommand, resample_into};
pub use controller::{Backend, PlaybackState, PlayerEvent};
pub use engine::Engine;
pub use frame_cache::{CacheStats, CachedFrame, FrameRequest};
pub use timer::Timer;
pub use video_renderer::letterbox;
