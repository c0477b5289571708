//! Engine tunables, persisted as `stepframe.json`
//!
//! A missing file means defaults; a malformed or inconsistent one is an
//! error. `validate` asserts at startup the pool-size relation the cache
//! depends on, instead of failing deep inside request handling.

use std::path::Path;

use anyhow::{Context, Result};
use log::debug;

use crate::error::EngineError;

/// File name inside the config directory
pub const CONFIG_FILE: &str = "stepframe.json";

/// Engine tunables
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Frames per cache block (unit of fetch and eviction)
    pub block_size: usize,
    pub n_cache_blocks: usize,
    /// Opportunistic misses are benched below this headroom
    pub cache_min_reserve: usize,
    /// Benched request is retried at this headroom
    pub cache_max_reserve: usize,
    /// Frames requested ahead of the displayed one
    pub prefetch_size: usize,
    /// Usage units per played frame (controller + audio)
    pub usage_count: u32,
    /// Added to the clock when audio actually starts
    pub sync_offset_ms: i64,
    /// Slowest playback speed magnitude
    pub min_speed: f64,

    pub controller_tick_ms: u64,
    pub audio_tick_ms: u64,
    pub cache_idle_ms: u64,
    /// Re-request the expected frame after this long without progress
    pub stall_timeout_ms: u64,
    /// Play without audio sync if the line has not started by then
    pub prepare_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 8,
            n_cache_blocks: 24,
            cache_min_reserve: 4,
            cache_max_reserve: 8,
            prefetch_size: 30,
            usage_count: 2,
            sync_offset_ms: 0,
            min_speed: 0.25,
            controller_tick_ms: 5,
            audio_tick_ms: 10,
            cache_idle_ms: 20,
            stall_timeout_ms: 1000,
            prepare_timeout_ms: 2000,
            shutdown_timeout_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Load from `path`, defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::paths::ensure_parent(path)?;
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config: {}", path.display()))
    }

    /// Blocks a full prefetch window can pin at once
    pub fn window_blocks(&self) -> usize {
        self.prefetch_size.div_ceil(self.block_size.max(1))
    }

    /// Check the relations the engine relies on
    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        let fail = |msg: String| Err(EngineError::Config(msg));

        if self.block_size == 0 {
            return fail("block_size must be at least 1".into());
        }
        if self.usage_count == 0 {
            return fail("usage_count must be at least 1".into());
        }
        if self.prefetch_size == 0 {
            return fail("prefetch_size must be at least 1".into());
        }
        if self.cache_min_reserve > self.cache_max_reserve {
            return fail(format!(
                "cache_min_reserve ({}) exceeds cache_max_reserve ({})",
                self.cache_min_reserve, self.cache_max_reserve
            ));
        }
        if !(self.min_speed > 0.0 && self.min_speed <= 1.0) {
            return fail(format!("min_speed must be in (0, 1], got {}", self.min_speed));
        }
        // Two windows with their straddling blocks (the audio renderer holds
        // the old one until its flush lands), the displayed frame and the
        // fetch in flight
        let required = 2 * (self.window_blocks() + 1) + 2 + self.cache_max_reserve;
        if self.n_cache_blocks < required {
            return fail(format!(
                "n_cache_blocks ({}) too small: prefetch of {} frames in blocks of {} with reserve {} needs {}",
                self.n_cache_blocks,
                self.prefetch_size,
                self.block_size,
                self.cache_max_reserve,
                required
            ));
        }
        Ok(())
    }

    /// Scratch bytes for one frame of audio at the slowest speed
    pub fn audio_scratch_bytes(&self, frame_audio_bytes: usize) -> usize {
        (frame_audio_bytes as f64 / self.min_speed).ceil() as usize
    }
}
