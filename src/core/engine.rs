//! Engine - public handle over the actor pipeline
//!
//! Spawns the VideoRenderer and the Controller; the Controller builds the
//! per-video fetcher/cache/audio actors on `load`. All calls only enqueue
//! messages. Progress comes back on the `events()` channel.
//!
//! # Example
//! ```ignore
//! let engine = Engine::new(config, backend, Some(Box::new(surface)))?;
//! engine.load("clip.mp4", 0);
//! engine.play();
//! while let Ok(event) = engine.events().recv() {
//!     if event == PlayerEvent::EndOfMedia { break; }
//! }
//! engine.shutdown();
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crossbeam_channel::{Receiver, unbounded};
use log::{info, warn};

use super::actor::{self, ActorHandle, ErrorReport, Recipient};
use super::audio_renderer::ControlCommand;
use super::controller::{Backend, Controller, ControllerMsg, PlayerEvent};
use super::video_renderer::{VideoMsg, VideoRenderer};
use crate::config::EngineConfig;
use crate::entities::PaintSurface;
use crate::error::Result;

pub struct Engine {
    controller: ActorHandle<ControllerMsg>,
    video: ActorHandle<VideoMsg>,
    events: Receiver<PlayerEvent>,
    shutdown_timeout: Duration,
}

impl Engine {
    /// Validate `config` and start the long-lived actors
    pub fn new(
        config: EngineConfig,
        backend: Backend,
        surface: Option<Box<dyn PaintSurface>>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, events) = unbounded();
        let event_sink = Recipient::from_sender("stepframe-events", tx);
        let errors_sink = event_sink.clone();
        let errors = Recipient::from_fn("stepframe-errors", move |report: ErrorReport| {
            warn!("{}: {}", report.actor, report.error);
            errors_sink.send(PlayerEvent::Error(report.error))
        });

        let video = actor::spawn("stepframe-video", errors.clone(), move |_| {
            VideoRenderer::new(surface)
        })?;

        let video_addr = video.addr().clone();
        let shutdown_timeout = Duration::from_millis(config.shutdown_timeout_ms);
        let controller = actor::spawn("stepframe-controller", errors, move |addr| {
            Controller::new(config, backend, addr.clone(), video_addr, event_sink)
        })?;

        info!("Engine started");
        Ok(Self { controller, video, events, shutdown_timeout })
    }

    /// Open `path` and show the frame at `position_ms`
    pub fn load(&self, path: impl Into<PathBuf>, position_ms: u64) {
        self.controller.addr().send(ControllerMsg::NewVideo { path: path.into(), position_ms });
    }

    pub fn play(&self) {
        self.controller.addr().send(ControllerMsg::Command(ControlCommand::Start));
    }

    pub fn stop(&self) {
        self.controller.addr().send(ControllerMsg::Command(ControlCommand::Stop));
    }

    /// Unload the current video
    pub fn close(&self) {
        self.controller.addr().send(ControllerMsg::Command(ControlCommand::Close));
    }

    pub fn seek(&self, position_ms: u64) {
        self.controller.addr().send(ControllerMsg::SetPosition(position_ms));
    }

    /// Negative speeds play backwards
    pub fn set_speed(&self, speed: f64) {
        self.controller.addr().send(ControllerMsg::SetSpeed(speed));
    }

    /// Hand the picture to another surface
    pub fn set_surface(&self, surface: Box<dyn PaintSurface>) {
        self.video.addr().send(VideoMsg::SetSurface(surface));
    }

    /// Repaint the last frame (expose/resize)
    pub fn repaint(&self) {
        self.video.addr().send(VideoMsg::Repaint);
    }

    pub fn events(&self) -> &Receiver<PlayerEvent> {
        &self.events
    }

    /// Stop everything; false if some thread missed its deadline
    pub fn shutdown(self) -> bool {
        // The controller waits for its session actors in turn
        let controller_ok = self.controller.shutdown(self.shutdown_timeout * 4);
        let video_ok = self.video.shutdown(self.shutdown_timeout);
        info!("Engine stopped");
        controller_ok && video_ok
    }
}
