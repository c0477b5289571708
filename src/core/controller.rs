//! Controller actor - playback state machine and logical clock
//!
//! States: `Stopped -> Preparing -> Playing`. Starting requests a prefetch
//! window, starts the audio line and runs the clock optimistically; the
//! line's real start event re-anchors the clock (plus `sync_offset_ms`) and
//! switches to `Playing`. Every render tick shows the latest due frame and
//! keeps the window full with one opportunistic request per shown frame.
//!
//! Each load owns a fetcher, a cache and an audio renderer (a `Session`).
//! Messages from a session carry its load id; frames carry the epoch of
//! their request. Seek, stop, speed flips and loads bump the epoch, so
//! anything older is dropped (and recycled) on arrival.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use log::{debug, error, info, trace, warn};

use super::actor::{self, ActorHandle, Actor, Addr, Context, ErrorReport, Recipient};
use super::audio_renderer::{AudioMsg, AudioRenderer, AudioSyncEvent, ControlCommand};
use super::fetcher::{FetcherMsg, FrameFetcher, MediaInfoRequest};
use super::frame_cache::{CacheConfig, CacheLinks, CacheMsg, CachedFrame, FrameCache, FrameRequest};
use super::timer::Timer;
use super::video_renderer::VideoMsg;
use crate::config::EngineConfig;
use crate::entities::{AudioLineFactory, DecoderFactory, Frame, MediaInfo};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Preparing,
    Playing,
}

/// Notifications for whoever drives the engine
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Loaded { path: PathBuf, info: MediaInfo },
    StateChanged(PlaybackState),
    /// A frame was handed to the video renderer
    Position { seq: u64, timestamp_ms: u64 },
    EndOfMedia,
    Error(EngineError),
}

/// Collaborator factories for new loads
#[derive(Clone)]
pub struct Backend {
    pub decoders: Arc<dyn DecoderFactory>,
    /// `None` plays silently
    pub audio: Option<Arc<dyn AudioLineFactory>>,
}

pub enum ControllerMsg {
    NewVideo { path: PathBuf, position_ms: u64 },
    Command(ControlCommand),
    SetPosition(u64),
    SetSpeed(f64),
    MediaInfo { load: u64, info: MediaInfo },
    Frame { load: u64, frame: CachedFrame },
    AudioSync { load: u64, event: AudioSyncEvent },
    Error { load: u64, report: ErrorReport },
}

/// Actors of one loaded video
struct Session {
    load: u64,
    path: PathBuf,
    fetcher: ActorHandle<FetcherMsg>,
    cache: ActorHandle<CacheMsg>,
    audio: Option<ActorHandle<AudioMsg>>,
    info: Option<MediaInfo>,
}

pub struct Controller {
    config: EngineConfig,
    backend: Backend,
    own: Addr<ControllerMsg>,
    video: Addr<VideoMsg>,
    events: Recipient<PlayerEvent>,

    session: Option<Session>,
    next_load: u64,
    state: PlaybackState,
    timer: Timer,
    speed: f64,
    epoch: u64,

    /// Accepted frames waiting for their display time
    queue: VecDeque<CachedFrame>,
    /// Next sequence the window accepts (`None` past the start in reverse)
    expected: Option<u64>,
    /// Next sequence to request
    next_request: Option<u64>,

    start_pending: bool,
    pending_position: Option<u64>,
    starting_timer_pos: f64,
    preparing_since: Option<Instant>,
    last_progress: Instant,

    /// Frame buffers handed back by torn-down caches
    spares: Vec<Frame>,
    spares_in: Receiver<Vec<Frame>>,
    spares_out: Recipient<Vec<Frame>>,
}

impl Controller {
    pub fn new(
        config: EngineConfig,
        backend: Backend,
        own: Addr<ControllerMsg>,
        video: Addr<VideoMsg>,
        events: Recipient<PlayerEvent>,
    ) -> Self {
        let (spares_tx, spares_in) = unbounded();
        Self {
            config,
            backend,
            own,
            video,
            events,
            session: None,
            next_load: 0,
            state: PlaybackState::Stopped,
            timer: Timer::new(),
            speed: 1.0,
            epoch: 0,
            queue: VecDeque::new(),
            expected: None,
            next_request: None,
            start_pending: false,
            pending_position: None,
            starting_timer_pos: 0.0,
            preparing_since: None,
            last_progress: Instant::now(),
            spares: Vec::new(),
            spares_in,
            spares_out: Recipient::from_sender("stepframe-controller", spares_tx),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            debug!("Playback {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.send(PlayerEvent::StateChanged(state));
        }
    }

    fn info(&self) -> Option<&MediaInfo> {
        self.session.as_ref().and_then(|s| s.info.as_ref())
    }

    fn load_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.load)
    }

    fn reverse(&self) -> bool {
        self.speed < 0.0
    }

    fn send_audio(&self, msg: AudioMsg) {
        if let Some(audio) = self.session.as_ref().and_then(|s| s.audio.as_ref()) {
            audio.addr().send(msg);
        }
    }

    // ---------------------------------------------------------------- loads

    fn load(&mut self, path: PathBuf, position_ms: u64) -> Result<()> {
        self.unload();
        self.next_load += 1;
        let load = self.next_load;
        info!("Loading {} (load {})", path.display(), load);

        self.video.send(VideoMsg::Clear);
        self.timer.reset();
        self.next_epoch();
        self.start_pending = false;
        self.pending_position = Some(position_ms);

        let errors = self.own.recipient(move |report| ControllerMsg::Error { load, report });

        let decoders = Arc::clone(&self.backend.decoders);
        let fetch_path = path.clone();
        let fetcher = actor::spawn("stepframe-fetcher", errors.clone(), move |_| {
            FrameFetcher::new(fetch_path, decoders)
        })?;

        let cache_config = CacheConfig::from(&self.config);
        let spares = std::mem::take(&mut self.spares);
        let fetch = fetcher.addr().recipient(FetcherMsg::Fetch);
        let spares_out = self.spares_out.clone();
        let cache = actor::spawn("stepframe-cache", errors, move |addr| {
            FrameCache::new(
                cache_config,
                spares,
                CacheLinks {
                    fetch,
                    fetched: addr.recipient(CacheMsg::Fetched),
                    recycler: addr.recipient(CacheMsg::Recycle),
                    spares_out: Some(spares_out),
                },
            )
        })?;

        fetcher.addr().send(FetcherMsg::Info(MediaInfoRequest {
            reply: self.own.recipient(move |info| ControllerMsg::MediaInfo { load, info }),
        }));

        self.session = Some(Session { load, path, fetcher, cache, audio: None, info: None });
        Ok(())
    }

    fn on_media_info(&mut self, load: u64, info: MediaInfo) -> Result<()> {
        if self.load_id() != Some(load) {
            trace!("Media info for stale load {} dropped", load);
            return Ok(());
        }

        let errors = self.own.recipient(move |report| ControllerMsg::Error { load, report });
        let sync = self.own.recipient(move |event| ControllerMsg::AudioSync { load, event });
        let scratch = self.config.audio_scratch_bytes(info.max_audio_bytes_per_frame());
        let tick = Duration::from_millis(self.config.audio_tick_ms);
        let format = info.audio;
        let factory = self.backend.audio.clone();
        let audio = actor::spawn("stepframe-audio", errors, move |_| {
            AudioRenderer::new(format, factory, sync, scratch, tick)
        })?;
        audio.addr().send(AudioMsg::SetSpeed(self.speed));

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.audio = Some(audio);
        session.info = Some(info.clone());
        self.events.send(PlayerEvent::Loaded { path: session.path.clone(), info });

        let position = self.pending_position.take().unwrap_or(0);
        self.set_position(position);
        if std::mem::take(&mut self.start_pending) {
            self.start();
        }
        Ok(())
    }

    /// Stop playback and tear the session down
    fn unload(&mut self) {
        self.stop();
        let Some(session) = self.session.take() else {
            return;
        };
        debug!("Unloading {} (load {})", session.path.display(), session.load);
        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        if let Some(audio) = session.audio {
            audio.addr().send(AudioMsg::Command(ControlCommand::Close));
            audio.shutdown(timeout);
        }
        if !session.cache.shutdown(timeout) {
            warn!("Frame cache did not stop within {:?}", timeout);
        }
        if !session.fetcher.shutdown(timeout) {
            warn!("Fetcher did not stop within {:?}", timeout);
        }
        for spares in self.spares_in.try_iter() {
            self.spares.extend(spares);
        }
    }

    // ------------------------------------------------------------- playback

    fn start(&mut self) {
        if self.session.is_none() {
            warn!("Start ignored: nothing loaded");
            return;
        }
        let Some(info) = self.info().cloned() else {
            debug!("Start deferred until media info arrives");
            self.start_pending = true;
            return;
        };
        if self.state != PlaybackState::Stopped {
            return;
        }

        let mut seq = self.seq_at_timer(&info);
        if !self.reverse()
            && let Some(count) = info.frame_count()
            && seq >= count
        {
            debug!("At end of media, restarting from the beginning");
            seq = 0;
            self.timer.set_position(0.0);
        }

        self.next_epoch();
        self.open_window(seq);
        self.starting_timer_pos = self.timer.position_ms();
        self.preparing_since = Some(Instant::now());
        self.set_state(PlaybackState::Preparing);
        self.send_audio(AudioMsg::Command(ControlCommand::Start));
        self.timer.start();
    }

    fn stop(&mut self) {
        if self.state == PlaybackState::Stopped {
            return;
        }
        self.timer.stop();
        self.next_epoch();
        self.send_audio(AudioMsg::Command(ControlCommand::Stop));
        self.send_audio(AudioMsg::Command(ControlCommand::Flush));
        self.queue.clear();
        self.expected = None;
        self.next_request = None;
        self.preparing_since = None;
        self.set_state(PlaybackState::Stopped);
    }

    /// Sequence the clock currently points at, in playback direction
    fn seq_at_timer(&self, info: &MediaInfo) -> u64 {
        let position = self.timer.position_ms();
        let seq = if self.reverse() {
            info.seq_at(position)
        } else {
            info.seq_at_or_after(position)
        };
        self.clamp_seq(info, seq)
    }

    fn clamp_seq(&self, info: &MediaInfo, seq: u64) -> u64 {
        match info.frame_count() {
            Some(count) if !self.reverse() => seq.min(count),
            Some(count) => seq.min(count.saturating_sub(1)),
            None => seq,
        }
    }

    /// Start a new epoch; the cache forgets requests from older ones
    fn next_epoch(&mut self) {
        self.epoch += 1;
        if let Some(session) = &self.session {
            session.cache.addr().send(CacheMsg::Supersede(self.epoch));
        }
    }

    fn step(&self, seq: u64) -> Option<u64> {
        if self.reverse() { seq.checked_sub(1) } else { Some(seq + 1) }
    }

    /// Drop queued frames and request `PREFETCH_SIZE` frames from `seq`
    fn open_window(&mut self, seq: u64) {
        trace!("Window at {} (epoch {})", seq, self.epoch);
        self.queue.clear();
        self.expected = Some(seq);
        self.next_request = Some(seq);
        for _ in 0..self.config.prefetch_size {
            if !self.request_next(false) {
                break;
            }
        }
        self.last_progress = Instant::now();
    }

    fn frame_request(&self, seq: u64, usage: u32, opportunistic: bool) -> Option<FrameRequest> {
        let load = self.load_id()?;
        Some(FrameRequest {
            seq,
            usage,
            opportunistic,
            epoch: self.epoch,
            reply: self.own.recipient(move |frame| ControllerMsg::Frame { load, frame }),
        })
    }

    fn send_request(&self, request: FrameRequest) {
        if let Some(session) = &self.session {
            session.cache.addr().send(CacheMsg::Request(request));
        }
    }

    /// Request the next frame of the window; false before the first frame.
    ///
    /// Past the end the fetcher answers with end-of-media frames, which is
    /// what stops playback, so forward requests are not bounded here.
    fn request_next(&mut self, opportunistic: bool) -> bool {
        let Some(seq) = self.next_request else {
            return false;
        };
        let Some(request) = self.frame_request(seq, self.config.usage_count, opportunistic) else {
            return false;
        };
        self.send_request(request);
        self.next_request = self.step(seq);
        true
    }

    fn set_position(&mut self, position_ms: u64) {
        let Some(info) = self.info().cloned() else {
            self.pending_position = Some(position_ms);
            return;
        };
        let position_ms = match info.duration_ms {
            Some(duration) => position_ms.min(duration),
            None => position_ms,
        };
        self.next_epoch();
        let seq = self.clamp_seq(&info, info.seq_at_or_after(position_ms as f64));
        debug!("Seek to {}ms (frame {}) while {:?}", position_ms, seq, self.state);

        match self.state {
            PlaybackState::Stopped => {
                self.timer.set_position(position_ms as f64);
                // Warm the cache and show the frame; usage held by the renderer only
                if let Some(request) = self.frame_request(seq, 1, true) {
                    self.send_request(request);
                }
            }
            PlaybackState::Preparing | PlaybackState::Playing => {
                self.send_audio(AudioMsg::Command(ControlCommand::Flush));
                self.timer.set_position(position_ms as f64);
                self.starting_timer_pos = position_ms as f64;
                self.open_window(seq);
            }
        }
    }

    fn set_speed(&mut self, speed: f64) {
        if !speed.is_finite() {
            warn!("Ignoring speed {}", speed);
            return;
        }
        let min = self.config.min_speed;
        let speed = if speed.abs() < min {
            if speed < 0.0 { -min } else { min }
        } else {
            speed
        };
        let flipped = (speed < 0.0) != self.reverse();
        debug!("Speed {} -> {}", self.speed, speed);

        self.speed = speed;
        self.timer.set_speed(speed);
        self.send_audio(AudioMsg::SetSpeed(speed));

        if flipped
            && self.state != PlaybackState::Stopped
            && let Some(info) = self.info().cloned()
        {
            let seq = self.seq_at_timer(&info);
            self.next_epoch();
            self.send_audio(AudioMsg::Command(ControlCommand::Flush));
            self.open_window(seq);
        }
    }

    // ------------------------------------------------------------ replies

    fn on_frame(&mut self, load: u64, mut frame: CachedFrame) {
        if self.load_id() != Some(load) || frame.epoch != self.epoch {
            trace!("Stale frame {} (epoch {}) recycled", frame.seq, frame.epoch);
            return;
        }

        match self.state {
            PlaybackState::Stopped => {
                self.events.send(PlayerEvent::Position {
                    seq: frame.seq,
                    timestamp_ms: frame.frame().timestamp_ms,
                });
                self.video.send(VideoMsg::Frame(frame));
            }
            PlaybackState::Preparing | PlaybackState::Playing => {
                if Some(frame.seq) != self.expected {
                    trace!("Unexpected frame {} (want {:?}) recycled", frame.seq, self.expected);
                    return;
                }
                self.expected = self.step(frame.seq);
                self.send_audio(AudioMsg::Frame(frame.share()));
                self.queue.push_back(frame);
                self.last_progress = Instant::now();
            }
        }
    }

    pub fn on_audio_sync(&mut self, load: u64, event: AudioSyncEvent) {
        if self.load_id() != Some(load) {
            return;
        }
        match event {
            AudioSyncEvent::Start if self.state == PlaybackState::Preparing => {
                let position = self.starting_timer_pos + self.config.sync_offset_ms as f64;
                debug!("Audio started, clock anchored at {:.1}ms", position);
                self.timer.set_position(position);
                self.timer.start();
                self.preparing_since = None;
                self.set_state(PlaybackState::Playing);
            }
            AudioSyncEvent::Start => trace!("Audio start while {:?}", self.state),
            AudioSyncEvent::Stop => debug!("Audio line stopped"),
        }
    }

    fn on_error(&mut self, load: u64, report: ErrorReport) {
        if self.load_id() != Some(load) {
            debug!("Error from stale load {} ({}): {}", load, report.actor, report.error);
            return;
        }
        if !report.error.is_fatal_for_load() {
            warn!("{}: {} (continuing without audio)", report.actor, report.error);
            self.events.send(PlayerEvent::Error(report.error));
            return;
        }
        error!("{}: {}", report.actor, report.error);
        self.unload();
        self.events.send(PlayerEvent::Error(report.error));
    }

    // ---------------------------------------------------------------- ticks

    fn tick(&mut self) {
        match self.state {
            PlaybackState::Stopped => {}
            PlaybackState::Preparing => {
                let timeout = Duration::from_millis(self.config.prepare_timeout_ms);
                if self.preparing_since.is_some_and(|since| since.elapsed() >= timeout) {
                    warn!("Audio did not start within {:?}, playing unsynchronised", timeout);
                    self.preparing_since = None;
                    self.set_state(PlaybackState::Playing);
                }
            }
            PlaybackState::Playing => self.render_tick(),
        }
    }

    fn render_tick(&mut self) {
        let Some(info) = self.info().cloned() else {
            return;
        };
        let due = info.seq_at(self.timer.position_ms());
        let reverse = self.reverse();

        let mut shown: Option<CachedFrame> = None;
        while let Some(head) = self.queue.front() {
            let is_due = if reverse { head.seq >= due } else { head.seq <= due };
            if !is_due {
                break;
            }
            if let Some(skipped) = shown.take() {
                trace!("Skipping late frame {}", skipped.seq);
            }
            shown = self.queue.pop_front();
            if shown.as_ref().is_some_and(|f| f.frame().end_of_media) {
                break;
            }
            self.request_next(true);
        }

        if let Some(frame) = shown {
            let seq = frame.seq;
            let end_of_media = frame.frame().end_of_media;
            self.events.send(PlayerEvent::Position {
                seq,
                timestamp_ms: frame.frame().timestamp_ms,
            });
            self.video.send(VideoMsg::Frame(frame));
            self.last_progress = Instant::now();
            if end_of_media {
                info!("End of media at frame {}", seq);
                self.stop();
                self.events.send(PlayerEvent::EndOfMedia);
            }
            return;
        }

        if !self.queue.is_empty() {
            return;
        }
        match self.expected {
            None => {
                info!("Reached the first frame");
                self.stop();
                self.events.send(PlayerEvent::EndOfMedia);
            }
            Some(seq) => {
                let stall = Duration::from_millis(self.config.stall_timeout_ms);
                if self.last_progress.elapsed() >= stall {
                    warn!("Playback stalled waiting for frame {}, refetching", seq);
                    self.next_epoch();
                    self.open_window(seq);
                }
            }
        }
    }
}

impl Actor for Controller {
    type Msg = ControllerMsg;

    fn handle(&mut self, msg: ControllerMsg, _ctx: &mut Context<ControllerMsg>) -> Result<()> {
        match msg {
            ControllerMsg::NewVideo { path, position_ms } => self.load(path, position_ms)?,
            ControllerMsg::Command(command) => match command {
                ControlCommand::Start => self.start(),
                ControlCommand::Stop => self.stop(),
                ControlCommand::Flush => {
                    if let Some(info) = self.info().cloned()
                        && self.state != PlaybackState::Stopped
                    {
                        let seq = self.expected.unwrap_or_else(|| self.seq_at_timer(&info));
                        self.next_epoch();
                        self.send_audio(AudioMsg::Command(ControlCommand::Flush));
                        self.open_window(seq);
                    }
                }
                ControlCommand::Close => self.unload(),
            },
            ControllerMsg::SetPosition(ms) => self.set_position(ms),
            ControllerMsg::SetSpeed(speed) => self.set_speed(speed),
            ControllerMsg::MediaInfo { load, info } => self.on_media_info(load, info)?,
            ControllerMsg::Frame { load, frame } => self.on_frame(load, frame),
            ControllerMsg::AudioSync { load, event } => self.on_audio_sync(load, event),
            ControllerMsg::Error { load, report } => self.on_error(load, report),
        }
        Ok(())
    }

    fn idle_timeout(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.config.controller_tick_ms))
    }

    fn idle(&mut self, _ctx: &mut Context<ControllerMsg>) -> Result<()> {
        self.tick();
        Ok(())
    }

    fn stopped(&mut self) {
        self.unload();
        debug!("Controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::actor::{Mailbox, mailbox};
    use crate::entities::{AudioFormat, AudioLine, VideoFormat};
    use crate::testing::{MockDecoder, MockLine, decoder_factory, mock_decoder_factory};

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        controller: Controller,
        own: Mailbox<ControllerMsg>,
        video: Mailbox<VideoMsg>,
        events: Receiver<PlayerEvent>,
        /// Events collected by `run_until`
        seen: Vec<PlayerEvent>,
    }

    impl Harness {
        /// Deliver what the session's actors sent; frames sent to video are
        /// dropped as a renderer would recycle them
        fn pump(&mut self) {
            for msg in self.own.drain() {
                match msg {
                    ControllerMsg::MediaInfo { load, info } => {
                        self.controller.on_media_info(load, info).expect("media info")
                    }
                    ControllerMsg::Frame { load, frame } => self.controller.on_frame(load, frame),
                    ControllerMsg::AudioSync { load, event } => self.controller.on_audio_sync(load, event),
                    ControllerMsg::Error { load, report } => self.controller.on_error(load, report),
                    _ => {}
                }
            }
            drop(self.video.drain());
            self.seen.extend(self.events.try_iter());
        }

        fn run_until(
            &mut self,
            timeout: Duration,
            tick: bool,
            mut done: impl FnMut(&Controller, &[PlayerEvent]) -> bool,
        ) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                self.pump();
                if tick {
                    self.controller.tick();
                }
                if done(&self.controller, &self.seen) {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            false
        }

        /// Load through the real fetcher and cache, then play
        fn load_and_play(&mut self) {
            self.controller.load(PathBuf::from("mock.mp4"), 0).expect("load");
            assert!(self.run_until(WAIT, false, |c, _| c.info().is_some()), "no media info");
            self.controller.start();
            assert!(self.run_until(WAIT, true, |c, _| c.state() == PlaybackState::Playing));
        }
    }

    fn shown_at(seen: &[PlayerEvent]) -> Option<u64> {
        seen.iter().find_map(|e| match e {
            PlayerEvent::Position { timestamp_ms, .. } => Some(*timestamp_ms),
            _ => None,
        })
    }

    fn info() -> MediaInfo {
        MediaInfo {
            audio: Some(AudioFormat { sample_rate: 48000, channels: 2, bits_per_sample: 16 }),
            video: VideoFormat { width: 64, height: 48 },
            frame_rate: 25.0,
            duration_ms: Some(4000),
        }
    }

    fn harness(config: EngineConfig) -> Harness {
        harness_with(config, Backend { decoders: mock_decoder_factory(100, 10), audio: None })
    }

    fn harness_with(config: EngineConfig, backend: Backend) -> Harness {
        let (own, own_box) = mailbox("stepframe-controller");
        let (video, video_box) = mailbox("stepframe-video");
        let (tx, events) = unbounded();
        let controller =
            Controller::new(config, backend, own, video, Recipient::from_sender("events", tx));
        Harness { controller, own: own_box, video: video_box, events, seen: Vec::new() }
    }

    /// Loaded with `info()` and playing, without waiting for any actor
    fn playing(h: &mut Harness) -> u64 {
        h.controller.load(PathBuf::from("mock.mp4"), 0).expect("load");
        let load = h.controller.load_id().expect("session");
        if let Some(session) = h.controller.session.as_mut() {
            session.info = Some(info());
        }
        h.controller.start();
        h.controller.on_audio_sync(load, AudioSyncEvent::Start);
        assert_eq!(h.controller.state(), PlaybackState::Playing);
        load
    }

    fn frame_at(seq: u64, epoch: u64) -> CachedFrame {
        let mut f = Frame::empty();
        f.seq = seq;
        f.timestamp_ms = seq * 40;
        CachedFrame::detached(seq, epoch, Arc::new(f))
    }

    #[test]
    fn test_audio_start_anchors_clock_and_plays() {
        let config = EngineConfig { sync_offset_ms: 120, ..Default::default() };
        let mut h = harness(config);
        h.controller.load(PathBuf::from("mock.mp4"), 0).expect("load");
        let load = h.controller.load_id().expect("session");
        if let Some(session) = h.controller.session.as_mut() {
            session.info = Some(info());
        }

        h.controller.set_position(1000);
        h.controller.start();
        assert_eq!(h.controller.state(), PlaybackState::Preparing);
        assert_eq!(h.controller.starting_timer_pos, 1000.0);

        h.controller.on_audio_sync(load, AudioSyncEvent::Start);
        assert_eq!(h.controller.state(), PlaybackState::Playing);
        let position = h.controller.timer.position_ms();
        assert!((1120.0..1170.0).contains(&position), "clock at {}", position);

        let events: Vec<_> = h.events.try_iter().collect();
        assert!(events.contains(&PlayerEvent::StateChanged(PlaybackState::Preparing)));
        assert!(events.contains(&PlayerEvent::StateChanged(PlaybackState::Playing)));
        h.controller.unload();
    }

    #[test]
    fn test_stale_and_unexpected_frames_are_dropped() {
        let mut h = harness(EngineConfig::default());
        h.controller.load(PathBuf::from("mock.mp4"), 0).expect("load");
        let load = h.controller.load_id().expect("session");
        if let Some(session) = h.controller.session.as_mut() {
            session.info = Some(info());
        }
        h.controller.start();
        let epoch = h.controller.epoch;

        let frame = |seq: u64, epoch: u64| {
            let mut f = Frame::empty();
            f.seq = seq;
            CachedFrame::detached(seq, epoch, Arc::new(f))
        };

        h.controller.on_frame(load, frame(0, epoch - 1));
        h.controller.on_frame(load + 1, frame(0, epoch));
        h.controller.on_frame(load, frame(1, epoch));
        assert!(h.controller.queue.is_empty());

        h.controller.on_frame(load, frame(0, epoch));
        h.controller.on_frame(load, frame(1, epoch));
        assert_eq!(h.controller.queue.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(h.controller.expected, Some(2));
        h.controller.unload();
    }

    #[test]
    fn test_stopped_frames_go_to_video() {
        let mut h = harness(EngineConfig::default());
        h.controller.load(PathBuf::from("mock.mp4"), 0).expect("load");
        let load = h.controller.load_id().expect("session");
        if let Some(session) = h.controller.session.as_mut() {
            session.info = Some(info());
        }
        h.controller.set_position(400);
        let epoch = h.controller.epoch;
        assert_eq!(h.controller.timer.position_ms(), 400.0);

        let mut f = Frame::empty();
        f.seq = 10;
        f.timestamp_ms = 400;
        h.controller.on_frame(load, CachedFrame::detached(10, epoch, Arc::new(f)));

        let sent = h.video.drain();
        assert!(matches!(sent.last(), Some(VideoMsg::Frame(frame)) if frame.seq == 10));
        assert!(h.events.try_iter().any(|e| e == PlayerEvent::Position { seq: 10, timestamp_ms: 400 }));
        h.controller.unload();
    }

    #[test]
    fn test_speed_is_clamped_and_flip_restarts_window() {
        let mut h = harness(EngineConfig::default());
        h.controller.load(PathBuf::from("mock.mp4"), 0).expect("load");
        if let Some(session) = h.controller.session.as_mut() {
            session.info = Some(info());
        }
        h.controller.set_speed(0.1);
        assert_eq!(h.controller.speed, 0.25);

        h.controller.set_speed(1.0);
        h.controller.set_position(2000);
        h.controller.start();
        let epoch = h.controller.epoch;
        h.controller.set_speed(-1.0);
        assert!(h.controller.epoch > epoch);
        assert_eq!(h.controller.expected, Some(50));
        assert_eq!(h.controller.next_request, Some(50 - 30));
        h.controller.unload();
    }

    #[test]
    fn test_seek_while_playing_flushes_and_reopens_window() {
        let line = MockLine::unbounded();
        let audio_line = line.clone();
        let audio: Arc<dyn AudioLineFactory> =
            Arc::new(move || -> Result<Box<dyn AudioLine>> { Ok(Box::new(audio_line.clone())) });
        let backend = Backend { decoders: mock_decoder_factory(100, 10), audio: Some(audio) };
        let mut h = harness_with(EngineConfig::default(), backend);
        h.load_and_play();
        assert!(h.run_until(WAIT, true, |_, seen| shown_at(seen).is_some()));
        let flushes = line.flushes();
        h.seen.clear();

        h.controller.set_position(2010);
        assert_eq!(h.controller.state(), PlaybackState::Playing);
        assert!(h.controller.queue.is_empty());
        assert_eq!(h.controller.expected, Some(51));
        assert_eq!(h.controller.next_request, Some(51 + 30));

        // first frame accepted into the new window
        assert!(h.run_until(WAIT, false, |c, _| !c.queue.is_empty()));
        let head = &h.controller.queue[0];
        assert_eq!(head.seq, 51);
        assert!((2010..2050).contains(&head.frame().timestamp_ms));

        assert!(h.run_until(WAIT, true, |_, seen| shown_at(seen).is_some()));
        let first = shown_at(&h.seen);
        assert!(first.is_some_and(|ts| ts >= 2010), "shown {:?} after seeking to 2010", first);
        assert!(h.run_until(WAIT, false, |_, _| line.flushes() > flushes), "audio not flushed");
        h.controller.unload();
    }

    #[test]
    fn test_repeated_seeks_while_playing_keep_the_load() {
        let decoders = decoder_factory(|| {
            let mut decoder = MockDecoder::new(10_000, 10);
            decoder.frame_delay = Duration::from_millis(3);
            decoder
        });
        let mut h = harness_with(EngineConfig::default(), Backend { decoders, audio: None });
        h.load_and_play();
        h.seen.clear();

        for i in 1..=8u64 {
            h.controller.set_position(i * 20_000);
        }
        let landed = h.run_until(Duration::from_secs(10), true, |_, seen| {
            shown_at(seen).is_some_and(|ts| ts >= 160_000)
                || seen.iter().any(|e| matches!(e, PlayerEvent::Error(_)))
        });
        let errors: Vec<_> = h.seen.iter().filter(|e| matches!(e, PlayerEvent::Error(_))).collect();
        assert!(errors.is_empty(), "{:?}", errors);
        assert!(landed);
        assert!(h.controller.session.is_some());
        assert_eq!(h.controller.state(), PlaybackState::Playing);
        h.controller.unload();
    }

    #[test]
    fn test_render_tick_skips_overdue_frames_and_refills() {
        let mut h = harness(EngineConfig::default());
        let load = playing(&mut h);
        let epoch = h.controller.epoch;
        for seq in 0..4 {
            h.controller.on_frame(load, frame_at(seq, epoch));
        }
        assert_eq!(h.controller.next_request, Some(30));
        drop(h.video.drain());
        h.events.try_iter().for_each(drop);

        // frames 0 and 1 are late, 2 is due, 3 is not
        h.controller.timer.set_position(100.0);
        h.controller.render_tick();

        let shown: Vec<u64> = h
            .video
            .drain()
            .into_iter()
            .filter_map(|msg| match msg {
                VideoMsg::Frame(frame) => Some(frame.seq),
                _ => None,
            })
            .collect();
        assert_eq!(shown, vec![2]);
        assert_eq!(h.controller.queue.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![3]);
        // one opportunistic request per frame taken off the queue
        assert_eq!(h.controller.next_request, Some(33));
        let events: Vec<_> = h.events.try_iter().collect();
        assert_eq!(events, vec![PlayerEvent::Position { seq: 2, timestamp_ms: 80 }]);
        h.controller.unload();
    }

    #[test]
    fn test_stall_refetches_expected_frame() {
        let config = EngineConfig { stall_timeout_ms: 50, ..Default::default() };
        let mut h = harness(config);
        playing(&mut h);
        let epoch = h.controller.epoch;

        h.controller.render_tick();
        assert_eq!(h.controller.epoch, epoch, "not stalled yet");

        h.controller.last_progress = Instant::now() - Duration::from_millis(60);
        h.controller.render_tick();
        assert!(h.controller.epoch > epoch);
        assert_eq!(h.controller.expected, Some(0));
        assert_eq!(h.controller.next_request, Some(30));
        assert!(h.controller.last_progress.elapsed() < Duration::from_millis(50));
        assert_eq!(h.controller.state(), PlaybackState::Playing);
        h.controller.unload();
    }

    #[test]
    fn test_preparing_timeout_plays_unsynchronised() {
        let config = EngineConfig { prepare_timeout_ms: 30, ..Default::default() };
        let mut h = harness(config);
        h.controller.load(PathBuf::from("mock.mp4"), 0).expect("load");
        let load = h.controller.load_id().expect("session");
        if let Some(session) = h.controller.session.as_mut() {
            session.info = Some(info());
        }
        h.controller.start();
        h.controller.tick();
        assert_eq!(h.controller.state(), PlaybackState::Preparing);

        h.controller.preparing_since = Some(Instant::now() - Duration::from_millis(40));
        h.controller.tick();
        assert_eq!(h.controller.state(), PlaybackState::Playing);
        assert!(h.controller.timer.is_running());
        let events: Vec<_> = h.events.try_iter().collect();
        assert!(events.contains(&PlayerEvent::StateChanged(PlaybackState::Playing)));

        // a late line start no longer moves the clock
        let before = h.controller.timer.position_ms();
        h.controller.on_audio_sync(load, AudioSyncEvent::Start);
        assert!(h.controller.timer.position_ms() - before < 20.0);
        h.controller.unload();
    }
}
