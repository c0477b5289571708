//! AudioRenderer actor - feeds accepted frames to the audio line
//!
//! Frames queue in arrival order. Every tick writes as many whole
//! sample-frames as the line accepts from the head frame, speed-scaled into
//! a scratch buffer; a fully written frame is recycled.
//!
//! The line's own start event is what the Controller anchors its clock to,
//! so it is relayed as [`AudioSyncEvent::Start`]. Without a line (silent
//! media, failed device) `Start` is acknowledged at once and frames are
//! recycled on arrival.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};

use super::actor::{Actor, Context, Recipient};
use super::frame_cache::CachedFrame;
use crate::entities::{AudioFormat, AudioLine, AudioLineFactory, LineEvent, LineListener};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    /// Discard queued frames and the line's buffer
    Flush,
    Close,
}

/// Line state relayed to the Controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSyncEvent {
    Start,
    Stop,
}

pub enum AudioMsg {
    Frame(CachedFrame),
    Command(ControlCommand),
    SetSpeed(f64),
    Line(LineEvent),
}

/// Nearest-neighbour speed scaling of interleaved PCM.
///
/// Produces `round(n / |speed|)` sample-frames; negative speed reverses
/// their order. Only whole sample-frames of `input` are used.
pub fn resample_into(input: &[u8], frame_bytes: usize, speed: f64, out: &mut Vec<u8>) {
    out.clear();
    if frame_bytes == 0 || speed == 0.0 || !speed.is_finite() {
        return;
    }
    let n = input.len() / frame_bytes;
    if n == 0 {
        return;
    }

    let rate = speed.abs();
    let frames_out = (n as f64 / rate).round() as usize;
    for i in 0..frames_out {
        let src = ((i as f64 * rate) as usize).min(n - 1);
        let src = if speed < 0.0 { n - 1 - src } else { src };
        out.extend_from_slice(&input[src * frame_bytes..(src + 1) * frame_bytes]);
    }
}

pub struct AudioRenderer {
    format: Option<AudioFormat>,
    factory: Option<Arc<dyn AudioLineFactory>>,
    line: Option<Box<dyn AudioLine>>,
    sync: Recipient<AudioSyncEvent>,
    queue: VecDeque<CachedFrame>,
    /// Speed-scaled audio of the head frame
    scratch: Vec<u8>,
    /// Bytes of `scratch` already written
    written: usize,
    head_scaled: bool,
    speed: f64,
    playing: bool,
    tick: Duration,
}

impl AudioRenderer {
    /// `scratch_capacity` should cover one frame at the slowest speed
    pub fn new(
        format: Option<AudioFormat>,
        factory: Option<Arc<dyn AudioLineFactory>>,
        sync: Recipient<AudioSyncEvent>,
        scratch_capacity: usize,
        tick: Duration,
    ) -> Self {
        Self {
            format,
            factory,
            line: None,
            sync,
            queue: VecDeque::new(),
            scratch: Vec::with_capacity(scratch_capacity),
            written: 0,
            head_scaled: false,
            speed: 1.0,
            playing: false,
            tick,
        }
    }

    pub fn has_line(&self) -> bool {
        self.line.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Open the line. Failures leave the renderer silent.
    pub fn open_line(&mut self, listener: LineListener) -> Result<()> {
        let (Some(format), Some(factory)) = (self.format, self.factory.as_ref()) else {
            debug!("AudioRenderer running silent (no audio stream or output)");
            return Ok(());
        };
        let mut line = factory.create()?;
        line.open(format, listener)?;
        info!(
            "Audio line open: {} Hz, {} ch, {} bit",
            format.sample_rate, format.channels, format.bits_per_sample
        );
        self.line = Some(line);
        Ok(())
    }

    fn drop_line(&mut self, error: EngineError) -> EngineError {
        warn!("Audio line disabled: {}", error);
        if let Some(mut line) = self.line.take() {
            line.close();
        }
        self.clear_queue();
        error
    }

    fn clear_queue(&mut self) {
        self.queue.clear();
        self.scratch.clear();
        self.written = 0;
        self.head_scaled = false;
    }

    pub fn command(&mut self, command: ControlCommand) -> Result<()> {
        trace!("Audio command {:?}", command);
        match command {
            ControlCommand::Start => {
                self.playing = true;
                match self.line.as_mut() {
                    Some(line) => {
                        if let Err(e) = line.start() {
                            self.sync.send(AudioSyncEvent::Start);
                            return Err(self.drop_line(e));
                        }
                        self.pump();
                    }
                    None => {
                        self.sync.send(AudioSyncEvent::Start);
                    }
                }
            }
            ControlCommand::Stop => {
                self.playing = false;
                if let Some(line) = self.line.as_mut()
                    && let Err(e) = line.stop()
                {
                    return Err(self.drop_line(e));
                }
            }
            ControlCommand::Flush => {
                self.clear_queue();
                if let Some(line) = self.line.as_mut() {
                    line.flush();
                }
            }
            ControlCommand::Close => {
                self.playing = false;
                self.clear_queue();
                if let Some(mut line) = self.line.take() {
                    line.close();
                }
            }
        }
        Ok(())
    }

    pub fn accept(&mut self, frame: CachedFrame) {
        if self.line.is_none() {
            frame.recycle();
            return;
        }
        self.queue.push_back(frame);
    }

    pub fn set_speed(&mut self, speed: f64) {
        // Applies from the next frame on
        self.speed = speed;
    }

    /// Write as much as the line accepts
    pub fn pump(&mut self) {
        let Some(frame_bytes) = self.format.map(|f| f.frame_bytes()) else {
            return;
        };
        let Some(line) = self.line.as_mut() else {
            return;
        };
        if !self.playing || frame_bytes == 0 {
            return;
        }

        while let Some(head) = self.queue.front() {
            if !self.head_scaled {
                resample_into(&head.frame().audio, frame_bytes, self.speed, &mut self.scratch);
                self.written = 0;
                self.head_scaled = true;
            }

            if self.written < self.scratch.len() {
                let available = line.available();
                let available = available - available % frame_bytes;
                if available == 0 {
                    break;
                }
                let end = self.written + available.min(self.scratch.len() - self.written);
                let taken = line.write(&self.scratch[self.written..end]);
                self.written += taken - taken % frame_bytes;
                if self.written < self.scratch.len() {
                    break;
                }
            }

            if let Some(done) = self.queue.pop_front() {
                trace!("Audio frame {} written", done.seq);
                done.recycle();
            }
            self.head_scaled = false;
        }
    }

    fn on_line_event(&mut self, event: LineEvent) {
        debug!("Audio line event {:?}", event);
        let relayed = match event {
            LineEvent::Start => AudioSyncEvent::Start,
            LineEvent::Stop => AudioSyncEvent::Stop,
        };
        self.sync.send(relayed);
    }
}

impl Actor for AudioRenderer {
    type Msg = AudioMsg;

    fn started(&mut self, ctx: &mut Context<AudioMsg>) {
        let addr = ctx.addr().clone();
        let listener: LineListener = Arc::new(move |event| {
            addr.send(AudioMsg::Line(event));
        });
        if let Err(e) = self.open_line(listener) {
            self.line = None;
            ctx.report(match e {
                EngineError::Device(_) => e,
                other => EngineError::Device(other.to_string()),
            });
        }
    }

    fn handle(&mut self, msg: AudioMsg, _ctx: &mut Context<AudioMsg>) -> Result<()> {
        match msg {
            AudioMsg::Frame(frame) => {
                self.accept(frame);
                Ok(())
            }
            AudioMsg::Command(command) => self.command(command),
            AudioMsg::SetSpeed(speed) => {
                self.set_speed(speed);
                Ok(())
            }
            AudioMsg::Line(event) => {
                self.on_line_event(event);
                Ok(())
            }
        }
    }

    fn idle_timeout(&self) -> Option<Duration> {
        Some(self.tick)
    }

    fn idle(&mut self, _ctx: &mut Context<AudioMsg>) -> Result<()> {
        self.pump();
        Ok(())
    }

    fn stopped(&mut self) {
        self.clear_queue();
        if let Some(mut line) = self.line.take() {
            line.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLine;
    use crossbeam_channel::unbounded;

    const STEREO_16: AudioFormat = AudioFormat { sample_rate: 48000, channels: 2, bits_per_sample: 16 };

    fn pcm(frames: u8) -> Vec<u8> {
        (0..frames).flat_map(|i| [i, i, i, i]).collect()
    }

    #[test]
    fn test_reverse_speed_reverses_sample_frames() {
        let input = pcm(6);
        let mut out = Vec::new();
        resample_into(&input, 4, -1.0, &mut out);
        assert_eq!(out.len(), input.len());
        let order: Vec<u8> = out.chunks(4).map(|c| c[0]).collect();
        assert_eq!(order, vec![5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_speed_scaling_lengths() {
        let input = pcm(8);
        let mut out = Vec::new();
        resample_into(&input, 4, 2.0, &mut out);
        assert_eq!(out.chunks(4).map(|c| c[0]).collect::<Vec<_>>(), vec![0, 2, 4, 6]);

        resample_into(&input, 4, 0.5, &mut out);
        assert_eq!(out.len(), 16 * 4);
        assert_eq!(&out[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1]);

        resample_into(&input, 4, 1.0, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn test_partial_trailing_bytes_ignored() {
        let mut input = pcm(3);
        input.push(9);
        let mut out = Vec::new();
        resample_into(&input, 4, 1.0, &mut out);
        assert_eq!(out.len(), 12);
    }

    fn renderer_with_line(line: MockLine) -> (AudioRenderer, crossbeam_channel::Receiver<AudioSyncEvent>) {
        let (tx, rx) = unbounded();
        let factory: Arc<dyn AudioLineFactory> = Arc::new(move || -> Result<Box<dyn AudioLine>> {
            Ok(Box::new(line.clone()))
        });
        let mut renderer = AudioRenderer::new(
            Some(STEREO_16),
            Some(factory),
            Recipient::from_sender("controller", tx),
            4096,
            Duration::from_millis(5),
        );
        renderer.open_line(Arc::new(|_: LineEvent| {})).expect("open");
        (renderer, rx)
    }

    fn frame_with_audio(seq: u64, bytes: Vec<u8>) -> CachedFrame {
        let mut frame = crate::entities::Frame::empty();
        frame.seq = seq;
        frame.audio = bytes;
        CachedFrame::detached(seq, 0, Arc::new(frame))
    }

    #[test]
    fn test_pump_writes_whole_sample_frames_only() {
        let line = MockLine::new(10);
        let (mut renderer, _sync) = renderer_with_line(line.clone());
        renderer.command(ControlCommand::Start).expect("start");
        renderer.accept(frame_with_audio(0, pcm(4)));

        renderer.pump();
        // 10 bytes available -> two sample-frames
        assert_eq!(line.written().len(), 8);
        assert_eq!(renderer.queued(), 1);

        line.set_capacity(64);
        renderer.pump();
        assert_eq!(line.written(), pcm(4));
        assert_eq!(renderer.queued(), 0);
    }

    #[test]
    fn test_flush_discards_queue() {
        let line = MockLine::new(0);
        let (mut renderer, _sync) = renderer_with_line(line.clone());
        renderer.accept(frame_with_audio(0, pcm(4)));
        renderer.accept(frame_with_audio(1, pcm(4)));
        renderer.command(ControlCommand::Flush).expect("flush");
        assert_eq!(renderer.queued(), 0);
        assert_eq!(line.flushes(), 1);
    }

    #[test]
    fn test_start_without_line_acknowledges_immediately() {
        let (tx, rx) = unbounded();
        let mut renderer = AudioRenderer::new(
            None,
            None,
            Recipient::from_sender("controller", tx),
            0,
            Duration::from_millis(5),
        );
        renderer.open_line(Arc::new(|_: LineEvent| {})).expect("silent open");
        renderer.command(ControlCommand::Start).expect("start");
        assert_eq!(rx.try_recv(), Ok(AudioSyncEvent::Start));

        renderer.accept(frame_with_audio(0, pcm(2)));
        assert_eq!(renderer.queued(), 0);
    }

    #[test]
    fn test_failed_device_start_goes_silent() {
        let line = MockLine::new(64);
        line.fail_start();
        let (mut renderer, sync) = renderer_with_line(line);
        let err = renderer.command(ControlCommand::Start).expect_err("device error");
        assert!(matches!(err, EngineError::Device(_)));
        assert!(!renderer.has_line());
        assert_eq!(sync.try_recv(), Ok(AudioSyncEvent::Start));
    }
}
