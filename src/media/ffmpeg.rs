//! FFmpeg decoder - RGBA pictures and 16-bit stereo PCM per frame
//!
//! Demuxes video and audio in one pass. Video frames are scaled to RGBA at
//! native size; audio is resampled to `OUTPUT_AUDIO` and sliced so each video
//! frame carries the samples of its own display interval.
//!
//! Times are measured from the video stream's first timestamp, so media
//! whose pts start above zero still begins at frame 0.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Once;

use log::{debug, trace, warn};
use playa_ffmpeg as ffmpeg;

use crate::entities::{AudioFormat, Decoder, Frame, MediaInfo, VideoFormat};
use crate::error::{EngineError, Result};

/// PCM layout handed to the audio line
pub const OUTPUT_AUDIO: AudioFormat =
    AudioFormat { sample_rate: 48000, channels: 2, bits_per_sample: 16 };

static FFMPEG_INIT: Once = Once::new();

fn init_ffmpeg() {
    FFMPEG_INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            warn!("FFmpeg init failed: {}", e);
        }
        unsafe {
            // Silence FFmpeg's own stderr logging
            ffmpeg::ffi::av_log_set_level(ffmpeg::ffi::AV_LOG_QUIET);
        }
    });
}

/// Samples belonging to frame `seq`; sums exactly over consecutive frames
pub fn samples_for_frame(seq: u64, sample_rate: u32, fps: f64) -> usize {
    let edge = |s: u64| (s as f64 * sample_rate as f64 / fps).round() as u64;
    (edge(seq + 1) - edge(seq)) as usize
}

/// Leading bytes to drop from an audio chunk starting at `start_ms` so
/// playback begins at `from_ms`; whole chunk when it ends before.
fn leading_skip_bytes(start_ms: f64, from_ms: f64, format: &AudioFormat) -> usize {
    if start_ms >= from_ms {
        return 0;
    }
    let samples = ((from_ms - start_ms) * format.sample_rate as f64 / 1000.0).round() as usize;
    samples * format.frame_bytes()
}

/// Stream start in ms; an unknown start (`AV_NOPTS_VALUE`) counts as zero
fn start_ms(start_time: i64, time_base: f64) -> f64 {
    if start_time == i64::MIN {
        return 0.0;
    }
    start_time as f64 * time_base * 1000.0
}

/// Media time of `pts` relative to the start of the video stream
fn pts_ms(pts: i64, time_base: f64, origin_ms: f64) -> f64 {
    pts as f64 * time_base * 1000.0 - origin_ms
}

struct AudioStream {
    index: usize,
    decoder: ffmpeg::decoder::Audio,
    resampler: ffmpeg::software::resampling::Context,
    time_base: f64,
}

struct Opened {
    input: ffmpeg::format::context::Input,
    video_index: usize,
    video: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    video_time_base: f64,
    /// Start of the video stream on the container timeline
    origin_ms: f64,
    audio: Option<AudioStream>,
    info: MediaInfo,

    /// Decoded pictures not yet handed out
    pictures: VecDeque<ffmpeg::util::frame::video::Video>,
    /// Resampled PCM not yet handed out
    pcm: VecDeque<u8>,
    /// Audio before this position (after a seek) is dropped
    audio_from_ms: f64,
    /// Sequence of the next picture handed out
    next_seq: u64,
    input_done: bool,
}

#[derive(Default)]
pub struct FfmpegDecoder {
    opened: Option<Opened>,
}

impl FfmpegDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn opened(&mut self) -> Result<&mut Opened> {
        self.opened
            .as_mut()
            .ok_or_else(|| EngineError::Decode("Decoder not opened".to_string()))
    }
}

fn time_base_secs(rational: ffmpeg::Rational) -> f64 {
    if rational.denominator() == 0 {
        return 0.0;
    }
    rational.numerator() as f64 / rational.denominator() as f64
}

impl Opened {
    /// Read and decode one packet; false once the input is drained
    fn read_packet(&mut self) -> Result<bool> {
        if self.input_done {
            return Ok(false);
        }
        let next = self.input.packets().next().map(|(stream, packet)| (stream.index(), packet));
        match next {
            Some((index, packet)) if index == self.video_index => {
                if let Err(e) = self.video.send_packet(&packet) {
                    warn!("Video packet rejected: {}", e);
                }
                self.receive_pictures();
            }
            Some((index, packet)) => {
                if let Some(audio) = self.audio.as_mut()
                    && audio.index == index
                {
                    if let Err(e) = audio.decoder.send_packet(&packet) {
                        warn!("Audio packet rejected: {}", e);
                    }
                    self.receive_audio()?;
                }
            }
            None => {
                trace!("Input drained, flushing decoders");
                self.input_done = true;
                let _ = self.video.send_eof();
                self.receive_pictures();
                if let Some(audio) = self.audio.as_mut() {
                    let _ = audio.decoder.send_eof();
                    self.receive_audio()?;
                }
            }
        }
        Ok(true)
    }

    fn receive_pictures(&mut self) {
        let mut decoded = ffmpeg::util::frame::video::Video::empty();
        while self.video.receive_frame(&mut decoded).is_ok() {
            self.pictures.push_back(decoded);
            decoded = ffmpeg::util::frame::video::Video::empty();
        }
    }

    fn receive_audio(&mut self) -> Result<()> {
        let Some(audio) = self.audio.as_mut() else {
            return Ok(());
        };
        let Some(format) = self.info.audio else {
            return Ok(());
        };
        let mut decoded = ffmpeg::util::frame::audio::Audio::empty();
        while audio.decoder.receive_frame(&mut decoded).is_ok() {
            let mut resampled = ffmpeg::util::frame::audio::Audio::empty();
            audio
                .resampler
                .run(&decoded, &mut resampled)
                .map_err(|e| EngineError::Decode(format!("Resampling failed: {}", e)))?;

            let bytes = resampled.samples() * format.frame_bytes();
            let data = resampled.data(0);
            let data = &data[..bytes.min(data.len())];

            let skip = match decoded.timestamp().or(decoded.pts()) {
                Some(pts) => leading_skip_bytes(
                    pts_ms(pts, audio.time_base, self.origin_ms),
                    self.audio_from_ms,
                    &format,
                ),
                None => 0,
            };
            if skip < data.len() {
                self.pcm.extend(&data[skip..]);
            }
        }
        Ok(())
    }

    fn picture_ms(&self, picture: &ffmpeg::util::frame::video::Video) -> Option<f64> {
        picture
            .timestamp()
            .or(picture.pts())
            .map(|pts| pts_ms(pts, self.video_time_base, self.origin_ms))
    }

    /// Scale into `frame.picture`, dropping the row padding
    fn convert(&mut self, picture: &ffmpeg::util::frame::video::Video, frame: &mut Frame) -> Result<()> {
        let mut rgba = ffmpeg::util::frame::video::Video::empty();
        self.scaler
            .run(picture, &mut rgba)
            .map_err(|e| EngineError::Decode(format!("Failed to scale frame: {}", e)))?;

        let width = self.info.video.width;
        let height = self.info.video.height;
        let stride = rgba.stride(0);
        let row_bytes = width as usize * 4;
        let data = rgba.data(0);
        let pixels = frame.picture.prepare(width, height);
        for y in 0..height as usize {
            let src = y * stride;
            let dst = y * row_bytes;
            if let (Some(from), Some(to)) =
                (data.get(src..src + row_bytes), pixels.get_mut(dst..dst + row_bytes))
            {
                to.copy_from_slice(from);
            }
        }
        Ok(())
    }
}

impl Decoder for FfmpegDecoder {
    fn open(&mut self, path: &Path) -> Result<MediaInfo> {
        init_ffmpeg();
        self.close();

        let input = ffmpeg::format::input(&path)
            .map_err(|e| EngineError::Media(format!("Failed to open {}: {}", path.display(), e)))?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| EngineError::Media(format!("No video stream in {}", path.display())))?;
        let video_index = stream.index();
        let video_time_base = time_base_secs(stream.time_base());
        let origin_ms = start_ms(stream.start_time(), video_time_base);
        let fps_rational = stream.avg_frame_rate();
        let frame_rate = time_base_secs(fps_rational);

        let mut decoder_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| EngineError::Media(format!("Failed to create decoder context: {}", e)))?;
        // Multi-threaded frame decoding
        unsafe {
            (*decoder_ctx.as_mut_ptr()).thread_type = ffmpeg::ffi::FF_THREAD_FRAME;
            (*decoder_ctx.as_mut_ptr()).thread_count = 0;
        }
        let video = decoder_ctx
            .decoder()
            .video()
            .map_err(|e| EngineError::Media(format!("Failed to create video decoder: {}", e)))?;

        let width = video.width();
        let height = video.height();
        let scaler = ffmpeg::software::scaling::Context::get(
            video.format(),
            width,
            height,
            ffmpeg::format::Pixel::RGBA,
            width,
            height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| EngineError::Media(format!("Failed to create scaler: {}", e)))?;

        let audio = match input.streams().best(ffmpeg::media::Type::Audio) {
            Some(stream) => match open_audio(&stream) {
                Ok(audio) => Some(audio),
                Err(e) => {
                    warn!("{}: audio disabled ({})", path.display(), e);
                    None
                }
            },
            None => None,
        };

        let duration_ms = (input.duration() > 0).then(|| (input.duration() / 1000) as u64);
        let info = MediaInfo {
            audio: audio.as_ref().map(|_| OUTPUT_AUDIO),
            video: VideoFormat { width, height },
            frame_rate,
            duration_ms,
        };
        debug!(
            "Opened {}: {}x{} @ {:.3} fps, audio: {}, duration: {:?}ms",
            path.display(),
            width,
            height,
            frame_rate,
            info.audio.is_some(),
            duration_ms
        );

        self.opened = Some(Opened {
            input,
            video_index,
            video,
            scaler,
            video_time_base,
            origin_ms,
            audio,
            info: info.clone(),
            pictures: VecDeque::new(),
            pcm: VecDeque::new(),
            audio_from_ms: 0.0,
            next_seq: 0,
            input_done: false,
        });
        Ok(info)
    }

    fn seek(&mut self, ms: u64) -> Result<u64> {
        let opened = self.opened()?;
        // Container timestamps in AV_TIME_BASE (microseconds)
        let timestamp = ((ms as f64 + opened.origin_ms) * 1000.0) as i64;
        opened
            .input
            .seek(timestamp, ..timestamp)
            .map_err(|e| EngineError::Decode(format!("Seek to {}ms failed: {}", ms, e)))?;
        opened.video.flush();
        if let Some(audio) = opened.audio.as_mut() {
            audio.decoder.flush();
        }
        opened.pictures.clear();
        opened.pcm.clear();
        opened.input_done = false;

        // The first picture after the seek tells where we landed
        while opened.pictures.is_empty() {
            if !opened.read_packet()? {
                break;
            }
        }
        let achieved = opened
            .pictures
            .front()
            .and_then(|p| opened.picture_ms(p))
            .unwrap_or(ms as f64)
            .max(0.0);
        opened.audio_from_ms = achieved;
        opened.next_seq = opened.info.seq_nearest(achieved.round() as u64);
        trace!("Seek {}ms landed at {:.1}ms (frame {})", ms, achieved, opened.next_seq);
        Ok(achieved.round() as u64)
    }

    fn read_next_frame(&mut self, frame: &mut Frame) -> Result<bool> {
        let opened = self.opened()?;
        while opened.pictures.is_empty() {
            if !opened.read_packet()? {
                return Ok(false);
            }
        }
        let Some(picture) = opened.pictures.pop_front() else {
            return Ok(false);
        };
        opened.convert(&picture, frame)?;

        let seq = opened.next_seq;
        opened.next_seq += 1;
        if let Some(format) = opened.info.audio {
            let wanted =
                samples_for_frame(seq, format.sample_rate, opened.info.frame_rate) * format.frame_bytes();
            while opened.pcm.len() < wanted {
                if !opened.read_packet()? {
                    break;
                }
            }
            let take = wanted.min(opened.pcm.len());
            frame.audio.extend(opened.pcm.drain(..take));
        }
        Ok(true)
    }

    fn close(&mut self) {
        if self.opened.take().is_some() {
            debug!("Decoder closed");
        }
    }
}

fn open_audio(stream: &ffmpeg::format::stream::Stream) -> Result<AudioStream> {
    let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .map_err(|e| EngineError::Media(format!("Failed to create codec context: {}", e)))?;
    let decoder = context
        .decoder()
        .audio()
        .map_err(|e| EngineError::Media(format!("Failed to create audio decoder: {}", e)))?;
    let resampler = ffmpeg::software::resampling::Context::get(
        decoder.format(),
        decoder.channel_layout(),
        decoder.rate(),
        ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed),
        ffmpeg::ChannelLayout::STEREO,
        OUTPUT_AUDIO.sample_rate,
    )
    .map_err(|e| EngineError::Media(format!("Failed to create resampler: {}", e)))?;
    Ok(AudioStream {
        index: stream.index(),
        decoder,
        resampler,
        time_base: time_base_secs(stream.time_base()),
    })
}

/// Factory for the fetcher thread
pub fn new_ffmpeg_decoder() -> Box<dyn Decoder> {
    Box::new(FfmpegDecoder::new())
}
