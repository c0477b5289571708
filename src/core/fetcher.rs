//! FrameFetcher actor - owns the decoder, fills cache blocks
//!
//! The only actor that blocks on I/O: seek and decode run here so they
//! never stall the cache or the controller.
//!
//! Seeks land where the decoder's index allows. The achieved position is
//! read back and mapped to a sequence number; frames before the target are
//! decoded and discarded, missing frames after it become gap frames, so
//! slot `i` of a filled block always carries `base + i`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use super::actor::{Actor, Context, Recipient};
use crate::entities::{Decoder, DecoderFactory, Frame, MediaInfo};
use crate::error::{EngineError, Result};

/// Command: fill `buffers` with frames `base..base + buffers.len()`
pub struct FetchFrames {
    pub slot: usize,
    pub base: u64,
    /// Seek target; `None` continues after the previous fetch
    pub start: Option<u64>,
    pub buffers: Vec<Frame>,
    pub reply: Recipient<FetchedBlock>,
}

/// Reply to `FetchFrames`. Buffers always come back, even on failure.
pub struct FetchedBlock {
    pub slot: usize,
    pub base: u64,
    pub buffers: Vec<Frame>,
    pub ok: bool,
}

pub struct MediaInfoRequest {
    pub reply: Recipient<MediaInfo>,
}

pub enum FetcherMsg {
    Info(MediaInfoRequest),
    Fetch(FetchFrames),
}

pub struct FrameFetcher {
    path: PathBuf,
    factory: Arc<dyn DecoderFactory>,
    decoder: Option<Box<dyn Decoder>>,
    info: Option<MediaInfo>,
    /// Sequence the decoder will produce next, when known
    next_seq: Option<u64>,
    end_of_media: bool,
    fetch_time: Duration,
    fetches: u64,
}

impl FrameFetcher {
    pub fn new(path: PathBuf, factory: Arc<dyn DecoderFactory>) -> Self {
        Self {
            path,
            factory,
            decoder: None,
            info: None,
            next_seq: None,
            end_of_media: false,
            fetch_time: Duration::ZERO,
            fetches: 0,
        }
    }

    /// Open the container. Called from `started`, public for tests.
    pub fn open(&mut self) -> Result<MediaInfo> {
        let mut decoder = self.factory.create();
        let info = decoder.open(&self.path)?;
        if info.frame_rate <= 0.0 || !info.frame_rate.is_finite() {
            decoder.close();
            return Err(EngineError::Media(format!(
                "{}: invalid frame rate {}",
                self.path.display(),
                info.frame_rate
            )));
        }
        info!(
            "Opened {}: {}x{} @ {:.3} fps, audio: {:?}",
            self.path.display(),
            info.video.width,
            info.video.height,
            info.frame_rate,
            info.audio
        );
        self.decoder = Some(decoder);
        self.info = Some(info.clone());
        Ok(info)
    }

    pub fn info(&self) -> Option<&MediaInfo> {
        self.info.as_ref()
    }

    /// Fill `buffers` with `base..base + len`.
    pub fn fetch(&mut self, base: u64, start: Option<u64>, buffers: &mut [Frame]) -> Result<()> {
        let (Some(decoder), Some(info)) = (self.decoder.as_mut(), self.info.as_ref()) else {
            return Err(EngineError::Media(format!("{}: not open", self.path.display())));
        };
        if buffers.is_empty() {
            return Ok(());
        }

        let continuing = start.is_none() && self.next_seq.is_some_and(|next| next >= base);
        if !continuing {
            if let Some(target) = start
                && target != base
            {
                warn!("Fetch start {} differs from block base {}, seeking to base", target, base);
            }
            let target_ms = info.timestamp_ms(base);
            let achieved_ms = decoder.seek(target_ms)?;
            let mut position = info.seq_nearest(achieved_ms);
            trace!("Seek to {}ms ({}) landed at {}ms ({})", target_ms, base, achieved_ms, position);
            self.end_of_media = false;

            // Decode forward to the target, reusing the first buffer as scratch
            while position < base {
                buffers[0].reset();
                if !decoder.read_next_frame(&mut buffers[0])? {
                    self.end_of_media = true;
                    break;
                }
                position += 1;
            }
            self.next_seq = Some(position);
        }

        let mut next = self.next_seq.unwrap_or(base);
        for (i, frame) in buffers.iter_mut().enumerate() {
            let seq = base + i as u64;
            let timestamp_ms = info.timestamp_ms(seq);

            if seq < next {
                // Seek overshot: nothing decodable for this slot
                frame.make_gap(seq, timestamp_ms, false);
                continue;
            }
            if self.end_of_media {
                frame.make_gap(seq, timestamp_ms, true);
                continue;
            }

            frame.reset();
            if decoder.read_next_frame(frame)? {
                frame.seq = seq;
                frame.timestamp_ms = timestamp_ms;
                next = seq + 1;
            } else {
                debug!("End of media at frame {}", seq);
                self.end_of_media = true;
                frame.make_gap(seq, timestamp_ms, true);
            }
        }
        self.next_seq = Some(next.max(base + buffers.len() as u64));
        Ok(())
    }

    fn handle_fetch(&mut self, cmd: FetchFrames) -> Result<()> {
        let FetchFrames { slot, base, start, mut buffers, reply } = cmd;
        let started = Instant::now();
        let result = self.fetch(base, start, &mut buffers);
        self.fetch_time += started.elapsed();
        self.fetches += 1;
        trace!(
            "Fetched block {} (slot {}, seek: {}) in {:.1}ms",
            base,
            slot,
            start.is_some(),
            started.elapsed().as_secs_f64() * 1000.0
        );

        if result.is_err() {
            // Decoder state unknown, force a seek next time
            self.next_seq = None;
        }
        reply.send(FetchedBlock { slot, base, buffers, ok: result.is_ok() });
        result
    }
}

impl Actor for FrameFetcher {
    type Msg = FetcherMsg;

    fn started(&mut self, ctx: &mut Context<FetcherMsg>) {
        if let Err(e) = self.open() {
            ctx.report(e);
        }
    }

    fn handle(&mut self, msg: FetcherMsg, _ctx: &mut Context<FetcherMsg>) -> Result<()> {
        match msg {
            FetcherMsg::Info(req) => {
                match &self.info {
                    Some(info) => {
                        req.reply.send(info.clone());
                    }
                    None => debug!("Media info requested but {} is not open", self.path.display()),
                }
                Ok(())
            }
            FetcherMsg::Fetch(cmd) => self.handle_fetch(cmd),
        }
    }

    fn stopped(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.close();
        }
        if self.fetches > 0 {
            debug!(
                "Fetcher closed {}: {} fetches, avg {:.1}ms",
                self.path.display(),
                self.fetches,
                self.fetch_time.as_secs_f64() * 1000.0 / self.fetches as f64
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDecoder, decoder_factory, mock_decoder_factory};

    fn fetcher(frames: u64, keyframe_interval: u64) -> FrameFetcher {
        let mut fetcher =
            FrameFetcher::new(PathBuf::from("mock.mp4"), mock_decoder_factory(frames, keyframe_interval));
        fetcher.open().expect("open");
        fetcher
    }

    fn buffers(n: usize) -> Vec<Frame> {
        (0..n).map(|_| Frame::empty()).collect()
    }

    #[test]
    fn test_contiguous_fetches_are_consecutive() {
        let mut fetcher = fetcher(100, 10);
        let mut all = Vec::new();
        let mut block = buffers(8);
        fetcher.fetch(16, Some(16), &mut block).expect("fetch");
        all.extend(block.iter().map(|f| f.seq));
        for base in [24u64, 32, 40] {
            fetcher.fetch(base, None, &mut block).expect("fetch");
            all.extend(block.iter().map(|f| f.seq));
        }
        let expected: Vec<u64> = (16..48).collect();
        assert_eq!(all, expected);
        // decoded content matches the sequence, not just the label
        assert_eq!(MockDecoder::frame_index(&block[7]), Some(47));
    }

    #[test]
    fn test_seek_before_target_discards_leading_frames() {
        // keyframes every 10 frames: seeking to 13 lands on 10
        let mut fetcher = fetcher(100, 10);
        let mut block = buffers(4);
        fetcher.fetch(13, Some(13), &mut block).expect("fetch");
        for (i, frame) in block.iter().enumerate() {
            assert_eq!(frame.seq, 13 + i as u64);
            assert_eq!(MockDecoder::frame_index(frame), Some(13 + i as u64));
            assert_eq!(frame.timestamp_ms, 40 * (13 + i as u64));
        }
    }

    #[test]
    fn test_end_of_media_marks_remaining_frames() {
        let mut fetcher = fetcher(10, 5);
        let mut block = buffers(8);
        fetcher.fetch(8, Some(8), &mut block).expect("fetch");
        assert!(!block[0].end_of_media);
        assert!(!block[1].end_of_media);
        assert!(block[2..].iter().all(|f| f.end_of_media && f.picture.is_empty()));
        assert_eq!(block[7].seq, 15);
    }

    #[test]
    fn test_overshooting_seek_fills_gaps() {
        let mut fetcher = fetcher(100, 1);
        // decoder lands two frames past every seek target
        let mut decoder = MockDecoder::new(100, 1);
        decoder.overshoot = 2;
        fetcher.decoder = Some(Box::new(decoder));

        let mut block = buffers(4);
        fetcher.fetch(20, Some(20), &mut block).expect("fetch");
        assert!(block[0].picture.is_empty() && !block[0].end_of_media);
        assert!(block[1].picture.is_empty());
        assert_eq!(MockDecoder::frame_index(&block[2]), Some(22));
        assert_eq!(block.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![20, 21, 22, 23]);
    }

    #[test]
    fn test_silent_media_fetches_pictures_only() {
        let factory = decoder_factory(|| {
            let mut decoder = MockDecoder::new(20, 5);
            decoder.audio = None;
            decoder
        });
        let mut fetcher = FrameFetcher::new(PathBuf::from("mock.mp4"), factory);
        let info = fetcher.open().expect("open");
        assert_eq!(info.audio, None);
        assert_eq!(info.max_audio_bytes_per_frame(), 0);

        // recycled buffers still hold audio from an earlier load
        let mut block: Vec<Frame> = (0..4)
            .map(|_| {
                let mut frame = Frame::empty();
                frame.audio = vec![7; 64];
                frame
            })
            .collect();
        fetcher.fetch(8, Some(8), &mut block).expect("fetch");
        for (i, frame) in block.iter().enumerate() {
            assert!(frame.audio.is_empty());
            assert_eq!(MockDecoder::frame_index(frame), Some(8 + i as u64));
        }
    }

    #[test]
    fn test_unopened_fetch_fails() {
        let mut fetcher = FrameFetcher::new(PathBuf::from("mock.mp4"), mock_decoder_factory(10, 1));
        let mut block = buffers(2);
        assert!(matches!(fetcher.fetch(0, Some(0), &mut block), Err(EngineError::Media(_))));
    }
}
