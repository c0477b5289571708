//! Audio line on the default cpal output device
//!
//! PCM is queued in a shared ring that the device callback drains. The ring
//! holds `BUFFER_MS` of audio; `available()` is its free space, which is what
//! paces the audio renderer. Start is reported from the first callback after
//! `start()`, i.e. when the device actually asks for sound.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, warn};

use crate::entities::{AudioFormat, AudioLine, LineEvent, LineListener};
use crate::error::{EngineError, Result};

/// Queued audio the line accepts ahead of the device
const BUFFER_MS: usize = 250;

type Ring = Arc<Mutex<VecDeque<i16>>>;

fn lock(ring: &Ring) -> MutexGuard<'_, VecDeque<i16>> {
    ring.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct CpalLine {
    stream: Option<cpal::Stream>,
    ring: Ring,
    /// Ring capacity in samples (all channels)
    capacity: usize,
    /// Set by `start()`, cleared by the first callback
    start_pending: Arc<AtomicBool>,
    listener: Option<LineListener>,
}

impl CpalLine {
    pub fn new() -> Self {
        Self {
            stream: None,
            ring: Arc::new(Mutex::new(VecDeque::new())),
            capacity: 0,
            start_pending: Arc::new(AtomicBool::new(false)),
            listener: None,
        }
    }

    fn build_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        listener: LineListener,
    ) -> Result<cpal::Stream>
    where
        T: cpal::SizedSample + cpal::FromSample<i16>,
    {
        let ring = Arc::clone(&self.ring);
        let start_pending = Arc::clone(&self.start_pending);
        let on_error = Arc::clone(&listener);
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    if start_pending.swap(false, Ordering::AcqRel) {
                        listener(LineEvent::Start);
                    }
                    let mut ring = lock(&ring);
                    for sample in data.iter_mut() {
                        *sample = T::from_sample(ring.pop_front().unwrap_or(0));
                    }
                },
                move |err| {
                    warn!("Audio output error: {}", err);
                    on_error(LineEvent::Stop);
                },
                None,
            )
            .map_err(|e| EngineError::Device(format!("Failed to build audio stream: {}", e)))
    }
}

impl Default for CpalLine {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioLine for CpalLine {
    fn open(&mut self, format: AudioFormat, listener: LineListener) -> Result<()> {
        if format.bits_per_sample != 16 {
            return Err(EngineError::Device(format!(
                "Unsupported sample size: {} bits",
                format.bits_per_sample
            )));
        }
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| EngineError::Device("No audio output device found".to_string()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| EngineError::Device(format!("Failed to get audio config: {}", e)))?;

        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(&device, &config, Arc::clone(&listener))?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(&device, &config, Arc::clone(&listener))?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(&device, &config, Arc::clone(&listener))?,
            other => {
                return Err(EngineError::Device(format!("Unsupported sample format: {:?}", other)));
            }
        };
        // Streams may start playing on creation
        stream
            .pause()
            .map_err(|e| EngineError::Device(format!("Failed to pause audio stream: {}", e)))?;

        self.capacity = format.sample_rate as usize * format.channels as usize * BUFFER_MS / 1000;
        lock(&self.ring).reserve(self.capacity);
        self.stream = Some(stream);
        self.listener = Some(listener);
        debug!(
            "Audio line open: {} Hz, {} ch, {} samples buffered",
            format.sample_rate, format.channels, self.capacity
        );
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| EngineError::Device("Audio line not open".to_string()))?;
        self.start_pending.store(true, Ordering::Release);
        stream
            .play()
            .map_err(|e| EngineError::Device(format!("Failed to start audio stream: {}", e)))
    }

    fn stop(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(());
        };
        self.start_pending.store(false, Ordering::Release);
        stream
            .pause()
            .map_err(|e| EngineError::Device(format!("Failed to pause audio stream: {}", e)))?;
        if let Some(listener) = &self.listener {
            listener(LineEvent::Stop);
        }
        Ok(())
    }

    fn available(&self) -> usize {
        if self.stream.is_none() {
            return 0;
        }
        let queued = lock(&self.ring).len();
        self.capacity.saturating_sub(queued) * 2
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut ring = lock(&self.ring);
        let free = self.capacity.saturating_sub(ring.len());
        let samples = (data.len() / 2).min(free);
        ring.extend(
            data[..samples * 2]
                .chunks_exact(2)
                .map(|bytes| i16::from_le(bytemuck::pod_read_unaligned(bytes))),
        );
        samples * 2
    }

    fn flush(&mut self) {
        lock(&self.ring).clear();
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            debug!("Audio line closed");
        }
        self.listener = None;
        lock(&self.ring).clear();
    }
}

/// Factory for the audio renderer thread
pub fn new_cpal_line() -> Result<Box<dyn AudioLine>> {
    Ok(Box::new(CpalLine::new()))
}
