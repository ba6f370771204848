use crate::buffer_queue::{AudioBuffer, BufferReader};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, DefaultStreamConfigError, DeviceNameError, DevicesError, PlayStreamError,
    SupportedBufferSize, SupportedStreamConfigsError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Audio device error: {0}")]
    DeviceError(String),

    #[error("Audio stream error: {0}")]
    StreamError(String),

    #[error("Audio thread exited before the stream started")]
    ThreadExited,
}

impl From<SupportedStreamConfigsError> for AudioError {
    fn from(err: SupportedStreamConfigsError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<DefaultStreamConfigError> for AudioError {
    fn from(err: DefaultStreamConfigError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<DevicesError> for AudioError {
    fn from(err: DevicesError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<DeviceNameError> for AudioError {
    fn from(err: DeviceNameError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<BuildStreamError> for AudioError {
    fn from(err: BuildStreamError) -> Self {
        AudioError::StreamError(err.to_string())
    }
}

impl From<PlayStreamError> for AudioError {
    fn from(err: PlayStreamError) -> Self {
        AudioError::StreamError(err.to_string())
    }
}

/// Counters updated from the audio callback, read from anywhere.
#[derive(Debug, Default)]
pub struct SinkStats {
    buffers_played: AtomicU64,
    underruns: AtomicU64,
}

impl SinkStats {
    pub fn buffers_played(&self) -> u64 {
        self.buffers_played.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

/// The work done on every hardware callback.
///
/// Pulls ready buffers from the queue and substitutes silence when none is
/// ready. Nothing in here blocks, allocates or logs.
pub struct SinkCallback {
    reader: BufferReader,
    current: Option<AudioBuffer>,
    cursor: usize,
    stats: Arc<SinkStats>,
}

impl SinkCallback {
    pub fn new(reader: BufferReader) -> Self {
        Self {
            reader,
            current: None,
            cursor: 0,
            stats: Arc::new(SinkStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }

    /// Fill one mono buffer of the configured size: the next ready buffer, or
    /// all zeros on underrun.
    pub fn render(&mut self, out: &mut [f32]) {
        self.fill_interleaved(out, 1);
    }

    /// Fill an interleaved output block of any length, repeating each mono
    /// sample across `channels`.
    ///
    /// A queued buffer may straddle two callbacks; the cursor into it is kept.
    /// Once the queue runs dry the rest of the block is silence and one
    /// underrun is counted.
    pub fn fill_interleaved(&mut self, data: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let mut frames = data.chunks_mut(channels);

        while let Some(frame) = frames.next() {
            if frame.len() < channels {
                // Trailing partial frame; nothing sensible to play there
                frame.fill(0.0);
                continue;
            }

            if !self.has_samples() && !self.advance() {
                self.stats.underruns.fetch_add(1, Ordering::Relaxed);
                frame.fill(0.0);
                frames.by_ref().for_each(|rest| rest.fill(0.0));
                return;
            }

            let sample = match &self.current {
                Some(buffer) => buffer[self.cursor],
                None => 0.0,
            };
            self.cursor += 1;
            frame.fill(sample);
        }
    }

    fn has_samples(&self) -> bool {
        matches!(
            &self.current,
            Some(buffer) if self.cursor < buffer.len() && self.reader.is_current(buffer)
        )
    }

    fn advance(&mut self) -> bool {
        if let Some(done) = self.current.take() {
            self.reader.recycle(done);
        }
        self.cursor = 0;
        self.current = self.reader.take_one();
        if self.current.is_some() {
            self.stats.buffers_played.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct CpalConfig {
    /// Output device name; `None` selects the host default
    pub device_name: Option<String>,
    /// Rate the receiver produces audio at; no resampling is done
    pub sample_rate: u32,
    /// Preferred hardware period in frames (the queue's buffer size)
    pub buffer_frames: u32,
}

impl Default for CpalConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: 48_000,
            buffer_frames: crate::buffer_queue::DEFAULT_BUFFER_SIZE as u32,
        }
    }
}

enum AudioCommand {
    Stop,
}

/// cpal output stream driven by a [`SinkCallback`].
///
/// cpal streams are not `Send` on every host, so the stream is built and
/// owned by a dedicated thread which lives until the output is dropped.
pub struct CpalOutput {
    command_tx: Sender<AudioCommand>,
    stats: Arc<SinkStats>,
    audio_thread: Option<thread::JoinHandle<()>>,
}

impl CpalOutput {
    pub fn start(config: CpalConfig, callback: SinkCallback) -> Result<Self, AudioError> {
        log::debug!("AudioSink: Starting cpal output");
        let stats = callback.stats();
        let (command_tx, command_rx) = channel::<AudioCommand>();
        let (ready_tx, ready_rx) = channel::<Result<(), AudioError>>();

        let audio_thread = thread::spawn(move || {
            let stream = match Self::build_stream(&config, callback) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            // Park until told to stop or the owner goes away
            while let Ok(command) = command_rx.recv() {
                match command {
                    AudioCommand::Stop => {
                        log::debug!("AudioSink: Received stop command");
                        break;
                    }
                }
            }

            drop(stream);
            log::debug!("AudioSink: Audio thread exiting");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!("AudioSink: Output stream running");
                Ok(Self {
                    command_tx,
                    stats,
                    audio_thread: Some(audio_thread),
                })
            }
            Ok(Err(e)) => {
                let _ = audio_thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = audio_thread.join();
                Err(AudioError::ThreadExited)
            }
        }
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }

    fn build_stream(
        config: &CpalConfig,
        mut callback: SinkCallback,
    ) -> Result<cpal::Stream, AudioError> {
        let host = cpal::default_host();
        log::debug!("AudioSink: Using audio host: {:?}", host.id());

        let device = match &config.device_name {
            Some(name) => {
                let mut found = None;
                for device in host.output_devices()? {
                    let device_name = device.name()?;
                    log::debug!("AudioSink: Found output device: {}", device_name);
                    if device_name == *name {
                        found = Some(device);
                        break;
                    }
                }
                found.ok_or_else(|| {
                    AudioError::DeviceError(format!("Output device '{}' not found", name))
                })?
            }
            None => host
                .default_output_device()
                .ok_or_else(|| AudioError::DeviceError("No output device found".to_string()))?,
        };
        log::info!("AudioSink: Using output device: {:?}", device.name());

        let supported = device.supported_output_configs()?.find(|range| {
            range.sample_format() == cpal::SampleFormat::F32
                && range.min_sample_rate().0 <= config.sample_rate
                && config.sample_rate <= range.max_sample_rate().0
        });

        let stream_config = match supported {
            Some(range) => {
                let buffer_size = match range.buffer_size() {
                    SupportedBufferSize::Range { min, max }
                        if (*min..=*max).contains(&config.buffer_frames) =>
                    {
                        cpal::BufferSize::Fixed(config.buffer_frames)
                    }
                    _ => cpal::BufferSize::Default,
                };
                let mut stream_config = range
                    .with_sample_rate(cpal::SampleRate(config.sample_rate))
                    .config();
                stream_config.buffer_size = buffer_size;
                stream_config
            }
            None => {
                let fallback = device.default_output_config()?;
                log::warn!(
                    "AudioSink: Device has no f32 config at {}Hz, using {:?}; pitch will be off",
                    config.sample_rate,
                    fallback
                );
                fallback.config()
            }
        };

        log::info!(
            "AudioSink: Output format - {}Hz, {}ch, buffer {:?}",
            stream_config.sample_rate.0,
            stream_config.channels,
            stream_config.buffer_size
        );

        let channels = stream_config.channels as usize;
        let stream = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                callback.fill_interleaved(data, channels);
            },
            |err| log::error!("AudioSink: Stream error: {}", err),
            None,
        )?;
        stream.play()?;
        Ok(stream)
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Err(e) = self.command_tx.send(AudioCommand::Stop) {
            log::debug!("AudioSink: Audio thread already gone: {}", e);
        }

        if let Some(thread) = self.audio_thread.take() {
            if let Err(e) = thread.join() {
                log::error!("AudioSink: Failed to join audio thread: {:?}", e);
            }
        }
    }
}
