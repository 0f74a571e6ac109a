use crate::observer::{ProgressMeter, SessionObserver};
use crate::protocol::{SampleFormat, StreamHeader};
use crate::pump::{ChunkSink, SinkError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, DeviceNameError, DevicesError, FromSample, PlayStreamError, Sample,
    SizedSample, SupportedStreamConfigsError,
};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

/// Progress is reported every 100 KiB
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100 * 1024;

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Failed to write audio data: {0}")]
    WriteError(String),

    #[error("Failed to stop audio playback: {0}")]
    StopError(String),

    #[error("Audio device error: {0}")]
    DeviceError(String),

    #[error("Unsupported stream configuration: {0}")]
    Unsupported(String),
}

impl From<SupportedStreamConfigsError> for AudioError {
    fn from(err: SupportedStreamConfigsError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<BuildStreamError> for AudioError {
    fn from(err: BuildStreamError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<PlayStreamError> for AudioError {
    fn from(err: PlayStreamError) -> Self {
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

#[derive(Debug, Clone)]
pub struct CpalConfig {
    /// Optional output device name, default device otherwise
    pub device_name: Option<String>,
    /// Size of the sample queue between the socket and the device callback
    pub buffer_ms: u32,
    /// Give up on a write when the device has not drained anything for this long
    pub stall_timeout: Duration,
    pub progress_interval: u64,
}

impl Default for CpalConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            buffer_ms: 250,
            stall_timeout: Duration::from_secs(2),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Check that a header describes something we can play without conversion.
pub fn validate_header(header: &StreamHeader) -> Result<SampleFormat, AudioError> {
    let format = header.sample_format().map_err(|code| {
        AudioError::Unsupported(format!(
            "sample format code {} (only 2 = PCM 16-bit is supported)",
            code
        ))
    })?;
    if header.channels == 0 {
        return Err(AudioError::Unsupported("zero channels".to_string()));
    }
    if header.sample_rate == 0 {
        return Err(AudioError::Unsupported("zero sample rate".to_string()));
    }
    Ok(format)
}

/// Turns s16le bytes into samples across arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct PcmDecoder {
    /// Low byte of a sample whose high byte is in the next chunk
    carry: Option<u8>,
}

impl PcmDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<i16> {
        let mut samples = Vec::with_capacity(chunk.len() / 2 + 1);
        let mut bytes = chunk;

        if let Some(low) = self.carry.take() {
            match bytes.split_first() {
                Some((&high, rest)) => {
                    samples.push(i16::from_le_bytes([low, high]));
                    bytes = rest;
                }
                None => self.carry = Some(low),
            }
        }

        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            samples.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        if let [odd] = pairs.remainder() {
            self.carry = Some(*odd);
        }

        samples
    }

    /// Whether half a sample is waiting for its second byte.
    pub fn has_pending_byte(&self) -> bool {
        self.carry.is_some()
    }
}

enum AudioCommand {
    Stop,
}

/// Plays raw s16le PCM from the socket on a cpal output stream.
///
/// The cpal stream lives on its own thread; samples reach it through a
/// bounded ring buffer. `write` waits while that buffer is full, which
/// throttles the pump to the device's playback rate.
pub struct CpalSink {
    producer: HeapProd<i16>,
    command_tx: mpsc::Sender<AudioCommand>,
    audio_thread: Option<thread::JoinHandle<()>>,
    failed: Arc<AtomicBool>,
    progress: ProgressMeter,
    stall_timeout: Duration,
    decoder: PcmDecoder,
    stopped: bool,
}

impl CpalSink {
    /// Open the output device for the negotiated stream shape.
    ///
    /// Fails when the format is not 16-bit PCM or when the device has no
    /// output configuration with exactly this channel count and rate.
    pub async fn open(
        header: &StreamHeader,
        config: CpalConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self, AudioError> {
        validate_header(header)?;

        let capacity = (header.sample_rate as usize * header.channels as usize)
            * config.buffer_ms.max(10) as usize
            / 1000;
        let rb = HeapRb::<i16>::new(capacity.max(1024));
        let (producer, consumer) = rb.split();

        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let failed = Arc::new(AtomicBool::new(false));

        let thread_failed = Arc::clone(&failed);
        let thread_header = *header;
        let device_name = config.device_name.clone();
        let audio_thread = thread::Builder::new()
            .name("sndsync-audio".to_string())
            .spawn(move || {
                Self::run_output_thread(
                    thread_header,
                    device_name,
                    consumer,
                    command_rx,
                    ready_tx,
                    thread_failed,
                )
            })
            .map_err(|e| AudioError::DeviceError(e.to_string()))?;

        let ready = ready_rx
            .await
            .map_err(|_| AudioError::DeviceError("Audio thread exited during setup".to_string()))
            .and_then(|result| result);

        if let Err(e) = ready {
            let _ = audio_thread.join();
            return Err(e);
        }

        log::info!(
            "🔊 Audio output ready: {} Hz, {} channel(s), 16-bit PCM",
            header.sample_rate,
            header.channels
        );

        Ok(Self {
            producer,
            command_tx,
            audio_thread: Some(audio_thread),
            failed,
            progress: ProgressMeter::new(config.progress_interval, observer),
            stall_timeout: config.stall_timeout,
            decoder: PcmDecoder::default(),
            stopped: false,
        })
    }

    /// Bytes accepted so far
    pub fn bytes_written(&self) -> u64 {
        self.progress.total()
    }

    fn run_output_thread(
        header: StreamHeader,
        device_name: Option<String>,
        consumer: HeapCons<i16>,
        command_rx: mpsc::Receiver<AudioCommand>,
        ready_tx: oneshot::Sender<Result<(), AudioError>>,
        failed: Arc<AtomicBool>,
    ) {
        let stream = match Self::start_stream(&header, device_name.as_deref(), consumer, &failed)
        {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("AudioSink: Failed to start output: {}", e);
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        let _ = ready_tx.send(Ok(()));

        while let Ok(command) = command_rx.recv() {
            match command {
                AudioCommand::Stop => {
                    log::debug!("AudioSink: Received stop command");
                    break;
                }
            }
        }

        if let Err(e) = stream.pause() {
            log::debug!("AudioSink: Pause on shutdown failed: {}", e);
        }
        log::debug!("AudioSink: Audio thread exiting");
    }

    fn start_stream(
        header: &StreamHeader,
        device_name: Option<&str>,
        consumer: HeapCons<i16>,
        failed: &Arc<AtomicBool>,
    ) -> Result<cpal::Stream, AudioError> {
        let host = cpal::default_host();
        log::debug!("AudioSink: Using audio host: {:?}", host.id());

        let device = match device_name {
            Some(name) => {
                let mut found = None;
                for device in host.output_devices()? {
                    if device.name()? == name {
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
                .ok_or_else(|| AudioError::DeviceError("No output device available".to_string()))?,
        };
        log::info!("AudioSink: Using output device: {:?}", device.name());

        let channels = header.channels as u16;
        let rate = cpal::SampleRate(header.sample_rate);
        let mut candidates: Vec<_> = device
            .supported_output_configs()?
            .filter(|range| range.channels() == channels)
            .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
            .filter(|range| {
                matches!(
                    range.sample_format(),
                    cpal::SampleFormat::I16 | cpal::SampleFormat::F32
                )
            })
            .collect();
        // Native i16 first, no conversion needed
        candidates.sort_by_key(|range| range.sample_format() != cpal::SampleFormat::I16);

        let supported = candidates
            .into_iter()
            .next()
            .ok_or_else(|| {
                AudioError::Unsupported(format!(
                    "output device cannot play {} Hz with {} channel(s)",
                    header.sample_rate, header.channels
                ))
            })?
            .with_sample_rate(rate);

        log::debug!("AudioSink: Using output config: {:?}", supported);

        let stream_config = supported.config();
        let stream = match supported.sample_format() {
            cpal::SampleFormat::I16 => {
                Self::build_stream::<i16>(&device, &stream_config, consumer, failed)?
            }
            _ => Self::build_stream::<f32>(&device, &stream_config, consumer, failed)?,
        };
        stream.play()?;
        Ok(stream)
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        mut consumer: HeapCons<i16>,
        failed: &Arc<AtomicBool>,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: SizedSample + FromSample<i16>,
    {
        let failed = Arc::clone(failed);
        let stream = device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                // Underruns play silence
                for sample in data.iter_mut() {
                    *sample = T::from_sample(consumer.try_pop().unwrap_or(0));
                }
            },
            move |err| {
                log::error!("AudioSink: Stream error: {}", err);
                if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                    failed.store(true, Ordering::Release);
                }
            },
            None,
        )?;
        Ok(stream)
    }
}

#[async_trait::async_trait]
impl ChunkSink for CpalSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        if self.stopped {
            return Err(SinkError::Stopped);
        }

        let samples = self.decoder.decode(chunk);
        let mut offset = 0;
        let mut last_progress = Instant::now();

        while offset < samples.len() {
            if self.failed.load(Ordering::Acquire) {
                return Err(AudioError::WriteError("Output device went away".to_string()).into());
            }

            let pushed = self.producer.push_slice(&samples[offset..]);
            offset += pushed;

            if offset < samples.len() {
                if pushed > 0 {
                    last_progress = Instant::now();
                } else if last_progress.elapsed() > self.stall_timeout {
                    return Err(AudioError::WriteError(format!(
                        "Output stalled for {:?} ({} samples queued)",
                        self.stall_timeout,
                        self.producer.occupied_len()
                    ))
                    .into());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        self.progress.record(chunk.len());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SinkError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        log::debug!("AudioSink: Stopping sink");

        if self.command_tx.send(AudioCommand::Stop).is_err() {
            log::debug!("AudioSink: Audio thread already gone");
        }

        if let Some(handle) = self.audio_thread.take() {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| AudioError::StopError(e.to_string()))?
                .map_err(|_| AudioError::StopError("Audio thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.command_tx.send(AudioCommand::Stop);
        }
        if let Some(thread) = self.audio_thread.take() {
            if let Err(e) = thread.join() {
                log::error!("Failed to join audio thread: {:?}", e);
            }
        }
    }
}

/// One playback device as reported by the host.
#[derive(Debug, Clone)]
pub struct OutputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    /// (format, channels, min rate, max rate)
    pub configs: Vec<(String, u16, u32, u32)>,
}

pub fn list_output_devices() -> Result<Vec<OutputDeviceInfo>, AudioError> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();
    for device in host.output_devices()? {
        let name = device.name().unwrap_or_else(|e| format!("<error: {}>", e));
        let configs = match device.supported_output_configs() {
            Ok(configs) => configs
                .map(|c| {
                    (
                        format!("{:?}", c.sample_format()),
                        c.channels(),
                        c.min_sample_rate().0,
                        c.max_sample_rate().0,
                    )
                })
                .collect(),
            Err(e) => {
                log::debug!("Could not query configs for {}: {}", name, e);
                Vec::new()
            }
        };
        devices.push(OutputDeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            configs,
        });
    }
    Ok(devices)
}
