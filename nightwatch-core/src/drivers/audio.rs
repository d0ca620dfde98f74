//! USB microphone driver.
//!
//! ## Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority
//! and must not allocate, lock, or perform I/O. It writes straight into an
//! SPSC ring buffer producer; the detector task drains the consumer,
//! converts to 16 kHz, and cuts 20 ms blocks.
//!
//! `cpal::Stream` is `!Send`, so the stream lives on a dedicated capture
//! thread for its whole life. A crossbeam handshake channel carries the
//! open result (actual device rate or error) back to `connect()`.

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use ringbuf::traits::{Consumer, Split};
use ringbuf::HeapRb;

use crate::clock::SharedClock;
use crate::drivers::resample::RateConverter;
use crate::drivers::{AudioBlock, DriverError, SensorDriver};
use crate::events::DetectorId;

/// Analysis rate for all audio DSP.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// 20 ms at 16 kHz.
pub const BLOCK_SAMPLES: usize = 320;

/// Ring capacity: 2^20 f32 ≈ 21.8 s at 48 kHz.
const RING_CAPACITY: usize = 1 << 20;

/// Resampler input chunk (20 ms at 48 kHz).
const CONVERT_CHUNK: usize = 960;

const EMPTY_SLEEP: Duration = Duration::from_millis(5);

/// No samples for this long while "connected" → transient underrun.
const UNDERRUN_TIMEOUT: Duration = Duration::from_secs(5);

struct Capture {
    consumer: ringbuf::HeapCons<f32>,
    converter: RateConverter,
    pending: Vec<f32>,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Microphone driver: capture thread + rate conversion + block cutting.
pub struct AudioDriver {
    device: Option<String>,
    clock: SharedClock,
    capture: Option<Capture>,
}

impl AudioDriver {
    /// `device` is a platform device-name selector; `None` means default
    /// input.
    pub fn new(device: Option<String>, clock: SharedClock) -> Self {
        Self {
            device,
            clock,
            capture: None,
        }
    }
}

#[async_trait]
impl SensorDriver for AudioDriver {
    type Frame = AudioBlock;

    fn id(&self) -> DetectorId {
        DetectorId::Audio
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        let ring = HeapRb::<f32>::new(RING_CAPACITY);
        let (producer, consumer) = ring.split();
        let stop = Arc::new(AtomicBool::new(false));

        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<u32, DriverError>>(1);
        let device = self.device.clone();
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || capture_thread(device, producer, thread_stop, open_tx))
            .map_err(|e| DriverError::Fatal(format!("spawn capture thread: {e}")))?;

        // The capture thread reports the negotiated rate (or the open error).
        let capture_rate = open_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| DriverError::Fatal("audio capture thread died during open".into()))??;

        let converter = RateConverter::new(capture_rate, TARGET_SAMPLE_RATE, CONVERT_CHUNK)?;
        if !converter.is_passthrough() {
            tracing::info!(capture_rate, target = TARGET_SAMPLE_RATE, "audio resampling enabled");
        }

        self.capture = Some(Capture {
            consumer,
            converter,
            pending: Vec::with_capacity(BLOCK_SAMPLES * 4),
            stop,
            thread: Some(thread),
        });
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop.store(true, Ordering::Release);
            if let Some(thread) = capture.thread.take() {
                // The capture thread polls the stop flag every 50 ms.
                let _ = tokio::task::spawn_blocking(move || thread.join()).await;
            }
        }
    }

    async fn read(&mut self) -> Result<AudioBlock, DriverError> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| DriverError::Fatal("audio not connected".into()))?;

        let mut scratch = [0f32; 2048];
        let mut waited = Duration::ZERO;
        loop {
            let n = capture.consumer.pop_slice(&mut scratch);
            if n > 0 {
                let converted = capture.converter.process(&scratch[..n]);
                capture.pending.extend_from_slice(&converted);
            }

            if capture.pending.len() >= BLOCK_SAMPLES {
                let samples: Vec<f32> = capture.pending.drain(..BLOCK_SAMPLES).collect();
                return Ok(AudioBlock {
                    timestamp: self.clock.now_monotonic(),
                    samples,
                    sample_rate: TARGET_SAMPLE_RATE,
                });
            }

            if n == 0 {
                if capture
                    .thread
                    .as_ref()
                    .map(|t| t.is_finished())
                    .unwrap_or(true)
                {
                    // The worker reconnects on fatal errors and calls
                    // disconnect(), which tears this capture down.
                    return Err(DriverError::Fatal("audio capture thread exited".into()));
                }
                if waited >= UNDERRUN_TIMEOUT {
                    return Err(DriverError::Transient("audio underrun".into()));
                }
                waited += EMPTY_SLEEP;
                tokio::time::sleep(EMPTY_SLEEP).await;
            }
        }
    }

    /// Learn the room's noise floor: 5 s of 20 ms blocks, 5th percentile
    /// of block RMS. Persisted by the caller as the audio baseline.
    async fn calibrate(&mut self) -> Result<BTreeMap<String, f64>, DriverError> {
        if self.capture.is_none() {
            self.connect().await?;
        }
        let mut levels = Vec::with_capacity(250);
        for _ in 0..250 {
            let block = self.read().await?;
            levels.push(crate::dsp::stats::rms(&block.samples));
        }
        let floor = crate::dsp::stats::percentile(&levels, 5.0).max(1e-6) as f64;
        let mut params = BTreeMap::new();
        params.insert("noise_floor".to_string(), floor);
        Ok(params)
    }
}

#[cfg(feature = "audio-cpal")]
fn capture_thread(
    device: Option<String>,
    producer: ringbuf::HeapProd<f32>,
    stop: Arc<AtomicBool>,
    open_tx: crossbeam_channel::Sender<Result<u32, DriverError>>,
) {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let selected = match device.as_deref() {
        Some(name) => host
            .input_devices()
            .ok()
            .and_then(|mut devices| devices.find(|d| matches!(d.name().as_deref(), Ok(n) if n == name))),
        None => None,
    }
    .or_else(|| host.default_input_device());

    let Some(selected) = selected else {
        let _ = open_tx.send(Err(DriverError::Fatal("no input device found".into())));
        return;
    };

    let supported = match selected.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = open_tx.send(Err(DriverError::Fatal(format!("input config: {e}"))));
            return;
        }
    };
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    tracing::info!(
        device = %selected.name().unwrap_or_else(|_| "unknown".into()),
        sample_rate,
        channels,
        "opening microphone"
    );

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream(&selected, &config, channels, producer, |s: f32| s),
        cpal::SampleFormat::I16 => build_stream(&selected, &config, channels, producer, |s: i16| {
            s as f32 / 32768.0
        }),
        cpal::SampleFormat::U8 => build_stream(&selected, &config, channels, producer, |s: u8| {
            (s as f32 - 128.0) / 128.0
        }),
        fmt => {
            let _ = open_tx.send(Err(DriverError::Fatal(format!(
                "unsupported sample format {fmt:?}"
            ))));
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = open_tx.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = open_tx.send(Err(DriverError::Fatal(format!("stream start: {e}"))));
        return;
    }
    let _ = open_tx.send(Ok(sample_rate));

    // Keep the !Send stream alive on this thread until told to stop.
    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
}

#[cfg(feature = "audio-cpal")]
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    mut producer: ringbuf::HeapProd<f32>,
    to_f32: fn(T) -> f32,
) -> Result<cpal::Stream, DriverError>
where
    T: cpal::SizedSample + Send + 'static,
{
    use cpal::traits::DeviceTrait;
    use ringbuf::traits::Producer;

    let mut mix: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                let frames = data.len() / channels;
                mix.resize(frames, 0.0);
                for f in 0..frames {
                    let base = f * channels;
                    let mut sum = 0f32;
                    for c in 0..channels {
                        sum += to_f32(data[base + c]);
                    }
                    mix[f] = sum / channels as f32;
                }
                // Wait-free; overflow silently drops the newest frames and
                // the detector reports the gap as an underrun.
                let _ = producer.push_slice(&mix);
            },
            |err| tracing::error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| DriverError::Fatal(format!("build input stream: {e}")))
}

#[cfg(not(feature = "audio-cpal"))]
fn capture_thread(
    _device: Option<String>,
    _producer: ringbuf::HeapProd<f32>,
    _stop: Arc<AtomicBool>,
    open_tx: crossbeam_channel::Sender<Result<u32, DriverError>>,
) {
    let _ = open_tx.send(Err(DriverError::Fatal(
        "compiled without audio-cpal feature".into(),
    )));
}
