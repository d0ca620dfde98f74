//! Local audio alarm.
//!
//! Plays a severity-mapped tone on loop until the alert is acknowledged or
//! resolved, whichever comes first. A critical fire preempts a playing
//! warning tone; a warning never interrupts a critical.
//!
//! Tones come from `<sounds_dir>/warning.wav` / `critical.wav` when
//! present (mono or stereo 16-bit WAV, via hound); otherwise a synthesized
//! sine loop. Playback runs on its own thread because `cpal::Stream` is
//! `!Send`, same as the capture side.

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::Result;
use crate::events::{Alert, AlertLevel};
use crate::notify::AlertSink;

const PLAYBACK_RATE: u32 = 44_100;

/// Loop buffer swapped under a mutex; the output callback only reads.
struct Shared {
    /// `None` = silence.
    tone: Mutex<Option<ToneLoop>>,
    stop: AtomicBool,
}

struct ToneLoop {
    samples: Vec<f32>,
    position: usize,
}

/// Severity → loop samples.
fn tone_for(level: AlertLevel, sounds_dir: Option<&Path>) -> Vec<f32> {
    let file = sounds_dir.map(|dir| {
        dir.join(match level {
            AlertLevel::Warning => "warning.wav",
            AlertLevel::Critical => "critical.wav",
        })
    });
    if let Some(path) = file {
        match load_wav(&path) {
            Ok(samples) if !samples.is_empty() => return samples,
            Ok(_) => warn!(?path, "alarm wav is empty, using synthesized tone"),
            Err(e) => warn!(?path, error = %e, "alarm wav unavailable, using synthesized tone"),
        }
    }
    synthesize(level)
}

fn load_wav(path: &Path) -> anyhow::Result<Vec<f32>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .filter_map(|s| s.ok())
                .map(|s| s as f32 / scale)
                .collect()
        }
        hound::SampleFormat::Float => reader.samples::<f32>().filter_map(|s| s.ok()).collect(),
    };
    // Mix down to mono.
    Ok(samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect())
}

/// Pulsed sine: urgency maps to pitch and duty cycle.
fn synthesize(level: AlertLevel) -> Vec<f32> {
    let (freq, on_secs, off_secs) = match level {
        AlertLevel::Warning => (440.0f32, 0.3, 0.7),
        AlertLevel::Critical => (880.0, 0.2, 0.15),
    };
    let on = (PLAYBACK_RATE as f32 * on_secs) as usize;
    let off = (PLAYBACK_RATE as f32 * off_secs) as usize;
    (0..on + off)
        .map(|i| {
            if i < on {
                0.4 * (2.0 * std::f32::consts::PI * freq * i as f32 / PLAYBACK_RATE as f32).sin()
            } else {
                0.0
            }
        })
        .collect()
}

/// Handle to the playback thread.
struct AlarmPlayer {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AlarmPlayer {
    fn start() -> Self {
        let shared = Arc::new(Shared {
            tone: Mutex::new(None),
            stop: AtomicBool::new(false),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("alarm-playback".into())
            .spawn(move || playback_thread(thread_shared))
            .ok();
        Self { shared, thread }
    }

    fn play(&self, samples: Vec<f32>) {
        *self.shared.tone.lock() = Some(ToneLoop {
            samples,
            position: 0,
        });
    }

    fn silence(&self) {
        *self.shared.tone.lock() = None;
    }
}

impl Drop for AlarmPlayer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(feature = "audio-cpal")]
fn playback_thread(shared: Arc<Shared>) {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        warn!("no output device — local alarm disabled");
        return;
    };
    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(PLAYBACK_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let callback_shared = Arc::clone(&shared);
    let stream = device.build_output_stream(
        &config,
        move |out: &mut [f32], _| {
            let mut tone = callback_shared.tone.lock();
            match tone.as_mut() {
                Some(t) if !t.samples.is_empty() => {
                    for sample in out.iter_mut() {
                        *sample = t.samples[t.position];
                        t.position = (t.position + 1) % t.samples.len();
                    }
                }
                _ => out.fill(0.0),
            }
        },
        |err| warn!("alarm output stream error: {err}"),
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            warn!("alarm output stream failed: {e}");
            return;
        }
    };
    if let Err(e) = stream.play() {
        warn!("alarm playback start failed: {e}");
        return;
    }

    while !shared.stop.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
}

#[cfg(not(feature = "audio-cpal"))]
fn playback_thread(shared: Arc<Shared>) {
    info!("compiled without audio-cpal — local alarm is a no-op");
    while !shared.stop.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
}

/// The sink: tracks which alert currently owns the speaker.
pub struct AudioAlarmSink {
    player: AlarmPlayer,
    sounds_dir: Option<PathBuf>,
    current: Option<(String, AlertLevel)>,
}

impl AudioAlarmSink {
    pub fn new(sounds_dir: Option<PathBuf>) -> Self {
        Self {
            player: AlarmPlayer::start(),
            sounds_dir,
            current: None,
        }
    }

    /// Alert id currently holding the speaker, if any.
    pub fn playing(&self) -> Option<&str> {
        self.current.as_ref().map(|(id, _)| id.as_str())
    }

    fn stop_if_current(&mut self, alert_id: &str) {
        if self.playing() == Some(alert_id) {
            self.player.silence();
            self.current = None;
        }
    }
}

#[async_trait]
impl AlertSink for AudioAlarmSink {
    fn name(&self) -> &'static str {
        "audio-alarm"
    }

    async fn deliver(&mut self, alert: &Alert) -> Result<()> {
        // Preemption: equal or higher severity takes the speaker; a warning
        // never interrupts a playing critical.
        if let Some((_, playing_level)) = &self.current {
            if alert.level < *playing_level {
                return Ok(());
            }
        }
        info!(alert_id = %alert.alert_id, level = %alert.level, "local alarm on");
        self.player
            .play(tone_for(alert.level, self.sounds_dir.as_deref()));
        self.current = Some((alert.alert_id.clone(), alert.level));
        Ok(())
    }

    async fn on_resolved(&mut self, alert: &Alert) {
        self.stop_if_current(&alert.alert_id);
    }

    async fn on_acknowledged(&mut self, alert_id: &str) {
        self.stop_if_current(alert_id);
    }
}
