//! `NightwatchEngine` — process lifecycle and component wiring.
//!
//! ## Lifecycle
//!
//! ```text
//! NightwatchEngine::new(config)
//!     └─► run()
//!          ├─ spawn fusion / alert / notifier tasks (bus subscribers)
//!          ├─ spawn one detector worker per enabled sensor (mock or real)
//!          ├─ supervise: hardware startup grace, stop signal
//!          └─ shutdown: close bus, join workers under a 3 s budget
//! ```
//!
//! There are no module-level singletons: the engine owns the bus, the
//! health registry, the pause state and the alert engine, and hands
//! explicit handles to components and to the app shell (stream endpoint,
//! control inbox).

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alert::{AlertEngine, AlertSettings};
use crate::baseline::BaselineStore;
use crate::bus::{EventBus, Message, Topic};
use crate::clock::SharedClock;
use crate::config::{Config, PushProviderKind};
use crate::detectors::{audio::AudioDetector, capacitive::CapacitiveDetector, radar::RadarDetector, DetectorWorker};
use crate::drivers::{mock, SensorDriver};
use crate::error::{NightwatchError, Result};
use crate::events::{ControlRequest, DetectorId};
use crate::fusion::{strategy::Adjustments, FusionEngine, FusionSettings};
use crate::health::{HealthRegistry, StatusReport};
use crate::notify::{audio::AudioAlarmSink, push::{PushProvider, PushSink}, AlertSink, Notifier};

/// Per-worker budget for the final flush/disconnect.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(3);

/// Notification pause state, owned by the engine.
pub struct PauseState {
    clock: SharedClock,
    until: Mutex<Option<f64>>,
}

impl PauseState {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            until: Mutex::new(None),
        }
    }

    pub fn pause_for_minutes(&self, minutes: u64) {
        let until = self.clock.now_monotonic() + minutes as f64 * 60.0;
        *self.until.lock() = Some(until);
        info!(minutes, "notifications paused");
    }

    /// Idempotent; resuming when not paused is a no-op.
    pub fn resume(&self) {
        *self.until.lock() = None;
        info!("notifications resumed");
    }

    pub fn is_paused(&self) -> bool {
        let until = *self.until.lock();
        until
            .map(|until| self.clock.now_monotonic() < until)
            .unwrap_or(false)
    }

    /// Monotonic instant the pause expires, when paused.
    pub fn paused_until(&self) -> Option<f64> {
        let until = (*self.until.lock())?;
        (self.clock.now_monotonic() < until).then_some(until)
    }
}

pub struct NightwatchEngine {
    config: Config,
    clock: SharedClock,
    bus: EventBus,
    health: Arc<HealthRegistry>,
    pause: Arc<PauseState>,
    alerts: Arc<Mutex<AlertEngine>>,
    running: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NightwatchEngine {
    pub fn new(config: Config, clock: SharedClock) -> Self {
        let enabled = config.detectors.enabled_ids();
        let health = Arc::new(HealthRegistry::new(
            Arc::clone(&clock),
            config.alert_engine.detector_timeout_seconds,
            &enabled,
        ));
        let alerts = Arc::new(Mutex::new(AlertEngine::new(
            Arc::clone(&clock),
            AlertSettings {
                resolve_hold_secs: config.alert_engine.resolve_hold_seconds,
                detector_timeout_secs: config.alert_engine.detector_timeout_seconds,
            },
            config.alert_engine.rules.clone(),
            &enabled,
        )));
        Self {
            pause: Arc::new(PauseState::new(Arc::clone(&clock))),
            health,
            alerts,
            bus: EventBus::new(),
            running: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
            config,
            clock,
        }
    }

    /// Bus handle for external consumers (stream endpoint).
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn pause_state(&self) -> Arc<PauseState> {
        Arc::clone(&self.pause)
    }

    /// Single system status plus per-component detail.
    pub fn status_report(&self) -> StatusReport {
        let dropped: BTreeMap<String, u64> = self.bus.dropped_counts().into_iter().collect();
        let active = self.alerts.lock().active_alerts().len() as u64;
        self.health
            .report(dropped, self.pause.is_paused(), active)
    }

    /// Apply one control request. All operations are idempotent; the reply
    /// is a small JSON record for the control transport.
    pub fn handle_control(&self, request: ControlRequest) -> serde_json::Value {
        match request {
            ControlRequest::Pause { minutes } => {
                self.pause.pause_for_minutes(minutes);
                json!({ "ok": true, "paused": true, "minutes": minutes })
            }
            ControlRequest::Resume => {
                self.pause.resume();
                json!({ "ok": true, "paused": false })
            }
            ControlRequest::Acknowledge { alert_id } => {
                let known = self.alerts.lock().acknowledge(&alert_id).is_some();
                // Forward so the local alarm stops even for unknown ids.
                self.bus.publish(
                    Topic::Control,
                    Message::Control(ControlRequest::Acknowledge {
                        alert_id: alert_id.clone(),
                    }),
                );
                json!({ "ok": true, "known": known })
            }
            ControlRequest::Resolve { alert_id } => {
                let resolved = self.alerts.lock().force_resolve(&alert_id);
                let known = resolved.is_some();
                if let Some(alert) = resolved {
                    self.bus.publish(Topic::Alerts, Message::Alert(alert));
                }
                json!({ "ok": true, "known": known })
            }
            ControlRequest::TestAlert { severity } => {
                let alert = self.alerts.lock().test_alert(severity);
                let alert_id = alert.alert_id.clone();
                self.bus.publish(Topic::Alerts, Message::Alert(alert));
                json!({ "ok": true, "alertId": alert_id })
            }
        }
    }

    /// Request a graceful stop. Safe to call from any task or signal
    /// handler context.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("shutdown requested");
        }
        self.stop_signal.notify_waiters();
    }

    /// Run until stopped. Returns `HardwareInit` when every detector stays
    /// silent past the startup grace window.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(NightwatchError::AlreadyRunning);
        }
        info!(mock = self.config.mock_sensors, "nightwatch starting");

        self.spawn_fusion();
        self.spawn_alerts();
        self.spawn_notifier();
        self.spawn_detectors();

        let result = self.supervise().await;
        self.shutdown().await;
        result
    }

    async fn supervise(&self) -> Result<()> {
        let grace = self.config.alert_engine.hardware_startup_grace_seconds;
        let started = self.clock.now_monotonic();
        let mut check = tokio::time::interval(Duration::from_secs(1));
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::select! {
                _ = self.stop_signal.notified() => return Ok(()),
                _ = check.tick() => {}
            }
            // Mock sensors always produce; the grace window only guards
            // real hardware bring-up.
            if !self.config.mock_sensors
                && self.clock.now_monotonic() - started > grace
                && self.health.all_silent()
            {
                error!(grace, "no detector produced any data within the startup grace window");
                self.running.store(false, Ordering::SeqCst);
                return Err(NightwatchError::HardwareInit(format!(
                    "all detectors silent for {grace} s after startup"
                )));
            }
        }
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.bus.close();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_BUDGET, task).await.is_err() {
                warn!("task exceeded its shutdown budget, aborting");
                abort.abort();
            }
        }
        info!("nightwatch stopped");
    }

    // ── Task spawners ────────────────────────────────────────────────────

    fn spawn_fusion(&self) {
        let mut engine = FusionEngine::new(
            Arc::clone(&self.clock),
            FusionSettings {
                signal_max_age: self.config.fusion.signal_max_age_seconds,
                cross_validation_enabled: self.config.fusion.cross_validation_enabled,
                adjustments: Adjustments {
                    agreement_bonus: self.config.fusion.agreement_bonus,
                    disagreement_penalty: self.config.fusion.disagreement_penalty,
                },
            },
            self.config.fusion.rules.clone(),
        );
        let mut events = self.bus.subscribe(Topic::Events, "fusion");
        let bus = self.bus.clone();

        self.tasks.lock().push(tokio::spawn(async move {
            let mut sweep = tokio::time::interval(Duration::from_secs(1));
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    message = events.recv() => match message {
                        Some(Message::Event(event)) => {
                            for update in engine.ingest_event(&event) {
                                bus.publish(Topic::Channels, Message::Channel(update));
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = sweep.tick() => {
                        for update in engine.sweep() {
                            bus.publish(Topic::Channels, Message::Channel(update));
                        }
                    }
                }
            }
            info!("fusion task stopped");
        }));
    }

    fn spawn_alerts(&self) {
        let alerts = Arc::clone(&self.alerts);
        let mut events = self.bus.subscribe(Topic::Events, "alert-events");
        let mut channels = self.bus.subscribe(Topic::Channels, "alert-channels");
        let bus = self.bus.clone();

        self.tasks.lock().push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                // One lock per evaluation step: the engine mutates only here.
                let emissions = tokio::select! {
                    message = events.recv() => match message {
                        Some(Message::Event(event)) => alerts.lock().observe_event(event),
                        Some(_) => Vec::new(),
                        None => break,
                    },
                    message = channels.recv() => match message {
                        Some(Message::Channel(channel)) => alerts.lock().observe_channel(channel),
                        Some(_) => Vec::new(),
                        None => break,
                    },
                    _ = tick.tick() => alerts.lock().tick(),
                };
                for alert in emissions {
                    bus.publish(Topic::Alerts, Message::Alert(alert));
                }
            }
            info!("alert task stopped");
        }));
    }

    fn spawn_notifier(&self) {
        let mut sinks: Vec<Box<dyn AlertSink>> = Vec::new();
        if self.config.notifiers.audio.enabled {
            sinks.push(Box::new(AudioAlarmSink::new(
                self.config.notifiers.audio.sounds_dir.clone(),
            )));
        }
        if self.config.notifiers.push.enabled {
            let push = &self.config.notifiers.push;
            let provider = match push.provider {
                Some(PushProviderKind::Pushover) => Some(PushProvider::Pushover {
                    token: push.token.clone().unwrap_or_default(),
                    user: push.user.clone().unwrap_or_default(),
                }),
                Some(PushProviderKind::Ntfy) => Some(PushProvider::Ntfy {
                    server: push
                        .server
                        .clone()
                        .unwrap_or_else(|| "https://ntfy.sh".into()),
                    topic: push.topic.clone().unwrap_or_default(),
                }),
                Some(PushProviderKind::Webhook) => Some(PushProvider::Webhook {
                    url: push.url.clone().unwrap_or_default(),
                }),
                None => None,
            };
            if let Some(provider) = provider {
                sinks.push(Box::new(PushSink::new(provider)));
            }
        }

        let notifier = Notifier::new(sinks, Arc::clone(&self.pause));
        let alerts_sub = self.bus.subscribe(Topic::Alerts, "notifier");
        let control_sub = self.bus.subscribe(Topic::Control, "notifier-control");
        self.tasks
            .lock()
            .push(tokio::spawn(notifier.run(alerts_sub, control_sub)));
    }

    fn spawn_detectors(&self) {
        let store = BaselineStore::new(&self.config.system.data_dir);

        if self.config.detectors.radar.enabled {
            let detector = RadarDetector::new();
            if self.config.mock_sensors {
                let driver = mock::MockRadarDriver::new(Arc::clone(&self.clock));
                self.spawn_worker(driver, detector);
            } else {
                let radar = &self.config.detectors.radar;
                let driver = crate::drivers::radar::RadarDriver::new(
                    radar.device.clone(),
                    radar.baud_rate,
                    radar.model.into(),
                    Arc::clone(&self.clock),
                );
                self.spawn_worker(driver, detector);
            }
        }

        if self.config.detectors.audio.enabled {
            let floor = store.get(DetectorId::Audio, "noise_floor");
            let detector = AudioDetector::new().with_baseline_floor(floor);
            if self.config.mock_sensors {
                let driver = mock::MockAudioDriver::new(Arc::clone(&self.clock));
                self.spawn_worker(driver, detector);
            } else {
                let driver = crate::drivers::audio::AudioDriver::new(
                    self.config.detectors.audio.device.clone(),
                    Arc::clone(&self.clock),
                );
                self.spawn_worker(driver, detector);
            }
        }

        if self.config.detectors.capacitive.enabled {
            let threshold = store
                .get(DetectorId::Capacitive, "occupancy_threshold")
                .map(|t| t as f32)
                .unwrap_or(0.05);
            let detector = CapacitiveDetector::with_occupancy_threshold(threshold);
            if self.config.mock_sensors {
                let driver = mock::MockAdcDriver::new(Arc::clone(&self.clock));
                self.spawn_worker(driver, detector);
            } else {
                #[cfg(feature = "i2c-linux")]
                {
                    let cap = &self.config.detectors.capacitive;
                    let driver = crate::drivers::capacitive::CapacitiveDriver::linux(
                        cap.i2c_bus.clone(),
                        cap.i2c_address,
                        cap.sample_rate,
                        Arc::clone(&self.clock),
                    );
                    self.spawn_worker(driver, detector);
                }
                #[cfg(not(feature = "i2c-linux"))]
                {
                    let _ = detector;
                    warn!("capacitive detector enabled but compiled without i2c-linux");
                }
            }
        }
    }

    fn spawn_worker<D, T>(&self, driver: D, detector: T)
    where
        D: SensorDriver + 'static,
        T: crate::detectors::Detector<Frame = D::Frame> + 'static,
    {
        let worker = DetectorWorker::new(
            driver,
            detector,
            self.bus.clone(),
            Arc::clone(&self.health),
            Arc::clone(&self.running),
        );
        self.tasks.lock().push(tokio::spawn(worker.run()));
    }
}

/// One-shot calibration for the CLI: runs the driver's calibration pass
/// and persists the learned parameters to the baseline cache.
pub async fn calibrate_detector(config: &Config, id: DetectorId) -> Result<BTreeMap<String, f64>> {
    let clock = crate::clock::SystemClock::shared();
    let store = BaselineStore::new(&config.system.data_dir);

    let params = match id {
        DetectorId::Audio => {
            let mut driver =
                crate::drivers::audio::AudioDriver::new(config.detectors.audio.device.clone(), clock);
            let params = driver
                .calibrate()
                .await
                .map_err(|e| NightwatchError::HardwareInit(e.to_string()))?;
            driver.disconnect().await;
            params
        }
        DetectorId::Capacitive => {
            #[cfg(feature = "i2c-linux")]
            {
                let cap = &config.detectors.capacitive;
                let mut driver = crate::drivers::capacitive::CapacitiveDriver::linux(
                    cap.i2c_bus.clone(),
                    cap.i2c_address,
                    cap.sample_rate,
                    clock,
                );
                let params = driver
                    .calibrate()
                    .await
                    .map_err(|e| NightwatchError::HardwareInit(e.to_string()))?;
                driver.disconnect().await;
                params
            }
            #[cfg(not(feature = "i2c-linux"))]
            {
                return Err(NightwatchError::HardwareInit(
                    "compiled without i2c-linux".into(),
                ));
            }
        }
        DetectorId::Radar => {
            return Err(NightwatchError::UnknownDetector(
                "radar does not support calibration".into(),
            ))
        }
    };

    store.save(id, &params)?;
    info!(detector = %id, keys = params.len(), "calibration saved");
    Ok(params)
}
