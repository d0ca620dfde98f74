//! Per-component health tracking and the derived system status.
//!
//! Detectors report liveness through [`HealthRegistry::note_event`]; the
//! registry derives {online, degraded, offline} from event recency against
//! `detector_timeout_seconds` (degraded past 1×, offline past 2×). The
//! single system status shown to users collapses the per-component states.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::events::DetectorId;

/// Health of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Online,
    Degraded,
    Offline,
}

/// Single derived system status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Online,
    Degraded,
    Error,
}

/// Health snapshot for one detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorHealth {
    pub status: ComponentStatus,
    /// Monotonic time of the most recent event, if any this session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<f64>,
    pub transient_errors: u64,
    /// Radar framing resynchronizations (0 for other detectors).
    pub resyncs: u64,
}

/// Snapshot published on the external stream under the `status` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub system: SystemStatus,
    pub detectors: BTreeMap<String, DetectorHealth>,
    /// Per-subscriber bus drop counters, keyed by subscriber label.
    pub bus_dropped: BTreeMap<String, u64>,
    pub paused: bool,
    pub active_alerts: u64,
}

#[derive(Debug, Default)]
struct DetectorEntry {
    last_event: Option<f64>,
    transient_errors: u64,
    resyncs: u64,
    connected: bool,
}

/// Runtime registry, shared between detector workers and the orchestrator.
pub struct HealthRegistry {
    clock: SharedClock,
    detector_timeout: f64,
    detectors: Mutex<BTreeMap<DetectorId, DetectorEntry>>,
}

impl HealthRegistry {
    pub fn new(clock: SharedClock, detector_timeout: f64, enabled: &[DetectorId]) -> Self {
        let mut detectors = BTreeMap::new();
        for id in enabled {
            detectors.insert(*id, DetectorEntry::default());
        }
        Self {
            clock,
            detector_timeout,
            detectors: Mutex::new(detectors),
        }
    }

    pub fn note_event(&self, id: DetectorId) {
        let now = self.clock.now_monotonic();
        let mut map = self.detectors.lock();
        let entry = map.entry(id).or_default();
        entry.last_event = Some(now);
        entry.connected = true;
    }

    pub fn note_transient_error(&self, id: DetectorId) {
        self.detectors.lock().entry(id).or_default().transient_errors += 1;
    }

    pub fn note_resyncs(&self, id: DetectorId, count: u64) {
        self.detectors.lock().entry(id).or_default().resyncs += count;
    }

    pub fn note_disconnected(&self, id: DetectorId) {
        self.detectors.lock().entry(id).or_default().connected = false;
    }

    fn status_of(&self, entry: &DetectorEntry, now: f64) -> ComponentStatus {
        match entry.last_event {
            None => ComponentStatus::Offline,
            Some(last) => {
                let age = now - last;
                if age > 2.0 * self.detector_timeout {
                    ComponentStatus::Offline
                } else if age > self.detector_timeout {
                    ComponentStatus::Degraded
                } else {
                    ComponentStatus::Online
                }
            }
        }
    }

    pub fn detector_status(&self, id: DetectorId) -> ComponentStatus {
        let now = self.clock.now_monotonic();
        let map = self.detectors.lock();
        map.get(&id)
            .map(|e| self.status_of(e, now))
            .unwrap_or(ComponentStatus::Offline)
    }

    /// True when every tracked detector has yet to produce a single event.
    pub fn all_silent(&self) -> bool {
        let map = self.detectors.lock();
        !map.is_empty() && map.values().all(|e| e.last_event.is_none())
    }

    pub fn report(
        &self,
        bus_dropped: BTreeMap<String, u64>,
        paused: bool,
        active_alerts: u64,
    ) -> StatusReport {
        let now = self.clock.now_monotonic();
        let map = self.detectors.lock();
        let mut detectors = BTreeMap::new();
        let mut online = 0usize;
        let mut offline = 0usize;
        for (id, entry) in map.iter() {
            let status = self.status_of(entry, now);
            match status {
                ComponentStatus::Online => online += 1,
                ComponentStatus::Offline => offline += 1,
                ComponentStatus::Degraded => {}
            }
            detectors.insert(
                id.to_string(),
                DetectorHealth {
                    status,
                    last_update: entry.last_event,
                    transient_errors: entry.transient_errors,
                    resyncs: entry.resyncs,
                },
            );
        }
        let total = map.len();
        let system = if total == 0 || online == total {
            SystemStatus::Online
        } else if offline == total {
            SystemStatus::Error
        } else {
            SystemStatus::Degraded
        };
        StatusReport {
            system,
            detectors,
            bus_dropped,
            paused,
            active_alerts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn registry(clock: Arc<ManualClock>) -> HealthRegistry {
        HealthRegistry::new(clock, 10.0, &[DetectorId::Radar, DetectorId::Audio])
    }

    #[test]
    fn detector_without_events_is_offline() {
        let clock = ManualClock::shared(0.0);
        let reg = registry(clock);
        assert_eq!(reg.detector_status(DetectorId::Radar), ComponentStatus::Offline);
        assert!(reg.all_silent());
    }

    #[test]
    fn status_degrades_then_goes_offline_with_age() {
        let clock = ManualClock::shared(0.0);
        let reg = registry(Arc::clone(&clock));
        reg.note_event(DetectorId::Radar);
        assert_eq!(reg.detector_status(DetectorId::Radar), ComponentStatus::Online);

        clock.advance(10.5);
        assert_eq!(reg.detector_status(DetectorId::Radar), ComponentStatus::Degraded);

        clock.advance(10.0);
        assert_eq!(reg.detector_status(DetectorId::Radar), ComponentStatus::Offline);
    }

    #[test]
    fn system_status_collapses_component_states() {
        let clock = ManualClock::shared(0.0);
        let reg = registry(Arc::clone(&clock));
        reg.note_event(DetectorId::Radar);
        reg.note_event(DetectorId::Audio);
        let report = reg.report(BTreeMap::new(), false, 0);
        assert_eq!(report.system, SystemStatus::Online);

        // Audio ages out, radar stays fresh → degraded.
        clock.advance(25.0);
        reg.note_event(DetectorId::Radar);
        let report = reg.report(BTreeMap::new(), false, 0);
        assert_eq!(report.system, SystemStatus::Degraded);
    }

    #[test]
    fn report_serializes_camel_case() {
        let clock = ManualClock::shared(0.0);
        let reg = registry(clock);
        reg.note_event(DetectorId::Radar);
        reg.note_resyncs(DetectorId::Radar, 3);
        let report = reg.report(BTreeMap::new(), true, 2);
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["paused"], true);
        assert_eq!(json["activeAlerts"], 2);
        assert_eq!(json["detectors"]["radar"]["resyncs"], 3);
        assert_eq!(json["detectors"]["audio"]["status"], "offline");
    }
}
