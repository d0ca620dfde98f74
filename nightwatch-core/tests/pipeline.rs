//! End-to-end pipeline scenarios: events → fusion → channels → rules →
//! alerts, driven by a manual clock, plus a wall-clock smoke test of the
//! full engine over mock sensors.

use std::collections::BTreeMap;
use std::sync::Arc;

use nightwatch_core::alert::{
    AlertEngine, AlertSettings, CombineMode, Condition, ConditionValue, Operator, RuleSpec,
};
use nightwatch_core::bus::{Message, Topic};
use nightwatch_core::clock::{ManualClock, SystemClock};
use nightwatch_core::fusion::strategy::Strategy;
use nightwatch_core::fusion::{ChannelSpec, FusionEngine, FusionSettings, SourceSpec};
use nightwatch_core::{
    Alert, AlertLevel, Config, DetectorId, DetectorState, Event, FieldValue, NightwatchEngine,
};

fn radar_event(t: f64, sequence: u64, rate: f64) -> Event {
    let mut values = BTreeMap::new();
    values.insert("respiration_rate".to_string(), FieldValue::Number(rate));
    values.insert("presence".to_string(), FieldValue::Bool(true));
    Event {
        detector: DetectorId::Radar,
        timestamp: t,
        sequence,
        session_id: 1,
        state: DetectorState::Warning,
        confidence: 0.9,
        values,
    }
}

fn respiration_channel() -> ChannelSpec {
    ChannelSpec {
        signal: "respiration".into(),
        sources: vec![SourceSpec {
            detector: DetectorId::Radar,
            field: "respiration_rate".into(),
            weight: 1.0,
        }],
        strategy: Strategy::WeightedAverage,
        min_sources: 1,
        agreement_threshold: 0.8,
        disagreement_limit: Some(10.0),
        max_deviation: 5.0,
    }
}

fn low_respiration_rule(duration: f64, cooldown: f64) -> RuleSpec {
    RuleSpec {
        name: "Respiration critical".into(),
        enabled: true,
        conditions: vec![Condition {
            source: "respiration".into(),
            field: None,
            operator: Operator::Lt,
            value: ConditionValue::Number(4.0),
            duration_seconds: None,
        }],
        combine: CombineMode::All,
        severity: AlertLevel::Critical,
        duration_seconds: duration,
        cooldown_seconds: cooldown,
        message: "respiration {respiration} BPM".into(),
    }
}

/// Scenarios 1 + 2: the dwell gates the fire, the cooldown (and the open
/// alert) suppress retriggering — across the fused channel, not a raw
/// detector field.
#[test]
fn respiration_critical_fires_once_through_fusion() {
    let clock = ManualClock::shared(0.0);
    let mut fusion = FusionEngine::new(
        Arc::clone(&clock) as _,
        FusionSettings::default(),
        vec![respiration_channel()],
    );
    let mut alerts = AlertEngine::new(
        Arc::clone(&clock) as _,
        AlertSettings::default(),
        vec![low_respiration_rule(10.0, 30.0)],
        &[],
    );

    let mut fired: Vec<(f64, Alert)> = Vec::new();
    // 37 s of respiration_rate = 3 at 1 Hz.
    for i in 0..37u64 {
        let t = i as f64;
        for update in fusion.ingest_event(&radar_event(t, i, 3.0)) {
            for alert in alerts.observe_channel(update) {
                if !alert.resolved {
                    fired.push((t, alert));
                }
            }
        }
        for alert in alerts.tick() {
            if !alert.resolved {
                fired.push((t, alert));
            }
        }
        clock.advance(1.0);
    }

    assert_eq!(fired.len(), 1, "exactly one alert in 37 s");
    let (t, alert) = &fired[0];
    assert!(
        (10.0..=11.0).contains(t),
        "fired at t={t}, expected ≈10 s"
    );
    assert_eq!(alert.level, AlertLevel::Critical);
    assert_eq!(alert.rule_name, "Respiration critical");
    assert_eq!(alert.message, "respiration 3.0 BPM");
}

/// Scenario 6: the radar disappears. The offline warning fires exactly
/// once, the radar-only channel degrades and is then evicted, and nothing
/// downstream panics.
#[test]
fn radar_dropout_degrades_then_evicts_and_warns_once() {
    let clock = ManualClock::shared(0.0);
    let mut fusion = FusionEngine::new(
        Arc::clone(&clock) as _,
        FusionSettings::default(),
        vec![respiration_channel()],
    );
    let mut alerts = AlertEngine::new(
        Arc::clone(&clock) as _,
        AlertSettings {
            resolve_hold_secs: 10.0,
            detector_timeout_secs: 10.0,
        },
        vec![],
        &[DetectorId::Radar],
    );

    // Healthy for 5 s.
    for i in 0..5u64 {
        let event = radar_event(i as f64, i, 14.0);
        fusion.ingest_event(&event);
        alerts.observe_event(event);
        alerts.tick();
        clock.advance(1.0);
    }
    assert!(!fusion.channel("respiration").unwrap().degraded);

    // Radar goes dark. Walk 20 s of ticks and sweeps.
    let mut offline_warnings = 0;
    let mut degraded_updates = 0;
    for _ in 0..20 {
        for update in fusion.sweep() {
            if update.degraded {
                degraded_updates += 1;
            }
        }
        for alert in alerts.tick() {
            if !alert.resolved && alert.rule_name.contains("offline") {
                offline_warnings += 1;
            }
        }
        clock.advance(1.0);
    }

    assert_eq!(offline_warnings, 1, "offline warning fires exactly once");
    assert_eq!(degraded_updates, 1, "one degraded republication");
    assert!(
        fusion.channel("respiration").is_none(),
        "stale channel must be evicted"
    );
}

/// Whole-engine smoke test: mock sensors, real clock. All three detector
/// families must produce events, fusion must produce channels, and
/// shutdown must be clean.
#[tokio::test(flavor = "multi_thread")]
async fn mock_engine_produces_events_and_channels() {
    let config = Config::from_yaml("mock_sensors: true\n").expect("config");
    let engine = Arc::new(NightwatchEngine::new(config, SystemClock::shared()));

    let bus = engine.bus();
    let mut events = bus.subscribe(Topic::Events, "test-events");
    let mut channels = bus.subscribe(Topic::Channels, "test-channels");

    let run_engine = Arc::clone(&engine);
    let runner = tokio::spawn(async move { run_engine.run().await });

    let mut seen: std::collections::BTreeSet<DetectorId> = Default::default();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(15);
    while seen.len() < 3 && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(Message::Event(event))) => {
                assert!((0.0..=1.0).contains(&event.confidence));
                seen.insert(event.detector);
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => break,
        }
    }
    assert_eq!(seen.len(), 3, "all mock detectors must emit, saw {seen:?}");

    let channel = tokio::time::timeout(std::time::Duration::from_secs(10), channels.recv())
        .await
        .expect("a channel update within 10 s")
        .expect("bus open");
    match channel {
        Message::Channel(update) => {
            assert!((0.0..=1.0).contains(&update.confidence));
            assert!(!update.sources.is_empty());
        }
        other => panic!("expected channel update, got {other:?}"),
    }

    let report = engine.status_report();
    assert!(!report.detectors.is_empty());

    engine.stop();
    let result = tokio::time::timeout(std::time::Duration::from_secs(10), runner)
        .await
        .expect("engine stops within budget")
        .expect("join");
    assert!(result.is_ok());
}
