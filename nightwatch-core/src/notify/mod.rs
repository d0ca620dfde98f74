//! Alert delivery: local audio alarm and push providers.
//!
//! The notifier subscribes to the alerts topic (one-way: the alert engine
//! never knows who listens) and the control topic (acknowledgments stop the
//! local alarm). Each sink is independent; a failing push provider never
//! blocks the tone, and vice versa.
//!
//! Pause semantics: while paused, fires are NOT dispatched to any sink —
//! including the local alarm — but resolutions still flow so state stays
//! clean. Alerts fired during a pause are not retroactively delivered on
//! resume.

pub mod audio;
pub mod push;

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::bus::{Message, Subscription};
use crate::engine::PauseState;
use crate::error::Result;
use crate::events::{Alert, ControlRequest};
use std::sync::Arc;

/// Remember this many delivered alert ids for duplicate suppression.
const DEDUP_HORIZON: usize = 256;

/// One delivery destination.
#[async_trait]
pub trait AlertSink: Send {
    fn name(&self) -> &'static str;

    /// Deliver a newly fired alert. Errors are recorded, never propagated
    /// past the notifier.
    async fn deliver(&mut self, alert: &Alert) -> Result<()>;

    /// The alert stopped being active (auto or operator resolution).
    async fn on_resolved(&mut self, alert: &Alert);

    /// The alert was acknowledged (local alarm stops, pushes ignore).
    async fn on_acknowledged(&mut self, _alert_id: &str) {}
}

pub struct Notifier {
    sinks: Vec<Box<dyn AlertSink>>,
    pause: Arc<PauseState>,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl Notifier {
    pub fn new(sinks: Vec<Box<dyn AlertSink>>, pause: Arc<PauseState>) -> Self {
        Self {
            sinks,
            pause,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Consume the alerts and control subscriptions until the bus closes.
    pub async fn run(mut self, mut alerts: Subscription, mut control: Subscription) {
        info!(sinks = self.sinks.len(), "notifier started");
        loop {
            tokio::select! {
                message = alerts.recv() => match message {
                    Some(Message::Alert(alert)) => self.handle_alert(alert).await,
                    Some(_) => {}
                    None => break,
                },
                message = control.recv() => match message {
                    Some(Message::Control(ControlRequest::Acknowledge { alert_id })) => {
                        for sink in &mut self.sinks {
                            sink.on_acknowledged(&alert_id).await;
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        info!("notifier stopped");
    }

    async fn handle_alert(&mut self, alert: Alert) {
        if alert.resolved {
            for sink in &mut self.sinks {
                sink.on_resolved(&alert).await;
            }
            return;
        }

        if self.pause.is_paused() {
            debug!(alert_id = %alert.alert_id, "paused — suppressing dispatch");
            return;
        }

        if !self.mark_seen(&alert.alert_id) {
            debug!(alert_id = %alert.alert_id, "duplicate fire suppressed");
            return;
        }

        for sink in &mut self.sinks {
            if let Err(e) = sink.deliver(&alert).await {
                // Recorded, not fatal: the next alert must still go out.
                error!(sink = sink.name(), alert_id = %alert.alert_id, error = %e, "delivery failed");
            }
        }
    }

    /// Returns false when the id was already dispatched recently.
    fn mark_seen(&mut self, alert_id: &str) -> bool {
        if self.seen.contains(alert_id) {
            return false;
        }
        self.seen.insert(alert_id.to_string());
        self.seen_order.push_back(alert_id.to_string());
        if self.seen_order.len() > DEDUP_HORIZON {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}
