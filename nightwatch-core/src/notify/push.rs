//! Push delivery over HTTP.
//!
//! One sink per configured provider. Delivery is attempted up to three
//! times (1 s, 5 s, 15 s between attempts); a 4xx response is a
//! configuration problem and is not retried, 5xx and timeouts are. All
//! attempts share the alert's id, and an id that has been delivered once
//! is never posted again.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{NightwatchError, Result};
use crate::events::{Alert, AlertLevel};
use crate::notify::AlertSink;

/// Bounded retry: three attempts, backing off 1 s / 5 s / 15 s.
const MAX_ATTEMPTS: usize = 3;
const BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
];

/// Hard ceiling on any single HTTP exchange.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider-specific request shaping.
#[derive(Debug, Clone)]
pub enum PushProvider {
    Pushover {
        token: String,
        user: String,
    },
    Ntfy {
        server: String,
        topic: String,
    },
    Webhook {
        url: String,
    },
}

impl PushProvider {
    fn describe(&self) -> &'static str {
        match self {
            PushProvider::Pushover { .. } => "pushover",
            PushProvider::Ntfy { .. } => "ntfy",
            PushProvider::Webhook { .. } => "webhook",
        }
    }

    fn request(&self, client: &reqwest::Client, alert: &Alert) -> reqwest::RequestBuilder {
        match self {
            PushProvider::Pushover { token, user } => client
                .post("https://api.pushover.net/1/messages.json")
                .form(&[
                    ("token", token.as_str()),
                    ("user", user.as_str()),
                    ("title", &format!("Nightwatch: {}", alert.rule_name)),
                    ("message", &alert.message),
                    (
                        "priority",
                        match alert.level {
                            AlertLevel::Warning => "0",
                            AlertLevel::Critical => "1",
                        },
                    ),
                ]),
            PushProvider::Ntfy { server, topic } => client
                .post(format!("{}/{}", server.trim_end_matches('/'), topic))
                .header("Title", format!("Nightwatch: {}", alert.rule_name))
                .header(
                    "Priority",
                    match alert.level {
                        AlertLevel::Warning => "default",
                        AlertLevel::Critical => "urgent",
                    },
                )
                .body(alert.message.clone()),
            PushProvider::Webhook { url } => client.post(url).json(&json!({
                "alertId": alert.alert_id,
                "rule": alert.rule_name,
                "level": alert.level,
                "source": alert.source,
                "message": alert.message,
                "triggeredAt": alert.triggered_at,
            })),
        }
    }
}

/// Whether a failed attempt is worth repeating.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Retryable(String),
    NonRetryable(String),
}

fn classify(result: std::result::Result<reqwest::StatusCode, String>) -> Outcome {
    match result {
        Ok(status) if status.is_success() => Outcome::Delivered,
        Ok(status) if status.is_client_error() => {
            Outcome::NonRetryable(format!("provider rejected request: {status}"))
        }
        Ok(status) => Outcome::Retryable(format!("provider error: {status}")),
        // Connect failures and timeouts are transient by assumption.
        Err(e) => Outcome::Retryable(e),
    }
}

pub struct PushSink {
    provider: PushProvider,
    client: reqwest::Client,
    delivered: HashSet<String>,
}

impl PushSink {
    pub fn new(provider: PushProvider) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            provider,
            client,
            delivered: HashSet::new(),
        }
    }

    async fn attempt(&self, alert: &Alert) -> Outcome {
        let result = self
            .provider
            .request(&self.client, alert)
            .send()
            .await
            .map(|response| response.status())
            .map_err(|e| e.to_string());
        classify(result)
    }
}

#[async_trait]
impl AlertSink for PushSink {
    fn name(&self) -> &'static str {
        self.provider.describe()
    }

    async fn deliver(&mut self, alert: &Alert) -> Result<()> {
        if self.delivered.contains(&alert.alert_id) {
            debug!(alert_id = %alert.alert_id, "already delivered, suppressing duplicate");
            return Ok(());
        }

        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            match self.attempt(alert).await {
                Outcome::Delivered => {
                    info!(provider = self.name(), alert_id = %alert.alert_id, attempt, "push delivered");
                    self.delivered.insert(alert.alert_id.clone());
                    return Ok(());
                }
                Outcome::NonRetryable(reason) => {
                    warn!(provider = self.name(), alert_id = %alert.alert_id, %reason, "push rejected");
                    return Err(NightwatchError::Delivery(reason));
                }
                Outcome::Retryable(reason) => {
                    last_error = reason;
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                let delay = BACKOFF[attempt];
                debug!(provider = self.name(), ?delay, error = %last_error, "push retry scheduled");
                tokio::time::sleep(delay).await;
            }
        }
        warn!(provider = self.name(), alert_id = %alert.alert_id, error = %last_error, "push attempts exhausted");
        Err(NightwatchError::Delivery(last_error))
    }

    async fn on_resolved(&mut self, _alert: &Alert) {
        // Push providers get fire notifications only; resolution fan-out is
        // the stream endpoint's job.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_4xx_and_5xx_classify_correctly() {
        assert_eq!(
            classify(Ok(reqwest::StatusCode::OK)),
            Outcome::Delivered
        );
        assert!(matches!(
            classify(Ok(reqwest::StatusCode::BAD_REQUEST)),
            Outcome::NonRetryable(_)
        ));
        assert!(matches!(
            classify(Ok(reqwest::StatusCode::UNAUTHORIZED)),
            Outcome::NonRetryable(_)
        ));
        assert!(matches!(
            classify(Ok(reqwest::StatusCode::INTERNAL_SERVER_ERROR)),
            Outcome::Retryable(_)
        ));
        assert!(matches!(
            classify(Ok(reqwest::StatusCode::SERVICE_UNAVAILABLE)),
            Outcome::Retryable(_)
        ));
        assert!(matches!(
            classify(Err("connection timed out".into())),
            Outcome::Retryable(_)
        ));
    }

    #[test]
    fn retry_schedule_matches_the_contract() {
        assert_eq!(MAX_ATTEMPTS, 3);
        assert_eq!(BACKOFF[0], Duration::from_secs(1));
        assert_eq!(BACKOFF[1], Duration::from_secs(5));
        assert_eq!(BACKOFF[2], Duration::from_secs(15));
    }

    #[tokio::test]
    async fn delivered_ids_are_not_reposted() {
        // A webhook pointed at a closed port: every attempt is retryable
        // failure, but a pre-seeded delivered id short-circuits before any
        // network activity.
        let mut sink = PushSink::new(PushProvider::Webhook {
            url: "http://127.0.0.1:1/unreachable".into(),
        });
        sink.delivered.insert("seen".into());

        let alert = Alert {
            alert_id: "seen".into(),
            rule_name: "rule".into(),
            level: AlertLevel::Warning,
            source: "test".into(),
            message: "msg".into(),
            triggered_at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            acknowledged_at: None,
            resolved: false,
            resolved_at: None,
        };
        assert!(sink.deliver(&alert).await.is_ok());
    }

    #[test]
    fn ntfy_url_joins_cleanly() {
        let provider = PushProvider::Ntfy {
            server: "https://ntfy.sh/".into(),
            topic: "nightwatch-alerts".into(),
        };
        let client = reqwest::Client::new();
        let alert = Alert {
            alert_id: "a".into(),
            rule_name: "rule".into(),
            level: AlertLevel::Critical,
            source: "test".into(),
            message: "msg".into(),
            triggered_at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            acknowledged_at: None,
            resolved: false,
            resolved_at: None,
        };
        let request = provider.request(&client, &alert).build().unwrap();
        assert_eq!(
            request.url().as_str(),
            "https://ntfy.sh/nightwatch-alerts"
        );
    }
}
