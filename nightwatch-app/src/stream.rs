//! Local stream endpoint for external bridges.
//!
//! A TCP listener (loopback by default) speaking newline-delimited JSON
//! envelopes: every event, channel update and alert, plus a periodic
//! status report. The dashboard bridge is one such client; the core runs
//! identically with zero clients attached.
//!
//! Clients may also write control requests, one JSON object per line
//! (`{"type": "acknowledge", "alert_id": "…"}`); each gets a one-line
//! reply. Unknown request types are rejected with an error reply.

use std::sync::Arc;
use std::time::Duration;

use nightwatch_core::bus::{Message, Topic};
use nightwatch_core::{Envelope, NightwatchEngine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Cadence of unsolicited status envelopes.
const STATUS_PERIOD: Duration = Duration::from_secs(5);

pub async fn serve(addr: String, engine: Arc<NightwatchEngine>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "stream endpoint listening");
    loop {
        let (socket, peer) = listener.accept().await?;
        info!(%peer, "bridge connected");
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = serve_client(socket, engine).await {
                debug!(%peer, error = %e, "bridge disconnected");
            }
        });
    }
}

async fn serve_client(socket: TcpStream, engine: Arc<NightwatchEngine>) -> anyhow::Result<()> {
    let bus = engine.bus();
    let mut events = bus.subscribe(Topic::Events, "stream-events");
    let mut channels = bus.subscribe(Topic::Channels, "stream-channels");
    let mut alerts = bus.subscribe(Topic::Alerts, "stream-alerts");

    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut status = tokio::time::interval(STATUS_PERIOD);

    loop {
        let line = tokio::select! {
            message = events.recv() => match message {
                Some(Message::Event(event)) => encode(&Envelope::Event(event))?,
                Some(_) => continue,
                None => break,
            },
            message = channels.recv() => match message {
                Some(Message::Channel(channel)) => encode(&Envelope::Channel(channel))?,
                Some(_) => continue,
                None => break,
            },
            message = alerts.recv() => match message {
                Some(Message::Alert(alert)) => encode(&Envelope::Alert(alert))?,
                Some(_) => continue,
                None => break,
            },
            _ = status.tick() => encode(&Envelope::Status(engine.status_report()))?,
            request = lines.next_line() => match request? {
                Some(raw) => {
                    let reply = handle_request(&engine, &raw);
                    serde_json::to_string(&reply)? + "\n"
                }
                None => break,
            },
        };
        writer.write_all(line.as_bytes()).await?;
    }
    Ok(())
}

fn encode(envelope: &Envelope) -> anyhow::Result<String> {
    Ok(serde_json::to_string(envelope)? + "\n")
}

/// Parse and apply one control line. Unknown types never panic the
/// endpoint; they come back as an error reply.
fn handle_request(engine: &NightwatchEngine, raw: &str) -> serde_json::Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return serde_json::json!({ "ok": false, "error": "empty request" });
    }
    match serde_json::from_str(raw) {
        Ok(request) => engine.handle_control(request),
        Err(e) => {
            warn!(error = %e, "rejected control request");
            serde_json::json!({ "ok": false, "error": format!("unknown or malformed request: {e}") })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightwatch_core::clock::ManualClock;
    use nightwatch_core::Config;

    fn engine() -> Arc<NightwatchEngine> {
        let config = Config::from_yaml("mock_sensors: true\n").expect("config");
        Arc::new(NightwatchEngine::new(config, ManualClock::shared(0.0)))
    }

    #[test]
    fn malformed_requests_get_error_replies() {
        let engine = engine();
        let reply = handle_request(&engine, "{\"type\": \"reboot\"}");
        assert_eq!(reply["ok"], false);

        let reply = handle_request(&engine, "not json");
        assert_eq!(reply["ok"], false);

        let reply = handle_request(&engine, "");
        assert_eq!(reply["ok"], false);
    }

    #[test]
    fn valid_control_requests_are_applied() {
        let engine = engine();
        let reply = handle_request(&engine, "{\"type\": \"pause\", \"minutes\": 15}");
        assert_eq!(reply["ok"], true);
        assert!(engine.pause_state().is_paused());

        let reply = handle_request(&engine, "{\"type\": \"resume\"}");
        assert_eq!(reply["ok"], true);
        assert!(!engine.pause_state().is_paused());
    }

    #[tokio::test]
    async fn clients_receive_published_envelopes() {
        let engine = engine();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = serve_client(socket, server_engine).await;
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let (reader, _writer) = client.into_split();
        let mut lines = BufReader::new(reader).lines();

        // Give the client subscription time to register, then publish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let reply = engine.handle_control(nightwatch_core::ControlRequest::TestAlert {
            severity: nightwatch_core::AlertLevel::Warning,
        });
        let expected_id = reply["alertId"].as_str().unwrap().to_string();

        // The endpoint interleaves periodic status envelopes; scan for the
        // alert among the first few lines.
        let mut found = false;
        for _ in 0..5 {
            let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
                .await
                .expect("line before timeout")
                .expect("read")
                .expect("open stream");
            let envelope: serde_json::Value = serde_json::from_str(&line).unwrap();
            if envelope["type"] == "alert" {
                assert_eq!(envelope["payload"]["alertId"], expected_id.as_str());
                found = true;
                break;
            }
            assert_eq!(envelope["type"], "status");
        }
        assert!(found, "alert envelope never arrived");
    }
}
