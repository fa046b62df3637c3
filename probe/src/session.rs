//! Coordinator session.
//!
//! One persistent WebSocket to the coordinator carries everything: status
//! updates, measurement requests, progress and results. Frames are
//! two-element JSON arrays `["event:name", payload]`. The socket reconnects
//! forever with bounded jittered backoff; everything queued while the
//! socket was down is dropped on reconnect (in-flight measurements may
//! complete into a dead socket by design).

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use common::{
    AdoptionCode, ApiError, LocationInfo, MeasurementRequest, ProbeStatus, EV_ADOPTION_CODE,
    EV_API_ERROR, EV_CONNECT_LOCATION, EV_MEASUREMENT_ACK, EV_MEASUREMENT_REQUEST,
    EV_MEASUREMENT_RESULT, EV_SIGKILL,
};

use crate::handlers::{self, HandlerContext};
use crate::registry::JobRegistry;
use crate::status::StatusManager;

/// One outbound frame: event name plus its payload.
#[derive(Debug, Clone)]
pub struct WireEvent {
    pub name: &'static str,
    pub payload: Value,
}

/// Handle used by every producer of outbound events (buffers, status
/// manager, ack path). Writes are serialized by the single socket writer.
pub type EventSender = mpsc::UnboundedSender<WireEvent>;

/// Dependencies for inbound event dispatch.
pub struct SessionContext {
    pub registry: Arc<JobRegistry>,
    pub status: Arc<StatusManager>,
    pub handler: HandlerContext,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub api_host: String,
    pub ws_path: String,
    pub uuid: String,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

/// Run the session forever: connect, pump events, reconnect on any error.
pub async fn run_session(
    config: SessionConfig,
    ctx: Arc<SessionContext>,
    mut outbound: mpsc::UnboundedReceiver<WireEvent>,
) {
    loop {
        let url = handshake_url(&config);
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                tracing::info!("Connected to coordinator at {}", config.api_host);
                // stale events belong to the previous connection
                while outbound.try_recv().is_ok() {}
                ctx.status.emit_all();

                let (mut sink, mut stream) = socket.split();
                loop {
                    tokio::select! {
                        event = outbound.recv() => {
                            let Some(event) = event else { return };
                            let frame = serde_json::to_string(&json!([event.name, event.payload]))
                                .unwrap_or_default();
                            if sink.send(Message::Text(frame)).await.is_err() {
                                tracing::warn!("Coordinator socket write failed, reconnecting");
                                break;
                            }
                        }
                        message = stream.next() => {
                            match message {
                                Some(Ok(Message::Text(text))) => {
                                    handle_frame(&ctx, &text).await;
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                                    tracing::warn!("Coordinator socket closed, reconnecting");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!("Failed to connect to coordinator: {}", err);
            }
        }

        let backoff = jittered_backoff(config.backoff_min, config.backoff_max);
        tokio::time::sleep(backoff).await;
    }
}

fn jittered_backoff(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let spread = (max - min).as_millis() as u64;
    min + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

fn handshake_url(config: &SessionConfig) -> String {
    let query = common::HandshakeQuery {
        version: env!("CARGO_PKG_VERSION").to_string(),
        // set by build.rs from `rustc --version`
        runtime_version: env!("RUSTC_VERSION").to_string(),
        uuid: config.uuid.clone(),
        fake_ip: crate::fake::fake_ip(),
    };
    // every value is plain [a-zA-Z0-9.-] so no percent-encoding is needed
    let pairs = serde_json::to_value(&query)
        .ok()
        .and_then(|value| value.as_object().cloned())
        .map(|object| {
            object
                .iter()
                .map(|(key, value)| {
                    format!("{}={}", key, value.as_str().unwrap_or_default())
                })
                .collect::<Vec<_>>()
                .join("&")
        })
        .unwrap_or_default();
    format!("{}{}?{}", config.api_host, config.ws_path, pairs)
}

async fn handle_frame(ctx: &Arc<SessionContext>, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        tracing::warn!("Unparseable frame from coordinator: {}", text);
        return;
    };
    let Some(event_name) = frame.get(0).and_then(|v| v.as_str()) else {
        tracing::warn!("Frame without event name: {}", text);
        return;
    };
    let payload = frame.get(1).cloned().unwrap_or(Value::Null);

    match event_name {
        EV_CONNECT_LOCATION => {
            if let Ok(location) = serde_json::from_value::<LocationInfo>(payload) {
                tracing::info!(
                    "Coordinator placed this probe in {}, {} ({})",
                    location.city,
                    location.country,
                    location.continent
                );
            }
        }
        EV_ADOPTION_CODE => {
            if let Ok(adoption) = serde_json::from_value::<AdoptionCode>(payload) {
                tracing::info!("Adoption code: {}", adoption.code);
            }
        }
        EV_API_ERROR => match serde_json::from_value::<ApiError>(payload) {
            Ok(error) => tracing::error!(
                "Coordinator error {} (probe: {:?}, cause: {:?})",
                error.info.code,
                error.info.probe,
                error.info.cause
            ),
            Err(_) => tracing::error!("Coordinator error with unknown payload"),
        },
        EV_SIGKILL => {
            tracing::warn!("Received sigkill from coordinator, exiting");
            std::process::exit(0);
        }
        EV_MEASUREMENT_REQUEST => handle_measurement(ctx, payload).await,
        other => tracing::debug!("Ignoring unknown event {}", other),
    }
}

async fn handle_measurement(ctx: &Arc<SessionContext>, payload: Value) {
    if ctx.status.current() != ProbeStatus::Ready {
        tracing::warn!(
            "Dropping measurement request while status is {}",
            ctx.status.current().as_str()
        );
        return;
    }

    let request = match serde_json::from_value::<MeasurementRequest>(payload.clone()) {
        Ok(request) => request,
        Err(err) => {
            reject_invalid_request(ctx, &payload, &err);
            return;
        }
    };

    let _ = ctx.handler.tx.send(WireEvent {
        name: EV_MEASUREMENT_ACK,
        payload: json!({
            "measurementId": request.measurement_id,
            "testId": request.test_id,
        }),
    });

    ctx.registry.insert(&request.measurement_id);
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        handlers::dispatch(
            &ctx.handler,
            &request.measurement_id,
            &request.test_id,
            request.measurement,
        )
        .await;
        ctx.registry.remove(&request.measurement_id);
    });
}

/// Schema failures still owe the coordinator exactly one result, and no
/// progress.
fn reject_invalid_request(ctx: &SessionContext, payload: &Value, err: &serde_json::Error) {
    let measurement_id = payload.get("measurementId").and_then(|v| v.as_str());
    let test_id = payload.get("testId").and_then(|v| v.as_str());
    match (measurement_id, test_id) {
        (Some(measurement_id), Some(test_id)) => {
            tracing::warn!("Invalid measurement request {}: {}", measurement_id, err);
            let _ = ctx.handler.tx.send(WireEvent {
                name: EV_MEASUREMENT_RESULT,
                payload: json!({
                    "measurementId": measurement_id,
                    "testId": test_id,
                    "result": {
                        "status": "failed",
                        "rawOutput": format!("Invalid options: {}", err),
                    },
                }),
            });
        }
        _ => tracing::warn!("Unaddressable measurement request: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::EV_STATUS_UPDATE;

    fn test_context() -> (Arc<SessionContext>, mpsc::UnboundedReceiver<WireEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(JobRegistry::new());
        let status = Arc::new(StatusManager::new(tx.clone()));
        let ctx = Arc::new(SessionContext {
            registry,
            status,
            handler: HandlerContext {
                tx,
                command_timeout: Duration::from_secs(30),
            },
        });
        (ctx, rx)
    }

    #[test]
    fn handshake_url_carries_identity() {
        let config = SessionConfig {
            api_host: "ws://localhost:3000".to_string(),
            ws_path: "/probes".to_string(),
            uuid: "abc-123".to_string(),
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_millis(500),
        };
        let url = handshake_url(&config);
        assert!(url.starts_with("ws://localhost:3000/probes?"));
        assert!(url.contains("uuid=abc-123"));
        assert!(url.contains("runtimeVersion="));
        assert!(url.contains(&format!("version={}", env!("CARGO_PKG_VERSION"))));
    }

    #[test]
    fn backoff_stays_within_bounds() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        for _ in 0..100 {
            let backoff = jittered_backoff(min, max);
            assert!(backoff >= min && backoff <= max);
        }
        assert_eq!(jittered_backoff(min, min), min);
    }

    #[tokio::test]
    async fn requests_are_dropped_unless_ready() {
        let (ctx, mut rx) = test_context();
        let payload = json!({
            "measurementId": "m1",
            "testId": "t1",
            "measurement": { "type": "ping", "target": "example.com" }
        });
        handle_measurement(&ctx, payload).await;
        assert!(rx.try_recv().is_err(), "no ack while initializing");
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn invalid_options_get_a_failed_result_and_no_progress() {
        let (ctx, mut rx) = test_context();
        force_ready(&ctx, &mut rx).await;

        let payload = json!({
            "measurementId": "m2",
            "testId": "t2",
            "measurement": { "type": "teleport", "target": "example.com" }
        });
        handle_measurement(&ctx, payload).await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, EV_MEASUREMENT_RESULT);
        assert_eq!(event.payload["measurementId"], "m2");
        assert_eq!(event.payload["result"]["status"], "failed");
        let raw = event.payload["result"]["rawOutput"].as_str().unwrap();
        assert!(raw.starts_with("Invalid options:"));
        assert!(rx.try_recv().is_err(), "exactly one event");
    }

    #[tokio::test]
    async fn valid_requests_ack_then_register() {
        let (ctx, mut rx) = test_context();
        force_ready(&ctx, &mut rx).await;

        let payload = json!({
            "measurementId": "m3",
            "testId": "t3",
            "measurement": { "type": "ping", "target": "fake.example" }
        });
        handle_measurement(&ctx, payload).await;

        let ack = rx.try_recv().unwrap();
        assert_eq!(ack.name, EV_MEASUREMENT_ACK);
        assert_eq!(ack.payload["measurementId"], "m3");

        // handler task runs to completion and clears the registry
        let result = loop {
            match rx.recv().await {
                Some(event) if event.name == EV_MEASUREMENT_RESULT => break event,
                Some(_) => continue,
                None => panic!("channel closed before result"),
            }
        };
        assert_eq!(result.payload["measurementId"], "m3");
        for _ in 0..100 {
            if ctx.registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ctx.registry.is_empty());
    }

    /// The real self-test needs the system tools; the canned-commands path
    /// exercises the same state machine hermetically. The env flag stays
    /// set for the whole test process, which the other tests tolerate.
    async fn force_ready(ctx: &Arc<SessionContext>, rx: &mut mpsc::UnboundedReceiver<WireEvent>) {
        std::env::set_var("FAKE_COMMANDS", "1");
        ctx.status.run_self_test(Duration::from_secs(5)).await;
        while rx.try_recv().is_ok() {}
        assert_eq!(ctx.status.current(), ProbeStatus::Ready);
    }

    #[test]
    fn frame_shape_is_event_name_plus_payload() {
        let frame = serde_json::to_string(&json!([EV_STATUS_UPDATE, "ready"])).unwrap();
        assert_eq!(frame, r#"["probe:status:update","ready"]"#);
    }

    #[tokio::test]
    async fn full_round_trip_over_a_local_socket() {
        std::env::set_var("FAKE_COMMANDS", "1");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Coordinator side: accept, watch the status announcement, dispatch
        // one measurement, wait for ack + result.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();

            let mut saw_ready = false;
            let mut saw_ack = false;
            let mut requested = false;
            let mut result = None;
            while let Some(Ok(message)) = socket.next().await {
                let Message::Text(text) = message else { continue };
                let frame: Value = serde_json::from_str(&text).unwrap();
                match frame[0].as_str().unwrap() {
                    common::EV_STATUS_UPDATE if frame[1] == "ready" => {
                        saw_ready = true;
                        if !requested {
                            requested = true;
                            let request = json!([
                                common::EV_MEASUREMENT_REQUEST,
                                {
                                    "measurementId": "e2e-1",
                                    "testId": "t1",
                                    "measurement": {
                                        "type": "ping",
                                        "target": "fake.example",
                                        "inProgressUpdates": true
                                    }
                                }
                            ]);
                            socket
                                .send(Message::Text(request.to_string()))
                                .await
                                .unwrap();
                        }
                    }
                    common::EV_MEASUREMENT_ACK => saw_ack = true,
                    common::EV_MEASUREMENT_RESULT => {
                        result = Some(frame[1].clone());
                        break;
                    }
                    _ => {}
                }
            }
            (saw_ready, saw_ack, result)
        });

        let (ctx, session_task) = {
            // the session must write into the same channel the context uses
            let (tx, rx) = mpsc::unbounded_channel();
            let registry = Arc::new(JobRegistry::new());
            let status = Arc::new(StatusManager::new(tx.clone()));
            status.run_self_test(Duration::from_secs(5)).await;
            assert_eq!(status.current(), ProbeStatus::Ready);
            let ctx = Arc::new(SessionContext {
                registry,
                status,
                handler: HandlerContext {
                    tx,
                    command_timeout: Duration::from_secs(5),
                },
            });
            let config = SessionConfig {
                api_host: format!("ws://127.0.0.1:{}", port),
                ws_path: "/probes".to_string(),
                uuid: "e2e-uuid".to_string(),
                backoff_min: Duration::from_millis(100),
                backoff_max: Duration::from_millis(500),
            };
            let session = tokio::spawn(run_session(config, Arc::clone(&ctx), rx));
            (ctx, session)
        };

        let (saw_ready, saw_ack, result) =
            tokio::time::timeout(Duration::from_secs(10), server)
                .await
                .expect("round trip finished in time")
                .unwrap();
        assert!(saw_ready);
        assert!(saw_ack);
        let result = result.expect("one result arrived");
        assert_eq!(result["measurementId"], "e2e-1");
        assert_eq!(result["result"]["status"], "finished");
        for _ in 0..100 {
            if ctx.registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ctx.registry.is_empty());
        session_task.abort();
    }
}
