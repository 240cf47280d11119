//! Websocket realtime channel speaking the Phoenix channel protocol (v1 JSON).

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::{ChangeKind, ChannelSpec, RealtimeChannel, RealtimeError, RowChange};

/// Phoenix closes idle sockets after 60s without a heartbeat
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// How long to wait for the server to acknowledge the join
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered changes before the channel applies backpressure
const CHANGE_BUFFER: usize = 32;

const JOIN_REF: &str = "1";

#[derive(Debug, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
}

fn topic_for(spec: &ChannelSpec) -> String {
    format!("realtime:{}", spec.name)
}

fn join_message(spec: &ChannelSpec) -> Value {
    json!({
        "topic": topic_for(spec),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "*",
                    "schema": spec.schema,
                    "table": spec.table,
                    "filter": spec.filter,
                }],
                "private": false,
            },
            "access_token": spec.access_token,
        },
        "ref": JOIN_REF,
        "join_ref": JOIN_REF,
    })
}

fn heartbeat_message(msg_ref: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
}

fn leave_message(topic: &str, msg_ref: u64) -> Value {
    json!({
        "topic": topic,
        "event": "phx_leave",
        "payload": {},
        "ref": msg_ref.to_string(),
        "join_ref": JOIN_REF,
    })
}

/// Outcome of the server's reply to our join, if `frame` is that reply.
fn join_reply(frame: &Frame, topic: &str) -> Option<Result<(), RealtimeError>> {
    if frame.event != "phx_reply" || frame.topic != topic || frame.msg_ref.as_deref() != Some(JOIN_REF)
    {
        return None;
    }
    match frame.payload.get("status").and_then(Value::as_str) {
        Some("ok") => Some(Ok(())),
        _ => {
            let reason = frame
                .payload
                .pointer("/response/reason")
                .and_then(Value::as_str)
                .unwrap_or("join refused");
            Some(Err(RealtimeError::JoinRejected(reason.to_string())))
        }
    }
}

/// Why the server ended our channel, if `frame` says it did. The socket may
/// stay open after this, so the caller must stop reading on its own.
fn channel_ended(frame: &Frame, topic: &str) -> Option<String> {
    if frame.topic != topic {
        return None;
    }
    match frame.event.as_str() {
        "phx_close" => Some("channel closed by server".to_string()),
        "phx_error" => Some("channel crashed on server".to_string()),
        "system" if frame.payload.get("status").and_then(Value::as_str) == Some("error") => Some(
            frame
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("system error")
                .to_string(),
        ),
        _ => None,
    }
}

/// Decode a `postgres_changes` frame for our topic.
fn decode_change(frame: &Frame, topic: &str) -> Option<RowChange> {
    if frame.event != "postgres_changes" || frame.topic != topic {
        return None;
    }
    let data = frame.payload.get("data")?;
    let kind = match data.get("type").and_then(Value::as_str)? {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };
    let new_record = data
        .get("record")
        .filter(|r| r.as_object().is_some_and(|o| !o.is_empty()))
        .cloned();
    Some(RowChange { kind, new_record })
}

pub struct PhoenixChannel {
    endpoint: String,
    anon_key: String,
}

impl PhoenixChannel {
    /// `endpoint` is the realtime base, e.g. `wss://<project>/realtime/v1`.
    pub fn new(endpoint: &str, anon_key: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
        }
    }

    fn socket_url(&self) -> Result<Url, RealtimeError> {
        Url::parse_with_params(
            &format!("{}/websocket", self.endpoint),
            &[("apikey", self.anon_key.as_str()), ("vsn", "1.0.0")],
        )
        .map_err(|e| RealtimeError::ConnectionFailed(format!("invalid realtime URL: {}", e)))
    }
}

#[async_trait]
impl RealtimeChannel for PhoenixChannel {
    async fn subscribe(&self, spec: ChannelSpec) -> Result<mpsc::Receiver<RowChange>, RealtimeError> {
        let url = self.socket_url()?;
        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let topic = topic_for(&spec);
        sink.send(Message::Text(join_message(&spec).to_string()))
            .await
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        let joined = tokio::time::timeout(JOIN_TIMEOUT, async {
            while let Some(message) = stream.next().await {
                let message = message.map_err(|e| RealtimeError::Protocol(e.to_string()))?;
                let Message::Text(text) = message else {
                    continue;
                };
                let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                    continue;
                };
                if let Some(outcome) = join_reply(&frame, &topic) {
                    return outcome;
                }
            }
            Err(RealtimeError::ConnectionFailed(
                "socket closed before join completed".to_string(),
            ))
        })
        .await;

        match joined {
            Ok(Ok(())) => info!(topic = %topic, table = %spec.table, "Realtime channel joined"),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(RealtimeError::ConnectionFailed(
                    "timed out waiting for join reply".to_string(),
                ))
            }
        }

        let (tx, rx) = mpsc::channel(CHANGE_BUFFER);

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            // The first tick completes immediately
            heartbeat.tick().await;
            let mut next_ref: u64 = 2;

            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(topic = %topic, "Realtime receiver dropped, leaving channel");
                        let leave = leave_message(&topic, next_ref).to_string();
                        let _ = sink.send(Message::Text(leave)).await;
                        let _ = sink.close().await;
                        break;
                    }
                    _ = heartbeat.tick() => {
                        let beat = heartbeat_message(next_ref).to_string();
                        next_ref += 1;
                        if let Err(e) = sink.send(Message::Text(beat)).await {
                            warn!(error = %e, "Realtime heartbeat failed");
                            break;
                        }
                    }
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            let frame = match serde_json::from_str::<Frame>(&text) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    debug!(error = %e, "Ignoring undecodable realtime frame");
                                    continue;
                                }
                            };
                            if let Some(reason) = channel_ended(&frame, &topic) {
                                warn!(topic = %topic, reason = %reason, "Realtime channel ended by server");
                                let _ = sink.close().await;
                                break;
                            }
                            if let Some(change) = decode_change(&frame, &topic) {
                                if tx.send(change).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(reason))) => {
                            info!(?reason, "Realtime socket closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Realtime socket error");
                            break;
                        }
                        None => {
                            info!("Realtime socket ended");
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
