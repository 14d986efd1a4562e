//! WebSocket surface — auth, channel subscriptions, and event fan-out.
//!
//! One task per connection; outbound frames come from the bounded
//! per-subscriber sinks in `bus.rs`, so a slow consumer only ever
//! loses its own oldest frames. The server pings every 30 seconds and
//! drops the connection after two unanswered pings.

use crate::api::AppState;
use crate::bus::{Channel, EventSink, Subscription};
use crate::config::Config;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PONGS: u32 = 2;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Auth {
        api_key: String,
    },
    Subscribe {
        channel: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    Unsubscribe {
        channel: String,
        #[serde(default)]
        session_id: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlFrame {
    Authenticated {
        success: bool,
        client_id: String,
    },
    Subscribed {
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Unsubscribed {
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
}

pub async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct Connection {
    state: Arc<AppState>,
    client_id: String,
    authenticated: bool,
    /// Channel key → bus subscription.
    subs: HashMap<String, Subscription>,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = format!("client-{}", Uuid::new_v4());
    info!(client_id = %client_id, "websocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut conn = Connection {
        state: state.clone(),
        client_id: client_id.clone(),
        authenticated: false,
        subs: HashMap::new(),
    };

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // the first tick fires immediately
    let mut unanswered_pings: u32 = 0;

    loop {
        // Snapshot the sinks so the select future does not hold a
        // borrow of the connection while a branch mutates it.
        let sinks: Vec<Arc<EventSink>> = conn.subs.values().map(|s| s.sink.clone()).collect();
        tokio::select! {
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !conn.handle_text(&text, &mut sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        unanswered_pings = 0;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client_id = %client_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if unanswered_pings >= MAX_MISSED_PONGS {
                    warn!(client_id = %client_id, "websocket unresponsive; closing");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                unanswered_pings += 1;
            }
            event = next_event(&sinks) => {
                // Surface any overflow before the frame that follows it.
                let dropped: u64 = conn.subs.values().map(|s| s.sink.take_dropped()).sum();
                if dropped > 0 {
                    let notice = ControlFrame::Error {
                        code: "events_dropped".into(),
                        message: format!("{dropped} events dropped on a slow connection"),
                    };
                    if send_json(&mut sender, &notice).await.is_err() {
                        break;
                    }
                }
                if send_raw(&mut sender, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    state.bus.drop_client(&client_id);
    info!(client_id = %client_id, "websocket disconnected");
}

/// Wait for the next event on any of the connection's sinks. Pends
/// forever while there are no subscriptions.
async fn next_event(sinks: &[Arc<EventSink>]) -> crate::bus::BusEvent {
    if sinks.is_empty() {
        return std::future::pending().await;
    }
    let futures: Vec<_> = sinks.iter().map(|s| Box::pin(s.recv())).collect();
    futures::future::select_all(futures).await.0
}

impl Connection {
    /// Handle one inbound text frame. Returns `false` to close the
    /// connection.
    async fn handle_text(
        &mut self,
        text: &str,
        sender: &mut SplitSink<WebSocket, Message>,
    ) -> bool {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                let err = ControlFrame::Error {
                    code: "invalid_frame".into(),
                    message: e.to_string(),
                };
                return send_json(sender, &err).await.is_ok();
            }
        };

        let reply = match frame {
            ClientFrame::Auth { api_key } => {
                self.authenticated = key_is_valid(&self.state.config, &api_key);
                if !self.authenticated {
                    warn!(client_id = %self.client_id, "websocket auth failed");
                }
                ControlFrame::Authenticated {
                    success: self.authenticated,
                    client_id: self.client_id.clone(),
                }
            }
            ClientFrame::Subscribe {
                channel,
                session_id,
            } => self.subscribe(channel, session_id),
            ClientFrame::Unsubscribe {
                channel,
                session_id,
            } => self.unsubscribe(channel, session_id),
        };
        send_json(sender, &reply).await.is_ok()
    }

    fn subscribe(&mut self, channel: String, session_id: Option<String>) -> ControlFrame {
        if !self.authenticated {
            return ControlFrame::Error {
                code: "unauthenticated".into(),
                message: "authenticate before subscribing".into(),
            };
        }
        let (key, bus_channel) = match resolve_channel(&channel, session_id.as_deref()) {
            Ok(pair) => pair,
            Err(frame) => return frame,
        };
        if let Channel::Session(sid) = &bus_channel {
            if self.state.store.get(sid).is_none() {
                return ControlFrame::Error {
                    code: "not_found".into(),
                    message: format!("session {sid}"),
                };
            }
        }
        match self.state.bus.subscribe(&self.client_id, bus_channel) {
            Ok(sub) => {
                self.subs.insert(key, sub);
                ControlFrame::Subscribed {
                    channel,
                    session_id,
                }
            }
            Err(e) => ControlFrame::Error {
                code: e.code().into(),
                message: e.to_string(),
            },
        }
    }

    fn unsubscribe(&mut self, channel: String, session_id: Option<String>) -> ControlFrame {
        let (key, _) = match resolve_channel(&channel, session_id.as_deref()) {
            Ok(pair) => pair,
            Err(frame) => return frame,
        };
        if let Some(sub) = self.subs.remove(&key) {
            self.state.bus.unsubscribe(sub.id);
        }
        ControlFrame::Unsubscribed {
            channel,
            session_id,
        }
    }
}

fn resolve_channel(
    channel: &str,
    session_id: Option<&str>,
) -> Result<(String, Channel), ControlFrame> {
    match channel {
        "event" => Ok(("event".into(), Channel::Global)),
        "session" => {
            let sid = session_id.ok_or_else(|| ControlFrame::Error {
                code: "invalid_frame".into(),
                message: "session channel requires session_id".into(),
            })?;
            Ok((format!("session:{sid}"), Channel::Session(sid.to_string())))
        }
        other => Err(ControlFrame::Error {
            code: "invalid_frame".into(),
            message: format!("unknown channel '{other}'"),
        }),
    }
}

fn key_is_valid(config: &Config, presented: &str) -> bool {
    config.api_keys.is_empty() || config.api_keys.iter().any(|k| k == presented)
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ControlFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    sender.send(Message::Text(text)).await
}

async fn send_raw(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &crate::bus::BusEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    sender.send(Message::Text(text)).await
}

// ── Tests ───────────────────────────────────────────────────────
