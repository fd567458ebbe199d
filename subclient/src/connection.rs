//! WebSocket connection manager for the Polaris GraphQL subscription.
//!
//! Speaks `graphql-transport-ws` over WSS and keeps one subscription alive
//! across network faults:
//!
//! ```text
//! Idle → Dialing → Authenticating → Subscribed → Draining → Backoff → Dialing …
//! ```
//!
//! `next` and `error` frames are handed downstream as [`RawMessage`]s over a
//! bounded channel; when the channel is full the manager stops reading the
//! socket, which pushes back on the server through the TCP window. Lifecycle
//! transitions (`ws_connected`, `ws_disconnected`, `ws_error`,
//! `ws_reconnecting`) are logged, never emitted as records.
//!
//! Reconnects are unbounded. Auth rejections reconnect like any other fault
//! — whether to stop is the operator's call, not this process's.

use crate::backoff::BackoffConfig;
use crate::config::PolarisConfig;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use polaris_core::{RawMessage, Result, SubclientError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// The device state-change subscription document.
pub const DEVICES_SUBSCRIPTION: &str = "\
subscription DevicesSubscription {
  devices {
    id
    label
    tags {
      key
      value
    }
    lastPosition {
      position {
        llaDec {
          lat
          lon
          alt
        }
      }
      timestamp
    }
    services {
      rtk {
        enabled
        connectionStatus
      }
    }
  }
}";

/// Bound on the TCP+TLS+WS handshake.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Await `connection_ack` at most this long before tearing down.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Send a protocol ping after this much inbound silence.
const IDLE_PING_AFTER: Duration = Duration::from_secs(30);
/// After a ping, wait this long for any frame before declaring the
/// connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(15);
/// A connection alive at least this long resets the backoff attempt counter.
const STABLE_AFTER: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events handed to the pipeline over the bounded channel.
///
/// Session boundaries travel in-band with the frames, so ordering across a
/// reconnect is a property of the channel itself.
#[derive(Debug)]
pub enum SessionEvent {
    /// A subscription was established; downstream per-session state resets.
    Started {
        /// Client-generated UUIDv4 for this session.
        subscription_id: Arc<str>,
    },
    /// One data-bearing frame (`next` or `error`, or bytes that failed even
    /// protocol-level parsing).
    Frame(RawMessage),
    /// The session is gone; nothing more will arrive for it.
    Ended,
}

/// States of the reconnect machine. Held for logging and assertions — the
/// control flow itself lives in [`ConnectionManager::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Dialing,
    Authenticating,
    Subscribed,
    Draining,
    Backoff,
}

/// How a session ended, from the run loop's perspective.
enum SessionEnd {
    /// External shutdown; exit the run loop.
    Shutdown,
    /// Anything else; reconnect after backoff.
    Reconnect,
}

/// Owns the socket lifecycle and produces [`SessionEvent`]s.
pub struct ConnectionManager {
    config: PolarisConfig,
    backoff: BackoffConfig,
    state: ConnectionState,
    /// Completed reconnect attempts since the last stable connection.
    attempt: u32,
    /// True once any session reached `Subscribed` (dry-run gate).
    session_established: bool,
    /// When the current session reached `Subscribed`.
    connected_at: Option<Instant>,
    /// Fail instead of backing off before the first session (dry-run).
    fail_fast: bool,
    tx: mpsc::Sender<SessionEvent>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionManager {
    pub fn new(
        config: PolarisConfig,
        tx: mpsc::Sender<SessionEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let backoff = BackoffConfig::from(&config.reconnect);
        Self {
            config,
            backoff,
            state: ConnectionState::Idle,
            attempt: 0,
            session_established: false,
            connected_at: None,
            fail_fast: false,
            tx,
            shutdown,
        }
    }

    /// Error out instead of reconnecting if no session has ever been
    /// established. Used by `--dry-run` so a bad endpoint exits promptly.
    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    /// Run until shutdown. Never returns an error in normal service; only
    /// `fail_fast` mode surfaces connect failures to the caller.
    pub async fn run(mut self) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let end = self.run_session().await;

            // A quick flap keeps climbing the backoff curve.
            if let Some(connected_at) = self.connected_at.take() {
                if connected_at.elapsed() >= STABLE_AFTER {
                    self.attempt = 0;
                }
            }

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Reconnect => {
                    if self.fail_fast && !self.session_established {
                        return Err(SubclientError::ConnectFailed(format!(
                            "could not establish a session with {}",
                            self.config.api_url
                        )));
                    }
                    if self.wait_backoff().await {
                        break;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Idle);
        info!("ws_shutdown");
        Ok(())
    }

    /// One full dial → authenticate → subscribe → receive cycle.
    async fn run_session(&mut self) -> SessionEnd {
        self.set_state(ConnectionState::Dialing);

        let mut ws = match self.dial().await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "ws_error");
                return SessionEnd::Reconnect;
            }
        };

        self.set_state(ConnectionState::Authenticating);
        if let Err(reason) = self.authenticate(&mut ws).await {
            warn!(error = %reason, "ws_error");
            let _ = ws.close(None).await;
            return SessionEnd::Reconnect;
        }

        let subscription_id: Arc<str> = Arc::from(uuid::Uuid::new_v4().to_string());
        let subscribe = serde_json::json!({
            "id": &*subscription_id,
            "type": "subscribe",
            "payload": { "query": DEVICES_SUBSCRIPTION },
        });
        if let Err(e) = ws.send(Message::Text(subscribe.to_string())).await {
            warn!(error = %e, "ws_error");
            return SessionEnd::Reconnect;
        }

        self.set_state(ConnectionState::Subscribed);
        self.session_established = true;
        self.connected_at = Some(Instant::now());
        info!(subscription_id = %subscription_id, "ws_connected");

        if self
            .tx
            .send(SessionEvent::Started {
                subscription_id: Arc::clone(&subscription_id),
            })
            .await
            .is_err()
        {
            // Pipeline gone; nothing left to feed.
            return SessionEnd::Shutdown;
        }

        let end = self.receive_loop(&mut ws, &subscription_id).await;

        self.set_state(ConnectionState::Draining);
        let _ = self.tx.send(SessionEvent::Ended).await;
        let _ = ws.close(None).await;

        if matches!(end, SessionEnd::Reconnect) {
            info!(subscription_id = %subscription_id, "ws_disconnected");
        }
        end
    }

    async fn dial(&self) -> std::result::Result<WsStream, String> {
        let mut request = self
            .config
            .api_url
            .as_str()
            .into_client_request()
            .map_err(|e| format!("invalid api_url: {e}"))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("graphql-transport-ws"),
        );

        let (ws, _response) =
            tokio::time::timeout(DIAL_TIMEOUT, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| "dial timed out".to_string())?
                .map_err(|e| format!("dial failed: {e}"))?;
        Ok(ws)
    }

    /// Send `connection_init` and wait for `connection_ack`.
    async fn authenticate(&mut self, ws: &mut WsStream) -> std::result::Result<(), String> {
        let init = serde_json::json!({
            "type": "connection_init",
            "payload": { "Authorization": format!("Bearer {}", self.config.api_key) },
        });
        ws.send(Message::Text(init.to_string()))
            .await
            .map_err(|e| format!("connection_init send failed: {e}"))?;

        let deadline = tokio::time::Instant::now() + ACK_TIMEOUT;
        loop {
            let msg = match tokio::time::timeout_at(deadline, ws.next()).await {
                Err(_) => return Err("timed out waiting for connection_ack".into()),
                Ok(None) => return Err("connection closed before connection_ack".into()),
                Ok(Some(Err(e))) => return Err(format!("read failed before connection_ack: {e}")),
                Ok(Some(Ok(msg))) => msg,
            };

            match frame_kind(msg.clone().into_data().as_slice()) {
                FrameKind::ConnectionAck => return Ok(()),
                FrameKind::Ping => {
                    let pong = serde_json::json!({"type": "pong"});
                    let _ = ws.send(Message::Text(pong.to_string())).await;
                }
                FrameKind::Error => {
                    // Auth rejected. Still a reconnect per policy — the
                    // operator rotates the key, the process keeps trying.
                    return Err("server rejected connection_init".into());
                }
                _ => {
                    if let Message::Close(frame) = msg {
                        return Err(format!("closed during handshake: {frame:?}"));
                    }
                    // Anything else pre-ack is out of protocol; keep waiting
                    // until the deadline.
                    debug!("ignoring pre-ack frame");
                }
            }
        }
    }

    /// Receive until disconnect or shutdown, forwarding data frames.
    async fn receive_loop(&mut self, ws: &mut WsStream, subscription_id: &Arc<str>) -> SessionEnd {
        loop {
            let msg = tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *self.shutdown.borrow() {
                        return SessionEnd::Shutdown;
                    }
                    continue;
                }

                read = tokio::time::timeout(IDLE_PING_AFTER, ws.next()) => match read {
                    Err(_) => {
                        // Idle too long: probe, then give the server one
                        // more window to show life.
                        debug!("idle, sending ping");
                        let ping = serde_json::json!({"type": "ping"});
                        if ws.send(Message::Text(ping.to_string())).await.is_err() {
                            return SessionEnd::Reconnect;
                        }
                        match tokio::time::timeout(PONG_TIMEOUT, ws.next()).await {
                            Err(_) => {
                                warn!("keepalive timeout");
                                return SessionEnd::Reconnect;
                            }
                            Ok(None) => return SessionEnd::Reconnect,
                            Ok(Some(Err(e))) => {
                                warn!(error = %e, "ws_error");
                                return SessionEnd::Reconnect;
                            }
                            Ok(Some(Ok(msg))) => msg,
                        }
                    }
                    Ok(None) => return SessionEnd::Reconnect,
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "ws_error");
                        return SessionEnd::Reconnect;
                    }
                    Ok(Some(Ok(msg))) => msg,
                },
            };

            match self.handle_frame(msg, ws, subscription_id).await {
                FrameOutcome::Continue => {}
                FrameOutcome::Disconnected => return SessionEnd::Reconnect,
                FrameOutcome::PipelineGone => return SessionEnd::Shutdown,
            }
        }
    }

    async fn handle_frame(
        &mut self,
        msg: Message,
        ws: &mut WsStream,
        subscription_id: &Arc<str>,
    ) -> FrameOutcome {
        let bytes: Bytes = match msg {
            Message::Text(text) => Bytes::from(text.into_bytes()),
            Message::Binary(data) => Bytes::from(data),
            Message::Ping(_) | Message::Pong(_) => return FrameOutcome::Continue,
            Message::Close(frame) => {
                if let Some(frame) = &frame {
                    let code = u16::from(frame.code);
                    if code == 4401 {
                        warn!(code, reason = %frame.reason, "authentication rejected");
                    } else {
                        info!(code, reason = %frame.reason, "server closed connection");
                    }
                }
                return FrameOutcome::Disconnected;
            }
            Message::Frame(_) => return FrameOutcome::Continue,
        };

        match frame_kind(&bytes) {
            FrameKind::Next | FrameKind::Error | FrameKind::Unparseable => {
                // Data-bearing (or unclassifiable) frames go downstream; the
                // normalizer owns turning them into records. send() blocking
                // on a full channel is the back-pressure path.
                let raw = RawMessage::new(bytes, Arc::clone(subscription_id));
                if self.tx.send(SessionEvent::Frame(raw)).await.is_err() {
                    return FrameOutcome::PipelineGone;
                }
                FrameOutcome::Continue
            }
            FrameKind::Complete => {
                info!("subscription completed by server");
                FrameOutcome::Disconnected
            }
            FrameKind::Ping => {
                let pong = serde_json::json!({"type": "pong"});
                if ws.send(Message::Text(pong.to_string())).await.is_err() {
                    return FrameOutcome::Disconnected;
                }
                FrameOutcome::Continue
            }
            // Duplicate acks, pongs, and anything protocol-shaped but
            // unknown are ignored.
            FrameKind::ConnectionAck | FrameKind::Pong | FrameKind::Other => {
                FrameOutcome::Continue
            }
        }
    }

    /// Sleep the jittered backoff; returns true if shutdown arrived first.
    async fn wait_backoff(&mut self) -> bool {
        self.set_state(ConnectionState::Backoff);
        let delay = self.backoff.delay_for_attempt(self.attempt);
        info!(
            attempt = self.attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "ws_reconnecting"
        );
        self.attempt = self.attempt.saturating_add(1);

        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            changed = self.shutdown.changed() => {
                changed.is_err() || *self.shutdown.borrow()
            }
        }
    }

    fn set_state(&mut self, new: ConnectionState) {
        if self.state != new {
            debug!(from = ?self.state, to = ?new, "connection state");
            self.state = new;
        }
    }
}

enum FrameOutcome {
    Continue,
    Disconnected,
    PipelineGone,
}

/// Protocol-level classification of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Next,
    Error,
    Complete,
    Ping,
    Pong,
    ConnectionAck,
    /// Valid JSON, but a type this client does not handle.
    Other,
    /// Not JSON at all — forwarded so it surfaces as a malformed record.
    Unparseable,
}

fn frame_kind(bytes: &[u8]) -> FrameKind {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
        return FrameKind::Unparseable;
    };
    match value.get("type").and_then(|t| t.as_str()) {
        Some("next") => FrameKind::Next,
        Some("error") => FrameKind::Error,
        Some("complete") => FrameKind::Complete,
        Some("ping") => FrameKind::Ping,
        Some("pong") => FrameKind::Pong,
        Some("connection_ack") => FrameKind::ConnectionAck,
        _ => FrameKind::Other,
    }
}
