//! [`WsRobotLink`] – persistent WebSocket connection to the robot.
//!
//! One connection is shared by every caller. Outbound frames go through a
//! single sink guarded by an async mutex; a background reader task routes
//! each reply to the waiter registered under its [`ReplyKey`]. When the
//! socket drops, every outstanding waiter fails with [`RexError::LinkFault`]
//! and the next request reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rex_types::{Heartbeat, RexError, RobotCommand};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::link::{LinkFrame, ReplyKey, RobotLink};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type PendingReplies = Arc<Mutex<HashMap<ReplyKey, oneshot::Sender<LinkFrame>>>>;

struct Connection {
    sink: WsSink,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Removes a waiter from the pending map when its request is abandoned
/// (timed out by the caller or failed before a reply).
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    key: ReplyKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(&self.key);
        }
    }
}

/// WebSocket implementation of [`RobotLink`].
pub struct WsRobotLink {
    url: String,
    connection: AsyncMutex<Option<Connection>>,
    pending: PendingReplies,
    heartbeat_seq: AtomicU64,
}

impl WsRobotLink {
    /// Create a link to `address`. A bare `host:port` gets a `ws://` scheme.
    ///
    /// No connection is made until the first request.
    pub fn new(address: &str) -> Self {
        let url = if address.starts_with("ws://") || address.starts_with("wss://") {
            address.to_string()
        } else {
            format!("ws://{address}")
        };
        Self {
            url,
            connection: AsyncMutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            heartbeat_seq: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Connection, RexError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RexError::LinkFault {
                details: format!("connect to {}: {e}", self.url),
            })?;
        info!(url = %self.url, "robot link connected");

        let (sink, mut source) = stream.split();
        let pending = Arc::clone(&self.pending);
        let url = self.url.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => route_reply(&pending, text.as_str()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            warn!(url = %url, "robot link closed");
            // Dropping the senders fails every outstanding waiter.
            if let Ok(mut map) = pending.lock() {
                map.clear();
            }
        });
        Ok(Connection { sink, reader })
    }

    async fn request(&self, key: ReplyKey, frame: &LinkFrame) -> Result<LinkFrame, RexError> {
        let text =
            serde_json::to_string(frame).map_err(|e| RexError::Serialization(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| RexError::Channel("pending reply map poisoned".into()))?
            .insert(key, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            key,
        };

        {
            let mut slot = self.connection.lock().await;
            let needs_connect = match slot.as_ref() {
                Some(conn) => conn.reader.is_finished(),
                None => true,
            };
            if needs_connect {
                *slot = Some(self.connect().await?);
            }
            if let Some(conn) = slot.as_mut() {
                if let Err(e) = conn.sink.send(Message::Text(text.into())).await {
                    *slot = None;
                    return Err(RexError::LinkFault {
                        details: format!("send failed: {e}"),
                    });
                }
            }
        }

        rx.await.map_err(|_| RexError::LinkFault {
            details: "connection closed before reply".into(),
        })
    }
}

fn route_reply(pending: &PendingReplies, text: &str) {
    let frame = match serde_json::from_str::<LinkFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable link frame");
            return;
        }
    };
    let Some(key) = frame.reply_key() else {
        return;
    };
    let waiter = pending.lock().ok().and_then(|mut map| map.remove(&key));
    match waiter {
        Some(tx) => {
            let _ = tx.send(frame);
        }
        None => debug!(?key, "reply with no waiter (late or duplicate)"),
    }
}

#[async_trait]
impl RobotLink for WsRobotLink {
    async fn send_command(&self, seq: u64, command: &RobotCommand) -> Result<(), RexError> {
        let frame = LinkFrame::Command {
            seq,
            command: command.clone(),
        };
        match self.request(ReplyKey::Command(seq), &frame).await? {
            LinkFrame::Ack { .. } => Ok(()),
            LinkFrame::Nack { reason, .. } => Err(RexError::service("robot", reason)),
            other => Err(RexError::Serialization(format!(
                "unexpected reply to command {seq}: {other:?}"
            ))),
        }
    }

    async fn heartbeat(&self) -> Result<Heartbeat, RexError> {
        let seq = self.heartbeat_seq.fetch_add(1, Ordering::Relaxed);
        match self
            .request(ReplyKey::Heartbeat(seq), &LinkFrame::Heartbeat { seq })
            .await?
        {
            LinkFrame::HeartbeatAck {
                battery_percent,
                motion_mode,
                ..
            } => Ok(Heartbeat {
                battery_percent,
                motion_mode,
            }),
            other => Err(RexError::Serialization(format!(
                "unexpected reply to heartbeat {seq}: {other:?}"
            ))),
        }
    }
}
