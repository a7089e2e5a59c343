//! [`StatusServer`] – streams status events to UI clients.
//!
//! Each connected WebSocket client receives every event from the
//! [`EventBus`] firehose as one JSON text message. Inbound frames are
//! ignored apart from `Close`.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use rex_types::RexError;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{error, info, warn};

use crate::bus::EventBus;

#[derive(Clone)]
pub struct StatusServer {
    bus: EventBus,
}

impl StatusServer {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Bind `addr` and serve until the task is dropped.
    pub async fn run(self, addr: SocketAddr) -> Result<(), RexError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RexError::Config(format!("status server bind error on {addr}: {e}")))?;
        info!(%addr, "status server listening");
        self.serve(listener).await;
        Ok(())
    }

    /// Accept clients on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "status client error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "status accept error"),
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), RexError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| RexError::Serialization(format!("ws handshake from {peer}: {e}")))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut rx = self.bus.subscribe();

        loop {
            tokio::select! {
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let json = serde_json::to_string(&event)
                                .map_err(|e| RexError::Serialization(e.to_string()))?;
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!(peer = %peer, lagged_by = n, "status client lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use rex_types::{Event, EventPayload, LinkStatus};
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn client_receives_published_events_as_json() {
        let bus = EventBus::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(StatusServer::new(bus.clone()).serve(listener));

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        // Give the server a moment to subscribe before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        bus.publish_to(
            Topic::Safety,
            Event::new("rex-kernel::safety", EventPayload::Link(LinkStatus::Lost)),
        );

        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = msg.into_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["source"], "rex-kernel::safety");
        assert_eq!(value["payload"]["Link"], "Lost");
    }
}
