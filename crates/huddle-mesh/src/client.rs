//! Async WebSocket client for the signaling relay.
//!
//! Owns the connection lifecycle: Hello → Identify → Ready, then a write
//! task for outbound frames, a read task feeding inbound frames to the mesh
//! manager, and a keepalive task honoring the interval the relay advertised.

use futures_util::{SinkExt, StreamExt};
use huddle_common::protocol::{ConnectionId, SignalMessage};
use huddle_common::{HuddleError, HuddleResult};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A live, authenticated relay connection.
#[derive(Debug)]
pub struct SignalClient {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub display_name: String,
    outbound: mpsc::UnboundedSender<SignalMessage>,
}

impl SignalClient {
    /// Connect and authenticate. Returns the client and the inbound frame
    /// stream to hand to the mesh manager.
    ///
    /// Authentication failure is terminal for the attempt; the caller
    /// decides whether to retry with a fresh token.
    pub async fn connect(
        url: &str,
        token: &str,
    ) -> HuddleResult<(Self, mpsc::UnboundedReceiver<SignalMessage>)> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| HuddleError::WebSocket(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let heartbeat_interval_ms = match next_frame(&mut stream).await? {
            SignalMessage::Hello {
                heartbeat_interval_ms,
            } => heartbeat_interval_ms,
            other => {
                return Err(HuddleError::WebSocket(format!(
                    "expected Hello, got {other:?}"
                )));
            }
        };

        send_frame(
            &mut sink,
            &SignalMessage::Identify {
                token: token.to_string(),
            },
        )
        .await?;

        let (connection_id, user_id, display_name) = loop {
            match next_frame(&mut stream).await? {
                SignalMessage::Ready {
                    connection_id,
                    user_id,
                    display_name,
                } => break (connection_id, user_id, display_name),
                SignalMessage::Error { message, .. } => {
                    return Err(HuddleError::AuthenticationFailure { reason: message });
                }
                _ => continue,
            }
        };
        tracing::info!(session = %connection_id, user = %display_name, "relay connection ready");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalMessage>();

        // Write task: outbound queue → socket.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let Ok(json) = serde_json::to_string(&frame) else {
                    continue;
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        });

        // Read task: socket → inbound queue. Dropping the receiver ends it.
        let read_inbound = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<SignalMessage>(text.as_str()) {
                            Ok(frame) => {
                                if read_inbound.send(frame).is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::debug!(error = %e, "dropping unparseable frame"),
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            tracing::debug!("relay read task ended");
        });

        // Keepalive at the advertised interval.
        let heartbeat_tx = outbound_tx.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(heartbeat_interval_ms.max(1000)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let beat = SignalMessage::Heartbeat {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                if heartbeat_tx.send(beat).is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                connection_id,
                user_id,
                display_name,
                outbound: outbound_tx,
            },
            inbound_rx,
        ))
    }

    /// Handle for the mesh manager's outbound frames.
    pub fn sender(&self) -> mpsc::UnboundedSender<SignalMessage> {
        self.outbound.clone()
    }

    pub fn send(&self, frame: SignalMessage) -> HuddleResult<()> {
        self.outbound
            .send(frame)
            .map_err(|_| HuddleError::WebSocket("relay connection closed".into()))
    }
}

async fn next_frame(
    stream: &mut futures_util::stream::SplitStream<WsStream>,
) -> HuddleResult<SignalMessage> {
    while let Some(msg) = stream.next().await {
        let msg = msg.map_err(|e| HuddleError::WebSocket(e.to_string()))?;
        match msg {
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
            Message::Close(_) => {
                return Err(HuddleError::WebSocket(
                    "connection closed during handshake".into(),
                ));
            }
            _ => continue,
        }
    }
    Err(HuddleError::WebSocket(
        "connection ended during handshake".into(),
    ))
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<WsStream, Message>,
    frame: &SignalMessage,
) -> HuddleResult<()> {
    let json = serde_json::to_string(frame)?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| HuddleError::WebSocket(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Minimal scripted relay: sends Hello, checks Identify, answers with
    /// `reply`.
    async fn scripted_relay(reply: SignalMessage) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let ws = accept_async(stream).await.expect("upgrade");
            let (mut sink, mut stream) = ws.split();

            let hello = serde_json::to_string(&SignalMessage::Hello {
                heartbeat_interval_ms: 45_000,
            })
            .expect("serialize");
            sink.send(Message::Text(hello.into())).await.expect("hello");

            while let Some(Ok(msg)) = stream.next().await {
                if let Message::Text(text) = msg {
                    let frame: SignalMessage =
                        serde_json::from_str(text.as_str()).expect("parse client frame");
                    if let SignalMessage::Identify { token } = frame {
                        assert_eq!(token, "token-1");
                        let reply = serde_json::to_string(&reply).expect("serialize");
                        sink.send(Message::Text(reply.into())).await.expect("reply");
                        break;
                    }
                }
            }
            // Keep the socket open until the client is done with it.
            while let Some(Ok(_)) = stream.next().await {}
        });
        format!("ws://{addr}/signal")
    }

    #[tokio::test]
    async fn connect_performs_the_identify_handshake() {
        let url = scripted_relay(SignalMessage::Ready {
            connection_id: "conn-1".into(),
            user_id: "user-1".into(),
            display_name: "alice".into(),
        })
        .await;

        let (client, _frames) = SignalClient::connect(&url, "token-1")
            .await
            .expect("handshake");
        assert_eq!(client.connection_id, "conn-1");
        assert_eq!(client.display_name, "alice");
    }

    #[tokio::test]
    async fn auth_rejection_surfaces_as_authentication_failure() {
        let url = scripted_relay(SignalMessage::Error {
            code: 4001,
            message: "token expired".into(),
        })
        .await;

        let err = SignalClient::connect(&url, "token-1")
            .await
            .expect_err("should fail");
        assert_eq!(err.error_code(), "AUTHENTICATION_FAILURE");
        assert!(err.to_string().contains("token expired"));
    }
}
