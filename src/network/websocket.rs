//! WebSocket connector
//!
//! Each text message carries one JSON event. A writer task drains the
//! transport handle's channel into the socket and a reader task parses
//! incoming messages onto the inbound channel. Either side ending closes the
//! handle.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::NetworkError;
use crate::network::transport::{Connection, Connector, Outgoing, TransportHandle};
use crate::protocol::InboundEvent;

/// Connects to the relay over WebSocket
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection, NetworkError> {
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connected to {}", self.url);

        let (mut sink, mut stream) = ws.split();
        let (transport, mut outgoing) = TransportHandle::new();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let writer_handle = transport.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing.recv().await {
                match message {
                    Outgoing::Event(event) => {
                        let text = match event.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::warn!("Failed to encode outbound event: {}", e);
                                continue;
                            }
                        };

                        if let Err(e) = sink.send(Message::Text(text)).await {
                            tracing::warn!("WebSocket send failed: {}", e);
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            writer_handle.mark_closed();
            let _ = sink.close().await;
            tracing::debug!("WebSocket writer finished");
        });

        let reader_handle = transport.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match InboundEvent::from_json(&text) {
                        Ok(event) => {
                            if inbound_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("Ignoring unrecognized message: {}", e);
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::info!("Server closed connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("WebSocket receive failed: {}", e);
                        break;
                    }
                }
            }

            // Let the writer exit too
            reader_handle.close();
            tracing::debug!("WebSocket reader finished");
        });

        Ok(Connection {
            transport,
            inbound,
            tasks: vec![writer, reader],
        })
    }
}
