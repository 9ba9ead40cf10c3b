//! Transport handle shared by the session and the capture thread
//!
//! Sending never blocks: outbound events go onto an unbounded channel drained
//! by the connection's writer task. Once the connection is closed from either
//! side every send fails with [`NetworkError::TransportUnavailable`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::capture::{CaptureFrame, FrameSink};
use crate::error::NetworkError;
use crate::protocol::{InboundEvent, OutboundEvent, RadioPayload};

/// Message for the writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Event(OutboundEvent),
    Close,
}

/// Cloneable sending side of a live connection
#[derive(Clone)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<Outgoing>,
    open: Arc<AtomicBool>,
}

impl TransportHandle {
    /// Create a handle and the receiver its writer task drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            tx,
            open: Arc::new(AtomicBool::new(true)),
        };
        (handle, rx)
    }

    /// Queue an event for sending
    pub fn send(&self, event: OutboundEvent) -> Result<(), NetworkError> {
        if !self.is_open() {
            return Err(NetworkError::TransportUnavailable);
        }

        self.tx.send(Outgoing::Event(event)).map_err(|_| {
            self.mark_closed();
            NetworkError::TransportUnavailable
        })
    }

    /// Close the connection; the writer sends a close frame and exits
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outgoing::Close);
        }
    }

    /// Record that the connection went away without asking the writer to close
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl FrameSink for TransportHandle {
    fn send_frame(&self, frame: CaptureFrame) -> Result<(), NetworkError> {
        self.send(OutboundEvent::Radio(RadioPayload {
            sample_rate: frame.sample_rate,
            blob: frame.samples,
        }))
    }
}

/// A live connection: outbound handle, inbound event stream and its I/O tasks
pub struct Connection {
    pub transport: TransportHandle,
    pub inbound: mpsc::UnboundedReceiver<InboundEvent>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Opens connections to the relay server
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, NetworkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_queues_event() {
        let (handle, mut rx) = TransportHandle::new();
        let frame = CaptureFrame {
            sample_rate: 48000,
            samples: vec![0.25; 4],
        };

        handle.send_frame(frame).unwrap();

        match rx.try_recv().unwrap() {
            Outgoing::Event(OutboundEvent::Radio(payload)) => {
                assert_eq!(payload.sample_rate, 48000);
                assert_eq!(payload.blob, vec![0.25; 4]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_closed_handle_rejects_sends() {
        let (handle, mut rx) = TransportHandle::new();
        let clone = handle.clone();

        handle.close();
        handle.close();
        assert_eq!(rx.try_recv().unwrap(), Outgoing::Close);
        assert!(rx.try_recv().is_err());

        let err = clone
            .send(OutboundEvent::AudioSticker(crate::protocol::StickerPayload {
                sticker: "x".into(),
            }))
            .unwrap_err();
        assert!(matches!(err, NetworkError::TransportUnavailable));
    }

    #[test]
    fn test_dropped_writer_marks_closed() {
        let (handle, rx) = TransportHandle::new();
        drop(rx);

        let frame = CaptureFrame {
            sample_rate: 48000,
            samples: vec![0.0; 2],
        };
        assert!(handle.send_frame(frame).is_err());
        assert!(!handle.is_open());
    }
}
