//! `LoopbackConnector` — in-process transport that echoes sent audio back.
//!
//! Used by the demo binary and tests before wiring a real endpoint: every
//! block sent comes straight back as an inbound [`TransportEvent::Audio`],
//! so the full capture → encode → send → receive → decode → schedule path
//! can be exercised end-to-end without a network. A cloneable
//! [`LoopbackHandle`] injects interruption / close / failure events the way
//! a remote endpoint would.

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ColloquyError, Result};
use crate::transport::{SessionOffer, TransportChannel, TransportConnector, TransportEvent, TransportEvents};
use crate::wire::WireBlock;

/// Remote-side puppet strings for the loopback transport.
#[derive(Clone)]
pub struct LoopbackHandle {
    tx: Sender<TransportEvent>,
}

impl LoopbackHandle {
    /// Simulate a barge-in notification from the endpoint.
    pub fn interrupt(&self) {
        let _ = self.tx.send(TransportEvent::Interrupted);
    }

    /// Simulate an orderly remote close.
    pub fn close_remote(&self) {
        let _ = self.tx.send(TransportEvent::Closed);
    }

    /// Simulate a channel-level failure.
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.tx.send(TransportEvent::Failed(message.into()));
    }

    /// Push a synthetic inbound audio block.
    pub fn send_audio(&self, block: WireBlock) {
        let _ = self.tx.send(TransportEvent::Audio(block));
    }
}

struct LoopbackChannel {
    tx: Sender<TransportEvent>,
    closed: bool,
}

impl TransportChannel for LoopbackChannel {
    fn send(&mut self, block: WireBlock) -> Result<()> {
        if self.closed {
            return Err(ColloquyError::Transport("loopback channel closed".into()));
        }
        self.tx
            .send(TransportEvent::Audio(block))
            .map_err(|_| ColloquyError::Transport("loopback receiver dropped".into()))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.tx.send(TransportEvent::Closed);
        }
    }
}

/// Connector producing a single loopback channel.
pub struct LoopbackConnector {
    tx: Sender<TransportEvent>,
    rx: Mutex<Option<TransportEvents>>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Handle for injecting remote-side events; valid before and after
    /// `open`.
    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            tx: self.tx.clone(),
        }
    }
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConnector for LoopbackConnector {
    fn open(&self, offer: &SessionOffer) -> Result<(Box<dyn TransportChannel>, TransportEvents)> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| ColloquyError::HandshakeFailed("loopback already opened".into()))?;

        debug!(voice = %offer.voice, "loopback transport opened");

        Ok((
            Box::new(LoopbackChannel {
                tx: self.tx.clone(),
                closed: false,
            }),
            rx,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::frame::AudioFrame;
    use crate::wire;

    #[test]
    fn echoes_sent_blocks_in_order() {
        let connector = LoopbackConnector::new();
        let (mut channel, events) = connector.open(&SessionOffer::default()).unwrap();

        let first = wire::encode(&AudioFrame::new(vec![0.1; 4], 16_000));
        let second = wire::encode(&AudioFrame::new(vec![0.2; 4], 16_000));
        channel.send(first.clone()).unwrap();
        channel.send(second.clone()).unwrap();

        assert!(matches!(events.recv().unwrap(), TransportEvent::Audio(b) if b == first));
        assert!(matches!(events.recv().unwrap(), TransportEvent::Audio(b) if b == second));
    }

    #[test]
    fn handle_injects_interruption_between_blocks() {
        let connector = LoopbackConnector::new();
        let handle = connector.handle();
        let (mut channel, events) = connector.open(&SessionOffer::default()).unwrap();

        let block = wire::encode(&AudioFrame::new(vec![0.1; 4], 16_000));
        channel.send(block).unwrap();
        handle.interrupt();

        assert!(matches!(events.recv().unwrap(), TransportEvent::Audio(_)));
        assert!(matches!(events.recv().unwrap(), TransportEvent::Interrupted));
    }

    #[test]
    fn close_is_idempotent_and_blocks_further_sends() {
        let connector = LoopbackConnector::new();
        let (mut channel, events) = connector.open(&SessionOffer::default()).unwrap();

        channel.close();
        channel.close();
        assert!(matches!(events.recv().unwrap(), TransportEvent::Closed));
        assert!(events.try_recv().is_err(), "close must fire exactly once");

        let block = wire::encode(&AudioFrame::new(vec![0.1; 4], 16_000));
        assert!(channel.send(block).is_err());
    }

    #[test]
    fn second_open_fails_handshake() {
        let connector = LoopbackConnector::new();
        let _first = connector.open(&SessionOffer::default()).unwrap();
        assert!(matches!(
            connector.open(&SessionOffer::default()),
            Err(ColloquyError::HandshakeFailed(_))
        ));
    }
}
