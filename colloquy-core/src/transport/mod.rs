//! Duplex transport abstraction.
//!
//! The engine never assumes a specific wire protocol — only this message
//! contract: a channel that accepts outbound [`WireBlock`]s in order
//! (fire-and-forget from the caller's perspective) and an inbound event
//! stream delivering audio blocks, interruption notices, and terminal
//! close/failure signals. Concrete backends (a WebSocket speech API, the
//! in-process loopback stub) live behind [`TransportConnector`].

pub mod stub;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::wire::WireBlock;

/// Inbound messages from the remote endpoint.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A block of response audio to decode and schedule.
    Audio(WireBlock),
    /// Barge-in: the user spoke over the in-flight response; the endpoint
    /// wants current playback cancelled. The session stays live.
    Interrupted,
    /// Orderly remote close.
    Closed,
    /// Channel-level failure; session-ending.
    Failed(String),
}

/// Opaque session parameters handed to the endpoint at handshake time.
///
/// The core does not interpret these beyond forwarding them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOffer {
    /// Remote endpoint identity (model name, URL — backend-defined).
    pub endpoint: String,
    /// Credential for the backend (API key, token).
    pub credential: String,
    /// Voice / persona selection.
    pub voice: String,
    /// System prompt text.
    pub system_prompt: String,
}

impl Default for SessionOffer {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            credential: String::new(),
            voice: "Zephyr".into(),
            system_prompt: "You are a helpful, witty, and concise voice assistant.".into(),
        }
    }
}

/// Receiving half of the inbound event stream.
pub type TransportEvents = Receiver<TransportEvent>;

/// An open duplex channel to the remote endpoint.
pub trait TransportChannel: Send + 'static {
    /// Queue a block for delivery. Order-preserving; fire-and-forget —
    /// delivery failures surface later as a [`TransportEvent::Failed`].
    ///
    /// # Errors
    /// `ColloquyError::Transport` if the channel is already closed.
    fn send(&mut self, block: WireBlock) -> Result<()>;

    /// Best-effort close. Idempotent; never fails.
    fn close(&mut self);
}

/// Factory for opening a channel; the handshake suspension point.
pub trait TransportConnector: Send + 'static {
    /// Perform the handshake and return the channel plus its event stream.
    ///
    /// Blocking: called from the session's device-owning thread, before the
    /// session goes live.
    ///
    /// # Errors
    /// `ColloquyError::HandshakeFailed` when the remote session cannot be
    /// established.
    fn open(&self, offer: &SessionOffer) -> Result<(Box<dyn TransportChannel>, TransportEvents)>;
}
