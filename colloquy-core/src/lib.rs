//! # colloquy-core
//!
//! Real-time full-duplex voice session engine: capture microphone audio,
//! stream it to a remote speech endpoint, and play the endpoint's audio
//! responses back gaplessly — while both directions flow at once.
//!
//! ```text
//!  microphone ──► SPSC ring ──► resample ──► 4096-sample frames ──► encode ─┐
//!  (cpal, RT)    (lock-free)    (rubato)     (FrameAssembler)      (PCM16)  │
//!                                                                           ▼
//!                                                                 TransportChannel
//!                                                                           │
//!  speakers ◄── PlaybackScheduler ◄── resample ◄── decode ◄── TransportEvents
//!  (cpal, RT)   (gapless timeline,                 (PCM16)    (audio / barge-in /
//!      │         barge-in flush)                               close / failure)
//!      └──► SignalTap ──► AmplitudeMeter ──► LoudnessEvent stream
//! ```
//!
//! [`session::SessionController`] ties it together behind a small lifecycle
//! API (`connect` / `disconnect` / event subscriptions); everything between
//! the device callbacks and the transport runs on one blocking session
//! thread. The transport itself is abstract — implement
//! [`transport::TransportConnector`] for a concrete endpoint, or use the
//! in-process [`transport::stub::LoopbackConnector`] for tests and demos.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod error;
pub mod events;
pub mod playback;
pub mod session;
pub mod transport;
pub mod wire;

pub use buffering::frame::AudioFrame;
pub use error::{ColloquyError, Result};
pub use events::{LoudnessEvent, SessionPhase, SessionStatusEvent};
pub use playback::PlaybackScheduler;
pub use session::{SessionConfig, SessionController};
pub use transport::{SessionOffer, TransportConnector, TransportEvent};
