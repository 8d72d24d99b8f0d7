//! `SessionController` — top-level lifecycle state machine.
//!
//! ```text
//!           connect()                    session goes live
//!   Idle ───────────────► Connecting ───────────────────► Live
//!                             │                             │
//!                             │ device/handshake failure    │ disconnect() /
//!                             ▼                             │ remote close
//!                          Errored ◄── transport failure ───┤
//!                                                           ▼
//!                                                        Closed
//! ```
//!
//! `Closed` and `Errored` are terminal. A finished controller is never
//! resurrected; callers build a fresh one for the next conversation.
//!
//! All audio device handles are `!Send`, so `connect` hands the entire
//! session — device acquisition, handshake, the duplex loop, teardown — to
//! one `spawn_blocking` thread that owns them for the session's lifetime.
//! `connect` itself only waits for the go-live confirmation.

pub mod duplex;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{output::OutputDevice, CaptureSource},
    buffering::create_capture_ring,
    error::{ColloquyError, Result},
    events::{LoudnessEvent, SessionPhase, SessionStatusEvent},
    playback::{meter::AmplitudeMeter, PlaybackScheduler},
    transport::{SessionOffer, TransportConnector},
};

use duplex::{DiagnosticsSnapshot, DuplexContext, DuplexDiagnostics, DuplexOutcome};

/// Broadcast channel capacity for status and loudness events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session parameters. The defaults match the speech endpoint contract:
/// 16 kHz outbound, 24 kHz inbound, 4096-sample capture blocks, loudness
/// refreshed at roughly a display frame.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wire rate for outbound speech (Hz).
    pub capture_sample_rate: u32,
    /// Rate the endpoint declares for inbound audio (Hz).
    pub playback_sample_rate: u32,
    /// Samples per outbound block.
    pub frame_samples: usize,
    /// Loudness event cadence.
    pub meter_refresh: Duration,
    /// Capture device to prefer, by name substring. `None` = default input.
    pub preferred_input_device: Option<String>,
    /// Handshake parameters forwarded to the transport.
    pub offer: SessionOffer,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16_000,
            playback_sample_rate: 24_000,
            frame_samples: 4096,
            meter_refresh: Duration::from_millis(16),
            preferred_input_device: None,
            offer: SessionOffer::default(),
        }
    }
}

/// Owns a single voice session from `connect` to its terminal phase.
pub struct SessionController {
    config: SessionConfig,
    /// Consumed by the first successful `connect`.
    connector: Mutex<Option<Box<dyn TransportConnector>>>,
    phase: Arc<Mutex<SessionPhase>>,
    running: Arc<AtomicBool>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    loudness_tx: broadcast::Sender<LoudnessEvent>,
    diagnostics: Arc<DuplexDiagnostics>,
}

impl SessionController {
    pub fn new(config: SessionConfig, connector: Box<dyn TransportConnector>) -> Self {
        let (status_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (loudness_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            connector: Mutex::new(Some(connector)),
            phase: Arc::new(Mutex::new(SessionPhase::Idle)),
            running: Arc::new(AtomicBool::new(false)),
            status_tx,
            loudness_tx,
            diagnostics: Arc::new(DuplexDiagnostics::default()),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    /// Subscribe to phase transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to the live loudness stream.
    pub fn subscribe_loudness(&self) -> broadcast::Receiver<LoudnessEvent> {
        self.loudness_tx.subscribe()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Start the session. A no-op unless the controller is `Idle`, so a
    /// double-tap on a connect button cannot spawn a second session.
    ///
    /// Returns once the session is live (or startup has failed). Startup
    /// failures also move the controller to `Errored` and broadcast the
    /// user-facing message.
    ///
    /// # Errors
    /// Device acquisition or handshake errors from the session thread.
    pub async fn connect(&self) -> Result<()> {
        if !self.begin_connect() {
            return Ok(());
        }
        emit(&self.status_tx, SessionPhase::Connecting, None);
        info!("session connecting");

        let connector = self.connector.lock().take().ok_or_else(|| {
            ColloquyError::Other(anyhow::anyhow!("transport connector already consumed"))
        })?;

        self.diagnostics.reset();

        let (open_tx, open_rx) = oneshot::channel::<Result<()>>();
        let worker = SessionWorker {
            config: self.config.clone(),
            connector,
            phase: Arc::clone(&self.phase),
            running: Arc::clone(&self.running),
            status_tx: self.status_tx.clone(),
            loudness_tx: self.loudness_tx.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
        };

        tokio::task::spawn_blocking(move || worker.run(open_tx));

        match open_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                // Session thread died before confirming either way.
                self.running.store(false, Ordering::SeqCst);
                self.fail_from_connect("session thread exited during startup");
                Err(ColloquyError::Other(anyhow::anyhow!(
                    "session thread exited during startup"
                )))
            }
        }
    }

    /// `Idle → Connecting` and raise the run flag in one critical section.
    /// A `disconnect` interleaved anywhere around this call either sees
    /// `Idle` (and closes before we start) or clears the flag after it is
    /// set — its stop request can never be overwritten.
    fn begin_connect(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase != SessionPhase::Idle {
            warn!(phase = ?*phase, "connect ignored — controller is not idle");
            return false;
        }
        *phase = SessionPhase::Connecting;
        self.running.store(true, Ordering::SeqCst);
        true
    }

    /// Stop the session. Safe to call from any phase, any number of times;
    /// every teardown path converges on the same closed state.
    pub fn disconnect(&self) {
        // Both the phase check and the flag store happen under the phase
        // lock so they serialize with `begin_connect`.
        let mut phase = self.phase.lock();
        self.running.store(false, Ordering::SeqCst);
        match *phase {
            SessionPhase::Idle => {
                // No session thread exists; close directly.
                *phase = SessionPhase::Closed;
                drop(phase);
                emit(&self.status_tx, SessionPhase::Closed, None);
                info!("session closed (was idle)");
            }
            SessionPhase::Connecting | SessionPhase::Live => {
                // The session thread observes the cleared flag and finishes
                // its own teardown, transitioning to Closed.
                debug!("disconnect requested; session thread will close");
            }
            SessionPhase::Closed | SessionPhase::Errored => {}
        }
    }

    /// Map a single UI action onto connect/disconnect.
    ///
    /// # Errors
    /// Propagates `connect` errors when toggling from `Idle`.
    pub async fn toggle(&self) -> Result<()> {
        match self.phase() {
            SessionPhase::Idle => self.connect().await,
            SessionPhase::Connecting | SessionPhase::Live => {
                self.disconnect();
                Ok(())
            }
            SessionPhase::Closed | SessionPhase::Errored => {
                warn!("toggle on a finished controller; build a new one");
                Ok(())
            }
        }
    }

    fn fail_from_connect(&self, message: &str) {
        let mut phase = self.phase.lock();
        if !phase.is_terminal() {
            *phase = SessionPhase::Errored;
            drop(phase);
            emit(
                &self.status_tx,
                SessionPhase::Errored,
                Some(message.to_string()),
            );
        }
    }
}

fn emit(
    tx: &broadcast::Sender<SessionStatusEvent>,
    phase: SessionPhase,
    detail: Option<String>,
) {
    // Lagging or absent subscribers are not an error.
    let _ = tx.send(SessionStatusEvent { phase, detail });
}

/// Everything the session thread owns. Split out of the controller so the
/// `spawn_blocking` closure is a single method call.
struct SessionWorker {
    config: SessionConfig,
    connector: Box<dyn TransportConnector>,
    phase: Arc<Mutex<SessionPhase>>,
    running: Arc<AtomicBool>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    loudness_tx: broadcast::Sender<LoudnessEvent>,
    diagnostics: Arc<DuplexDiagnostics>,
}

impl SessionWorker {
    /// Session thread body: acquire devices, handshake, go live, run the
    /// duplex loop, tear down, land on a terminal phase.
    fn run(self, open_tx: oneshot::Sender<Result<()>>) {
        let (producer, consumer) = create_capture_ring();

        // 1. Microphone.
        let capture = match CaptureSource::open(
            producer,
            Arc::clone(&self.running),
            self.config.preferred_input_device.as_deref(),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                self.fail_startup(open_tx, e, "Microphone unavailable");
                return;
            }
        };

        // 2. Remote handshake.
        let (mut channel, events) = match self.connector.open(&self.config.offer) {
            Ok(opened) => opened,
            Err(e) => {
                capture.stop();
                self.fail_startup(open_tx, e, "Could not reach the speech endpoint");
                return;
            }
        };

        // 3. Speakers, playback timeline, loudness tap.
        let meter = Arc::new(AmplitudeMeter::new());
        let tap = meter.tap();
        let opened = OutputDevice::open(Arc::clone(&self.running), move |rate| {
            Arc::new(PlaybackScheduler::new(rate).with_output_tap(tap))
        });
        let (output, scheduler) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                capture.stop();
                channel.close();
                self.fail_startup(open_tx, e, "Speaker unavailable");
                return;
            }
        };

        // 4. Live.
        self.transition(SessionPhase::Live, None);
        info!(
            capture_device_rate = capture.sample_rate,
            output_rate = scheduler.sample_rate(),
            "session live"
        );
        if open_tx.send(Ok(())).is_err() {
            debug!("connect caller went away before go-live");
        }

        let meter_thread = spawn_meter_loop(
            Arc::clone(&meter),
            Arc::clone(&self.running),
            self.loudness_tx.clone(),
            self.config.meter_refresh,
        );

        let outcome = duplex::run(DuplexContext {
            capture_device_rate: capture.sample_rate,
            config: self.config.clone(),
            consumer,
            channel,
            events,
            scheduler: Arc::clone(&scheduler),
            running: Arc::clone(&self.running),
            diagnostics: Arc::clone(&self.diagnostics),
        });

        // 5. Teardown — best-effort, every step guarded, same order on
        // every exit path.
        self.running.store(false, Ordering::SeqCst);
        capture.stop();
        let dropped = capture.dropped_samples();
        if dropped > 0 {
            warn!(dropped, "capture samples were dropped at the ring boundary");
        }
        scheduler.flush();
        output.stop();
        if meter_thread.join().is_err() {
            warn!("meter thread panicked during teardown");
        }
        drop(capture);
        drop(output);

        match outcome {
            DuplexOutcome::Stopped | DuplexOutcome::RemoteClosed => {
                self.transition(SessionPhase::Closed, None);
                info!("session closed");
            }
            DuplexOutcome::Failed(msg) => {
                self.transition(
                    SessionPhase::Errored,
                    Some(format!("Connection error: {msg}")),
                );
                error!("session errored: {msg}");
            }
        }
    }

    /// Startup failure: report to the waiting `connect`, land on a terminal
    /// phase. A disconnect racing the startup turns the failure into a
    /// plain close.
    fn fail_startup(&self, open_tx: oneshot::Sender<Result<()>>, err: ColloquyError, user_message: &str) {
        error!("session startup failed: {err}");
        if self.running.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
            self.transition(
                SessionPhase::Errored,
                Some(format!("{user_message}: {err}")),
            );
        } else {
            self.transition(SessionPhase::Closed, None);
        }
        let _ = open_tx.send(Err(err));
    }

    fn transition(&self, next: SessionPhase, detail: Option<String>) {
        {
            let mut phase = self.phase.lock();
            if phase.is_terminal() {
                // Terminal phases never change; drop late transitions.
                return;
            }
            *phase = next;
        }
        emit(&self.status_tx, next, detail);
    }
}

/// Broadcast the output loudness at the configured cadence until the run
/// flag clears.
fn spawn_meter_loop(
    meter: Arc<AmplitudeMeter>,
    running: Arc<AtomicBool>,
    tx: broadcast::Sender<LoudnessEvent>,
    period: Duration,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut seq = 0u64;
        while running.load(Ordering::Relaxed) {
            let level = meter.sample();
            let _ = tx.send(LoudnessEvent { seq, level });
            seq = seq.wrapping_add(1);
            std::thread::sleep(period);
        }
        debug!(events = seq, "meter loop stopped");
    })
}
