//! Blocking full-duplex loop.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Drain capture ring → resample to the wire rate → assemble fixed
//!    blocks → encode → TransportChannel::send   (outbound)
//! 2. Drain pending transport events:            (inbound)
//!      Audio       → decode → resample to device rate → schedule
//!      Interrupted → PlaybackScheduler::flush  (session stays live)
//!      Closed      → loop ends (orderly)
//!      Failed      → loop ends (session-ending error)
//! 3. Sleep briefly when neither side had work
//! ```
//!
//! The entire loop runs on the session's `spawn_blocking` thread, keeping
//! the async executor free. Inbound arrival order is preserved end-to-end:
//! events are handled strictly in receive order and the scheduler never
//! reorders. A malformed inbound block is logged, counted, and skipped —
//! one bad block must not end the session or disturb the timeline.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{frame::AudioFrame, framer::FrameAssembler, CaptureConsumer, Consumer},
    playback::PlaybackScheduler,
    session::SessionConfig,
    transport::{TransportChannel, TransportEvent, TransportEvents},
    wire,
};

/// Samples drained from the capture ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Rubato input chunk for the inbound (playback-side) converter.
const PLAYBACK_CHUNK: usize = 480;

/// Sleep when an iteration had no work (avoids busy-wait burning a core).
const IDLE_SLEEP_MS: u64 = 5;

/// Cap on inbound events handled per iteration so a flood cannot starve
/// the outbound capture path.
const MAX_EVENTS_PER_ITERATION: usize = 64;

/// Shared duplex counters for observability.
pub struct DuplexDiagnostics {
    pub samples_captured: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub send_errors: AtomicUsize,
    pub blocks_received: AtomicUsize,
    pub blocks_malformed: AtomicUsize,
    pub chunks_scheduled: AtomicUsize,
    pub interruptions: AtomicUsize,
}

impl Default for DuplexDiagnostics {
    fn default() -> Self {
        Self {
            samples_captured: AtomicUsize::new(0),
            frames_sent: AtomicUsize::new(0),
            send_errors: AtomicUsize::new(0),
            blocks_received: AtomicUsize::new(0),
            blocks_malformed: AtomicUsize::new(0),
            chunks_scheduled: AtomicUsize::new(0),
            interruptions: AtomicUsize::new(0),
        }
    }
}

impl DuplexDiagnostics {
    pub fn reset(&self) {
        self.samples_captured.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.send_errors.store(0, Ordering::Relaxed);
        self.blocks_received.store(0, Ordering::Relaxed);
        self.blocks_malformed.store(0, Ordering::Relaxed);
        self.chunks_scheduled.store(0, Ordering::Relaxed);
        self.interruptions.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_captured: self.samples_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
            blocks_malformed: self.blocks_malformed.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub samples_captured: usize,
    pub frames_sent: usize,
    pub send_errors: usize,
    pub blocks_received: usize,
    pub blocks_malformed: usize,
    pub chunks_scheduled: usize,
    pub interruptions: usize,
}

/// All context the duplex loop needs, passed as one struct so the
/// `spawn_blocking` closure stays tidy.
pub struct DuplexContext {
    pub config: SessionConfig,
    pub consumer: CaptureConsumer,
    /// Native rate the capture device delivers at (Hz).
    pub capture_device_rate: u32,
    pub channel: Box<dyn TransportChannel>,
    pub events: TransportEvents,
    pub scheduler: Arc<PlaybackScheduler>,
    pub running: Arc<AtomicBool>,
    pub diagnostics: Arc<DuplexDiagnostics>,
}

/// Why the loop ended. The caller maps this onto the terminal phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplexOutcome {
    /// Local stop request (the run flag cleared).
    Stopped,
    /// Orderly remote close.
    RemoteClosed,
    /// Channel-level failure; session-ending.
    Failed(String),
}

/// Run the blocking duplex loop until stop, remote close, or failure.
pub fn run(mut ctx: DuplexContext) -> DuplexOutcome {
    info!("duplex loop started");

    // Outbound: device native rate → wire capture rate (passthrough when equal).
    let mut upstream = match RateConverter::new(
        ctx.capture_device_rate,
        ctx.config.capture_sample_rate,
        DRAIN_CHUNK,
    ) {
        Ok(rc) => rc,
        Err(e) => {
            error!("failed to create capture resampler: {e}");
            return DuplexOutcome::Failed(e.to_string());
        }
    };
    if !upstream.is_passthrough() {
        info!(
            from = ctx.capture_device_rate,
            to = ctx.config.capture_sample_rate,
            "outbound resampling enabled"
        );
    }

    // Inbound: wire rate → output device rate. Built lazily from the first
    // block's declared rate and rebuilt if the endpoint ever changes it.
    let mut downstream: Option<(u32, RateConverter)> = None;

    let mut assembler = FrameAssembler::new(
        ctx.config.frame_samples,
        ctx.config.capture_sample_rate,
    );
    let mut raw = vec![0f32; DRAIN_CHUNK];

    let outcome = loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break DuplexOutcome::Stopped;
        }

        let mut progressed = false;

        // ── 1. Outbound: capture ring → frames → wire ─────────────────────
        let drained = ctx.consumer.pop_slice(&mut raw);
        if drained > 0 {
            progressed = true;
            ctx.diagnostics
                .samples_captured
                .fetch_add(drained, Ordering::Relaxed);

            let converted = upstream.process(&raw[..drained]);
            assembler.push(&converted);

            let mut failed = None;
            while let Some(frame) = assembler.pop_frame() {
                let block = wire::encode(&frame);
                match ctx.channel.send(block) {
                    Ok(()) => {
                        ctx.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        ctx.diagnostics.send_errors.fetch_add(1, Ordering::Relaxed);
                        error!("transport send failed: {e}");
                        failed = Some(e.to_string());
                        break;
                    }
                }
            }
            if let Some(msg) = failed {
                break DuplexOutcome::Failed(msg);
            }
        }

        // ── 2. Inbound: transport events → playback ───────────────────────
        let mut handled = 0;
        let mut ended = None;
        while handled < MAX_EVENTS_PER_ITERATION {
            match ctx.events.try_recv() {
                Ok(TransportEvent::Audio(block)) => {
                    progressed = true;
                    handled += 1;
                    ctx.diagnostics
                        .blocks_received
                        .fetch_add(1, Ordering::Relaxed);
                    handle_audio_block(&mut ctx, &mut downstream, &block);
                }
                Ok(TransportEvent::Interrupted) => {
                    progressed = true;
                    handled += 1;
                    ctx.diagnostics
                        .interruptions
                        .fetch_add(1, Ordering::Relaxed);
                    info!("barge-in — flushing scheduled playback");
                    // Samples of the cancelled response may still be carried
                    // inside the converter; they must not leak into the next
                    // response's first chunk.
                    if let Some((_, converter)) = downstream.as_mut() {
                        converter.reset();
                    }
                    ctx.scheduler.flush();
                }
                Ok(TransportEvent::Closed) => {
                    schedule_converter_tail(&mut ctx, &mut downstream);
                    info!("remote endpoint closed the channel");
                    ended = Some(DuplexOutcome::RemoteClosed);
                    break;
                }
                Ok(TransportEvent::Failed(msg)) => {
                    error!("transport failure: {msg}");
                    ended = Some(DuplexOutcome::Failed(msg));
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Event source dropped without a Closed marker.
                    warn!("transport event stream disconnected");
                    ended = Some(DuplexOutcome::RemoteClosed);
                    break;
                }
            }
        }
        if let Some(outcome) = ended {
            break outcome;
        }

        if !progressed {
            std::thread::sleep(Duration::from_millis(IDLE_SLEEP_MS));
        }
    };

    // Outbound half is ours to release; close is idempotent.
    ctx.channel.close();

    let snap = ctx.diagnostics.snapshot();
    info!(
        samples_captured = snap.samples_captured,
        frames_sent = snap.frames_sent,
        send_errors = snap.send_errors,
        blocks_received = snap.blocks_received,
        blocks_malformed = snap.blocks_malformed,
        chunks_scheduled = snap.chunks_scheduled,
        interruptions = snap.interruptions,
        outcome = ?outcome,
        "duplex loop stopped — diagnostics"
    );
    outcome
}

/// Decode one inbound block and hand it to the scheduler.
///
/// Malformed data is a per-block condition: log, count, skip. The timeline
/// is only touched once a block has decoded and resampled cleanly.
fn handle_audio_block(
    ctx: &mut DuplexContext,
    downstream: &mut Option<(u32, RateConverter)>,
    block: &wire::WireBlock,
) {
    let frame = match wire::decode(block) {
        Ok(frame) => frame,
        Err(e) => {
            ctx.diagnostics
                .blocks_malformed
                .fetch_add(1, Ordering::Relaxed);
            warn!("skipping malformed inbound block: {e}");
            return;
        }
    };
    if frame.is_empty() {
        return;
    }

    let device_rate = ctx.scheduler.sample_rate();

    let needs_rebuild = !matches!(downstream, Some((rate, _)) if *rate == frame.sample_rate);
    if needs_rebuild {
        match RateConverter::new(frame.sample_rate, device_rate, PLAYBACK_CHUNK) {
            Ok(rc) => {
                if frame.sample_rate != ctx.config.playback_sample_rate {
                    debug!(
                        declared = frame.sample_rate,
                        expected = ctx.config.playback_sample_rate,
                        "inbound block at an unexpected rate"
                    );
                }
                *downstream = Some((frame.sample_rate, rc));
            }
            Err(e) => {
                warn!("cannot resample inbound block ({e}); skipping");
                return;
            }
        }
    }

    let Some((_, converter)) = downstream.as_mut() else {
        return;
    };
    let samples = converter.process(&frame.samples);
    if samples.is_empty() {
        // Converter still accumulating toward a full chunk.
        return;
    }

    ctx.scheduler.schedule(AudioFrame::new(samples, device_rate));
    ctx.diagnostics
        .chunks_scheduled
        .fetch_add(1, Ordering::Relaxed);
}

/// Let the sub-chunk remainder carried in the downstream converter play
/// out as one final chunk instead of silently dropping it at close.
fn schedule_converter_tail(
    ctx: &mut DuplexContext,
    downstream: &mut Option<(u32, RateConverter)>,
) {
    let Some((_, converter)) = downstream.as_mut() else {
        return;
    };
    let tail = converter.drain_tail();
    if tail.is_empty() {
        return;
    }
    let device_rate = ctx.scheduler.sample_rate();
    ctx.scheduler.schedule(AudioFrame::new(tail, device_rate));
    ctx.diagnostics
        .chunks_scheduled
        .fetch_add(1, Ordering::Relaxed);
}
