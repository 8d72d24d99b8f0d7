//! Gapless playback scheduling against the output device clock.
//!
//! ## Timeline model
//!
//! ```text
//! schedule(frame) ──► start = max(next_start, now) ──► queue.push_back
//!                      next_start = start + duration
//!
//! render(out)     ──► copy queued samples / silence into the device buffer,
//!                      pop finished chunks, advance the frame clock
//!
//! flush()         ──► queue.clear(), next_start = now   (barge-in)
//! ```
//!
//! The clock is the count of frames the output device has pulled through
//! `render`, so scheduling is synchronized to the device's own playback
//! position, never wall-clock. Chunks queued back-to-back play with zero
//! gap and zero overlap; if arrivals fall behind playback, the `max(...)`
//! clamp restarts the next chunk at the current position instead of in the
//! past.
//!
//! `schedule` and `flush` serialise on one mutex (single-writer discipline),
//! so a flush cannot be lost to a concurrently arriving chunk: whichever
//! acquires the lock second observes the other's effect. `render` runs on
//! the real-time audio thread and therefore only ever `try_lock`s — under
//! contention it emits one quantum of silence rather than blocking.

pub mod meter;

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffering::frame::AudioFrame;
use crate::playback::meter::SignalTap;

/// A decoded chunk queued on the playback timeline.
#[derive(Debug)]
struct PlaybackChunk {
    /// Scheduled start, in seconds of output-clock time.
    start: f64,
    /// Samples at the scheduler's sample rate.
    samples: Vec<f32>,
    /// Render progress within `samples`.
    cursor: usize,
}

#[derive(Debug, Default)]
struct TimelineState {
    /// Monotone cursor: scheduled start of the next chunk.
    next_start: f64,
    /// Chunks scheduled or playing, in arrival order.
    queue: VecDeque<PlaybackChunk>,
}

/// Owns the playback timeline; shared between the session thread
/// (`schedule`/`flush`) and the output device callback (`render`).
pub struct PlaybackScheduler {
    sample_rate: u32,
    /// Frames pulled by the output device since creation — the output clock.
    frames_rendered: AtomicU64,
    state: Mutex<TimelineState>,
    /// Optional tap fed with everything rendered, for loudness analysis.
    tap: Option<Arc<SignalTap>>,
}

impl PlaybackScheduler {
    /// Create a scheduler rendering at `sample_rate` Hz.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_rendered: AtomicU64::new(0),
            state: Mutex::new(TimelineState::default()),
            tap: None,
        }
    }

    /// Attach an output signal tap (builder style, before sharing).
    pub fn with_output_tap(mut self, tap: Arc<SignalTap>) -> Self {
        self.tap = Some(tap);
        self
    }

    /// Rate the scheduler renders at (Hz). Frames passed to [`schedule`]
    /// must already be at this rate.
    ///
    /// [`schedule`]: PlaybackScheduler::schedule
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current output-clock position in seconds.
    pub fn position_secs(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    /// Scheduled start of the next chunk, in output-clock seconds.
    pub fn next_start_secs(&self) -> f64 {
        self.state.lock().next_start
    }

    /// Number of chunks currently scheduled or playing.
    pub fn active_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Queue a decoded frame for gapless playback; returns its start time.
    ///
    /// Start = `max(next_start, now)`: back-to-back with the previous chunk
    /// when the timeline is ahead of the clock, immediate when the backlog
    /// has drained. Arrival order equals playback order.
    pub fn schedule(&self, frame: AudioFrame) -> f64 {
        if frame.sample_rate != self.sample_rate {
            warn!(
                frame_rate = frame.sample_rate,
                scheduler_rate = self.sample_rate,
                "scheduling frame at a foreign sample rate; resample upstream"
            );
        }

        let mut state = self.state.lock();
        let now = self.position_secs();
        let start = state.next_start.max(now);

        if frame.is_empty() {
            // Nothing to play; the timeline cursor still may not regress.
            state.next_start = start;
            return start;
        }

        let duration = frame.samples.len() as f64 / self.sample_rate as f64;
        state.next_start = start + duration;
        state.queue.push_back(PlaybackChunk {
            start,
            samples: frame.samples,
            cursor: 0,
        });

        debug!(
            start,
            duration,
            queued = state.queue.len(),
            "chunk scheduled"
        );
        start
    }

    /// Stop everything scheduled or playing and reset the timeline to now.
    ///
    /// The interruption primitive: idempotent, never fails. Flushing an
    /// empty timeline is a no-op apart from the cursor reset.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        let discarded = state.queue.len();
        state.queue.clear();
        state.next_start = self.position_secs();
        if discarded > 0 {
            debug!(discarded, "playback flushed");
        }
    }

    /// Fill `out` (mono, scheduler rate) from the timeline and advance the
    /// output clock by `out.len()` frames.
    ///
    /// Real-time safe: no allocation, `try_lock` only. Under lock contention
    /// the buffer is silence for this quantum; the clock still advances so
    /// scheduled time tracks the device.
    pub fn render(&self, out: &mut [f32]) {
        let start_frame = self.frames_rendered.load(Ordering::Acquire);
        let rate = self.sample_rate as f64;
        let half_frame = 0.5 / rate;

        match self.state.try_lock() {
            None => out.fill(0.0),
            Some(mut state) => {
                let mut idx = 0;
                while idx < out.len() {
                    let t = (start_frame + idx as u64) as f64 / rate;
                    let Some(chunk) = state.queue.front_mut() else {
                        out[idx..].fill(0.0);
                        break;
                    };
                    if chunk.cursor >= chunk.samples.len() {
                        state.queue.pop_front();
                        continue;
                    }
                    if chunk.start > t + half_frame {
                        // Not due yet — silence up to the chunk's start.
                        let gap = ((chunk.start - t) * rate).round() as usize;
                        let n = gap.max(1).min(out.len() - idx);
                        out[idx..idx + n].fill(0.0);
                        idx += n;
                    } else {
                        let remaining = chunk.samples.len() - chunk.cursor;
                        let n = remaining.min(out.len() - idx);
                        out[idx..idx + n]
                            .copy_from_slice(&chunk.samples[chunk.cursor..chunk.cursor + n]);
                        chunk.cursor += n;
                        idx += n;
                        if chunk.cursor >= chunk.samples.len() {
                            // Natural completion — leave the active set.
                            state.queue.pop_front();
                        }
                    }
                }
            }
        }

        self.frames_rendered
            .fetch_add(out.len() as u64, Ordering::Release);
        if let Some(tap) = &self.tap {
            tap.push(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Rate of 1000 Hz keeps durations exact in binary floating point.
    const RATE: u32 = 1000;

    fn frame(len: usize, value: f32) -> AudioFrame {
        AudioFrame::new(vec![value; len], RATE)
    }

    fn drain(scheduler: &PlaybackScheduler, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; frames];
        scheduler.render(&mut out);
        out
    }

    #[test]
    fn back_to_back_chunks_start_at_cumulative_durations() {
        let s = PlaybackScheduler::new(RATE);

        // 1.0 s, 0.5 s, 1.0 s arriving with no delay at T = 0.
        let s1 = s.schedule(frame(1000, 0.1));
        let s2 = s.schedule(frame(500, 0.2));
        let s3 = s.schedule(frame(1000, 0.3));

        assert_eq!(s1, 0.0);
        assert_eq!(s2, 1.0);
        assert_eq!(s3, 1.5);
        assert_eq!(s.next_start_secs(), 2.5);
        assert_eq!(s.active_len(), 3);
    }

    #[test]
    fn rendered_output_is_gapless_and_in_arrival_order() {
        let s = PlaybackScheduler::new(RATE);
        s.schedule(frame(10, 0.1));
        s.schedule(frame(5, 0.2));

        let out = drain(&s, 20);
        assert!(out[..10].iter().all(|&v| v == 0.1));
        assert!(out[10..15].iter().all(|&v| v == 0.2));
        // Trailing silence once the queue drains.
        assert!(out[15..].iter().all(|&v| v == 0.0));
        assert_eq!(s.active_len(), 0);
    }

    #[test]
    fn late_arrival_clamps_to_current_position_not_the_past() {
        let s = PlaybackScheduler::new(RATE);
        s.schedule(frame(100, 0.1));

        // Device pulls 0.3 s: the chunk finishes, then 0.2 s of silence.
        drain(&s, 300);
        assert!((s.position_secs() - 0.3).abs() < 1e-9);

        let start = s.schedule(frame(100, 0.2));
        assert_eq!(start, 0.3, "must resume immediately, not at 0.1");

        let out = drain(&s, 100);
        assert!(out.iter().all(|&v| v == 0.2));
    }

    #[test]
    fn flush_empties_active_set_and_resets_next_start() {
        let s = PlaybackScheduler::new(RATE);
        s.schedule(frame(1000, 0.1));
        s.schedule(frame(1000, 0.2));
        drain(&s, 250);

        s.flush();
        assert_eq!(s.active_len(), 0);
        assert_eq!(s.next_start_secs(), s.position_secs());

        // Nothing left to play.
        let out = drain(&s, 100);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn flush_on_empty_timeline_is_a_no_op() {
        let s = PlaybackScheduler::new(RATE);
        s.flush();
        s.flush();
        assert_eq!(s.active_len(), 0);
        assert_eq!(s.next_start_secs(), 0.0);
    }

    #[test]
    fn chunk_scheduled_after_flush_plays_from_the_reset_timeline() {
        let s = PlaybackScheduler::new(RATE);
        s.schedule(frame(1000, 0.1));
        s.schedule(frame(1000, 0.2));
        drain(&s, 400);

        s.flush();
        let start = s.schedule(frame(100, 0.9));
        assert_eq!(start, s.position_secs(), "starts at flush time, not old next_start");

        let out = drain(&s, 100);
        assert!(out.iter().all(|&v| v == 0.9));
    }

    #[test]
    fn render_with_empty_timeline_outputs_silence_and_advances_clock() {
        let s = PlaybackScheduler::new(RATE);
        let out = drain(&s, 500);
        assert!(out.iter().all(|&v| v == 0.0));
        assert!((s.position_secs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn chunk_render_continues_across_device_pulls() {
        let s = PlaybackScheduler::new(RATE);
        let samples: Vec<f32> = (0..100).map(|i| i as f32).collect();
        s.schedule(AudioFrame::new(samples.clone(), RATE));

        let mut collected = Vec::new();
        for _ in 0..4 {
            collected.extend(drain(&s, 25));
        }
        assert_eq!(collected, samples);
    }

    #[test]
    fn empty_frame_does_not_join_the_active_set() {
        let s = PlaybackScheduler::new(RATE);
        let start = s.schedule(AudioFrame::new(vec![], RATE));
        assert_eq!(start, 0.0);
        assert_eq!(s.active_len(), 0);
    }
}
