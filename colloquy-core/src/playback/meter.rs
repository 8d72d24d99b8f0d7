//! Output loudness analysis for visual feedback.
//!
//! ## Algorithm
//!
//! 1. The output device callback feeds everything it renders into a
//!    [`SignalTap`] (bounded window of the most recent samples).
//! 2. `AmplitudeMeter::sample()` snapshots the window, applies a Hann
//!    window, runs a small FFT, converts each bin magnitude to decibels,
//!    maps [-100 dB, -30 dB] to [0, 1] and averages the bins.
//!
//! This mirrors a byte-frequency analyser tap: a single tone lights one bin,
//! broadband speech lifts many, and the mean tracks perceived activity.
//!
//! `sample()` never blocks: both the tap write (audio thread) and the tap
//! read (visual thread) use `try_lock` and fall back — the write skips a
//! quantum, the read returns the last published value. With no output
//! device active the window stays empty and the meter reads 0.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use parking_lot::Mutex;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Analysis window length in samples (128 frequency bins).
pub const FFT_SIZE: usize = 256;

/// Decibel floor mapped to loudness 0.
const MIN_DB: f32 = -100.0;
/// Decibel ceiling mapped to loudness 1.
const MAX_DB: f32 = -30.0;

/// Bounded window over the most recent output samples.
///
/// Written by the real-time render path, read by the visual refresh loop.
/// Both sides are wait-free from their own perspective (`try_lock`).
pub struct SignalTap {
    window: Mutex<VecDeque<f32>>,
    capacity: usize,
}

impl SignalTap {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append rendered samples, keeping only the newest `capacity`.
    ///
    /// Skips silently under lock contention — the meter is never allowed on
    /// the audio critical path.
    pub fn push(&self, samples: &[f32]) {
        let Some(mut window) = self.window.try_lock() else {
            return;
        };
        for &sample in samples {
            if window.len() == self.capacity {
                window.pop_front();
            }
            window.push_back(sample);
        }
    }

    /// Copy the current window into `dst`; returns `false` on contention.
    fn snapshot(&self, dst: &mut Vec<f32>) -> bool {
        let Some(window) = self.window.try_lock() else {
            return false;
        };
        dst.clear();
        dst.extend(window.iter().copied());
        true
    }
}

/// Produces a normalized loudness value in [0, 1] from the output signal.
pub struct AmplitudeMeter {
    tap: Arc<SignalTap>,
    fft: Arc<dyn Fft<f32>>,
    /// Last published level (f32 bits) — returned under tap contention.
    last: AtomicU32,
}

impl AmplitudeMeter {
    pub fn new() -> Self {
        let tap = Arc::new(SignalTap::new(FFT_SIZE));
        let fft = FftPlanner::new().plan_fft_forward(FFT_SIZE);
        Self {
            tap,
            fft,
            last: AtomicU32::new(0f32.to_bits()),
        }
    }

    /// The tap to attach to the render path
    /// (see [`crate::playback::PlaybackScheduler::with_output_tap`]).
    pub fn tap(&self) -> Arc<SignalTap> {
        Arc::clone(&self.tap)
    }

    /// Current loudness of the output signal, normalized to [0, 1].
    ///
    /// Non-blocking and bounded: a fixed-size FFT over the tap window, or
    /// the last published value when the tap is momentarily contended.
    /// Returns 0 when nothing has been rendered.
    pub fn sample(&self) -> f32 {
        let mut window = Vec::with_capacity(FFT_SIZE);
        if !self.tap.snapshot(&mut window) {
            return f32::from_bits(self.last.load(Ordering::Relaxed));
        }
        if window.is_empty() {
            self.last.store(0f32.to_bits(), Ordering::Relaxed);
            return 0.0;
        }

        let mut buf: Vec<Complex<f32>> = (0..FFT_SIZE)
            .map(|i| {
                let sample = window.get(i).copied().unwrap_or(0.0);
                // Hann window tapers the edges to limit spectral leakage.
                let phase = (i as f32 / FFT_SIZE as f32) * std::f32::consts::TAU;
                let hann = 0.5 * (1.0 - phase.cos());
                Complex::new(sample * hann, 0.0)
            })
            .collect();
        self.fft.process(&mut buf);

        let bins = FFT_SIZE / 2;
        let mut sum = 0.0f32;
        for value in buf.iter().take(bins) {
            let magnitude = value.norm() * 2.0 / FFT_SIZE as f32;
            if magnitude > 0.0 {
                let db = 20.0 * magnitude.log10();
                sum += ((db - MIN_DB) / (MAX_DB - MIN_DB)).clamp(0.0, 1.0);
            }
        }

        let level = (sum / bins as f32).clamp(0.0, 1.0);
        self.last.store(level.to_bits(), Ordering::Relaxed);
        level
    }
}

impl Default for AmplitudeMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, amplitude: f32, period: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                amplitude * ((i % period) as f32 / period as f32 * std::f32::consts::TAU).sin()
            })
            .collect()
    }

    #[test]
    fn reads_zero_before_any_output_is_rendered() {
        let meter = AmplitudeMeter::new();
        assert_eq!(meter.sample(), 0.0);
    }

    #[test]
    fn reads_zero_for_pure_silence() {
        let meter = AmplitudeMeter::new();
        meter.tap().push(&vec![0.0; FFT_SIZE]);
        assert_eq!(meter.sample(), 0.0);
    }

    #[test]
    fn stays_within_unit_bounds_for_any_signal() {
        let meter = AmplitudeMeter::new();
        // Deliberately out-of-range samples must still map into [0, 1].
        let hot: Vec<f32> = (0..FFT_SIZE).map(|i| if i % 2 == 0 { 5.0 } else { -5.0 }).collect();
        meter.tap().push(&hot);
        let level = meter.sample();
        assert!((0.0..=1.0).contains(&level), "level={level}");
    }

    #[test]
    fn louder_tone_reads_higher_than_quieter_tone() {
        let loud = AmplitudeMeter::new();
        loud.tap().push(&tone(FFT_SIZE, 0.8, 16));

        let quiet = AmplitudeMeter::new();
        quiet.tap().push(&tone(FFT_SIZE, 0.01, 16));

        assert!(loud.sample() > quiet.sample());
        assert!(quiet.sample() > 0.0);
    }

    #[test]
    fn tap_keeps_only_the_newest_window() {
        let meter = AmplitudeMeter::new();
        let tap = meter.tap();
        tap.push(&tone(FFT_SIZE, 0.8, 16));
        // Newest window is silence; an older loud burst must not linger.
        tap.push(&vec![0.0; FFT_SIZE]);
        assert_eq!(meter.sample(), 0.0);
    }
}
