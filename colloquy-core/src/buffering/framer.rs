//! Fixed-size frame assembly for the outbound capture path.
//!
//! The transport expects capture audio in whole blocks (4096 samples at
//! 16 kHz by default). Capture drains and resampler output arrive in
//! arbitrary lengths, so the assembler accumulates samples and yields
//! complete frames in arrival order, keeping any remainder for the next
//! push. Exactly-once, in-order delivery per block.

use crate::buffering::frame::AudioFrame;

/// Accumulates samples into fixed-size [`AudioFrame`]s.
#[derive(Debug)]
pub struct FrameAssembler {
    pending: Vec<f32>,
    frame_len: usize,
    sample_rate: u32,
}

impl FrameAssembler {
    /// # Parameters
    /// - `frame_len`: samples per emitted frame (e.g. `4096`).
    /// - `sample_rate`: rate tag stamped on emitted frames (Hz).
    pub fn new(frame_len: usize, sample_rate: u32) -> Self {
        Self {
            pending: Vec::with_capacity(frame_len * 2),
            frame_len: frame_len.max(1),
            sample_rate,
        }
    }

    /// Append samples to the pending buffer.
    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
    }

    /// Pop the next complete frame, or `None` if fewer than `frame_len`
    /// samples are pending.
    pub fn pop_frame(&mut self) -> Option<AudioFrame> {
        if self.pending.len() < self.frame_len {
            return None;
        }
        let samples: Vec<f32> = self.pending.drain(..self.frame_len).collect();
        Some(AudioFrame::new(samples, self.sample_rate))
    }

    /// Samples currently buffered but not yet emitted.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_nothing_until_a_full_frame_accumulates() {
        let mut asm = FrameAssembler::new(8, 16_000);
        asm.push(&[0.1; 5]);
        assert!(asm.pop_frame().is_none());
        assert_eq!(asm.pending_len(), 5);

        asm.push(&[0.2; 3]);
        let frame = asm.pop_frame().expect("full frame");
        assert_eq!(frame.samples.len(), 8);
        assert_eq!(frame.sample_rate, 16_000);
        assert!(asm.pop_frame().is_none());
    }

    #[test]
    fn preserves_arrival_order_across_frames() {
        let mut asm = FrameAssembler::new(4, 16_000);
        let samples: Vec<f32> = (0..10).map(|i| i as f32).collect();
        asm.push(&samples);

        let first = asm.pop_frame().unwrap();
        let second = asm.pop_frame().unwrap();
        assert_eq!(first.samples, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(second.samples, vec![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(asm.pending_len(), 2);
        assert!(asm.pop_frame().is_none());
    }
}
