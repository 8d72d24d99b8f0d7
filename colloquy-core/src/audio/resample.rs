//! Sample-rate conversion for the duplex paths.
//!
//! Device rates rarely match the wire: cpal captures at the device native
//! rate (commonly 48 kHz), the endpoint wants 16 kHz mono up and sends
//! 24 kHz back, and the output device again runs at its own rate. One
//! `RateConverter` bridges one fixed rate pair on the non-RT session
//! thread, where allocation is allowed.
//!
//! The converter is stateful in two ways that matter to the session:
//! partial input is carried between calls until a whole chunk is ready
//! ([`RateConverter::drain_tail`] flushes it at end of stream), and the
//! interpolation history spans chunk boundaries ([`RateConverter::reset`]
//! discards both when a barge-in cancels the stream mid-flight — carried
//! samples belong to the cancelled response and must not leak into the
//! next one).
//!
//! Equal rates short-circuit to a passthrough; no rubato session exists.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{ColloquyError, Result};

/// Converts mono f32 audio between two fixed sample rates.
pub struct RateConverter {
    /// `None` in passthrough mode (input rate == output rate).
    inner: Option<Inner>,
}

struct Inner {
    resampler: FastFixedIn<f32>,
    /// Input carried between calls until a whole chunk accumulates.
    pending: Vec<f32>,
    /// Input frames rubato consumes per process call.
    chunk: usize,
    /// Pre-allocated rubato output: `[1][output_frames_max]`.
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Parameters
    /// - `from_rate` / `to_rate`: the fixed rate pair (Hz).
    /// - `chunk_size`: input frames per rubato call (e.g. `960`).
    ///
    /// # Errors
    /// Returns `ColloquyError::AudioStream` if rubato fails to initialise.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self { inner: None });
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio — no dynamic adjustment
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| ColloquyError::AudioStream(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        tracing::debug!(from_rate, to_rate, chunk_size, max_out, "resampler created");

        Ok(Self {
            inner: Some(Inner {
                resampler,
                pending: Vec::new(),
                chunk: chunk_size,
                scratch: vec![vec![0f32; max_out]],
            }),
        })
    }

    /// Feed samples in, get converted samples out (possibly empty).
    ///
    /// Whole chunks are converted immediately; the sub-chunk remainder
    /// carries over to the next call. Passthrough mode returns the input
    /// unchanged.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(inner) = self.inner.as_mut() else {
            return samples.to_vec();
        };

        inner.pending.extend_from_slice(samples);

        let mut converted = Vec::new();
        let mut consumed = 0;
        while inner.pending.len() - consumed >= inner.chunk {
            let block = &inner.pending[consumed..consumed + inner.chunk];
            match inner
                .resampler
                .process_into_buffer(&[block], &mut inner.scratch, None)
            {
                Ok((_, produced)) => {
                    converted.extend_from_slice(&inner.scratch[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            consumed += inner.chunk;
        }
        inner.pending.drain(..consumed);

        converted
    }

    /// Discard carried input and interpolation history.
    ///
    /// Call when the stream being converted is cancelled (barge-in): any
    /// buffered samples belong to the dead stream.
    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.pending.clear();
            inner.resampler.reset();
        }
    }

    /// Flush the carried remainder by zero-padding it to a whole chunk.
    ///
    /// Returns the converted tail, or an empty vec when nothing was
    /// pending (always empty in passthrough mode, which never buffers).
    pub fn drain_tail(&mut self) -> Vec<f32> {
        let pad = match &self.inner {
            Some(inner) if !inner.pending.is_empty() => inner.chunk - inner.pending.len(),
            _ => return Vec::new(),
        };
        self.process(&vec![0.0f32; pad])
    }

    /// `true` when input rate == output rate (no conversion occurs).
    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(24_000, 24_000, 960).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
        assert!(rc.drain_tail().is_empty());
    }

    #[test]
    fn downsample_48k_to_16k_thirds_the_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(!rc.is_passthrough());
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(!out.is_empty());
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={} expected≈320",
            out.len()
        );
    }

    #[test]
    fn upsample_24k_to_48k_roughly_doubles_the_length() {
        let mut rc = RateConverter::new(24_000, 48_000, 480).unwrap();
        let out = rc.process(&vec![0.0f32; 480]);
        // The first call runs a startup transient a few samples short of
        // the exact 2x ratio.
        assert!(
            (out.len() as isize - 960).unsigned_abs() <= 20,
            "output len={} expected≈960",
            out.len()
        );
    }

    #[test]
    fn partial_input_stays_buffered_until_a_chunk_fills() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
    }

    #[test]
    fn reset_discards_carried_input() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(rc.process(&vec![0.5f32; 500]).is_empty());

        rc.reset();

        // Without the reset these 500 would complete a chunk with the 500
        // carried from before and produce output.
        assert!(rc.process(&vec![0.5f32; 500]).is_empty());
        // A further 460 completes the post-reset chunk.
        assert!(!rc.process(&vec![0.5f32; 460]).is_empty());
    }

    #[test]
    fn drain_tail_flushes_the_remainder_exactly_once() {
        let mut rc = RateConverter::new(24_000, 48_000, 480).unwrap();
        rc.process(&vec![0.3f32; 700]); // 480 converted, 220 carried

        let tail = rc.drain_tail();
        assert!(!tail.is_empty());
        assert!(rc.drain_tail().is_empty());
    }
}
