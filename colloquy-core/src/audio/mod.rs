//! Audio device I/O via the cpal backend.
//!
//! # Design constraints
//!
//! Both the input and output callbacks run on OS audio threads at elevated
//! priority. They **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! The capture callback writes into an SPSC ring producer whose `push_slice`
//! is lock-free and allocation-free. The output callback renders through
//! [`crate::playback::PlaybackScheduler::render`], which uses `try_lock` and
//! falls back to silence under contention.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Capture and output handles must therefore be created and dropped
//! on the same thread. The session accomplishes this by opening both inside
//! its `spawn_blocking` thread.

pub mod output;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use crate::{
    buffering::CaptureProducer,
    error::{ColloquyError, Result},
};
#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Handle to an active microphone capture stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct CaptureSource {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag — set to `false` to make the callback a no-op.
    running: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
    /// Samples dropped at the ring boundary since open (backpressure tally).
    dropped: Arc<AtomicUsize>,
}

/// Downmix interleaved multi-channel input to mono into `dst`.
///
/// `dst` is resized to the frame count; no allocation after the first call
/// at a given buffer size.
#[cfg(feature = "audio-cpal")]
fn downmix_into(dst: &mut Vec<f32>, interleaved: &[f32], channels: usize) {
    let frames = interleaved.len() / channels;
    dst.resize(frames, 0.0);
    for (frame, slot) in dst.iter_mut().enumerate() {
        let base = frame * channels;
        let mut sum = 0f32;
        for ch in 0..channels {
            sum += interleaved[base + ch];
        }
        *slot = sum / channels as f32;
    }
}

impl CaptureSource {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available device.
    ///
    /// Captured samples are pushed into `producer` at the device's native
    /// rate, downmixed to mono. On ring overflow the excess is dropped and
    /// counted; the ring is the explicit backpressure bound on this path.
    ///
    /// # Errors
    /// - `ColloquyError::NoDefaultInputDevice` when no microphone exists.
    /// - `ColloquyError::DeviceUnavailable` when the device rejects the
    ///   stream config.
    /// - `ColloquyError::AudioStream` when cpal fails to build the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        mut producer: CaptureProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut selected = None;

        if let Some(preferred) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected = devices
                        .find(|d| d.name().map(|n| n == preferred).unwrap_or(false));
                    if selected.is_none() {
                        warn!("preferred input device '{preferred}' not found, falling back");
                    }
                }
                Err(e) => {
                    warn!("failed to list input devices while resolving preference: {e}");
                }
            }
        }

        let device = match selected.or_else(|| host.default_input_device()) {
            Some(d) => d,
            None => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| ColloquyError::DeviceUnavailable(e.to_string()))?;
                let fallback = devices.next().ok_or(ColloquyError::NoDefaultInputDevice)?;
                warn!("no default input device, falling back to first available input");
                fallback
            }
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| ColloquyError::DeviceUnavailable(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;

        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels: channels as u16,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let dropped = Arc::new(AtomicUsize::new(0));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let running = Arc::clone(&running);
                let dropped = Arc::clone(&dropped);
                let mut mono_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        let block: &[f32] = if channels == 1 {
                            data
                        } else {
                            downmix_into(&mut mono_buf, data, channels);
                            &mono_buf
                        };
                        let written = producer.push_slice(block);
                        if written < block.len() {
                            let lost = block.len() - written;
                            dropped.fetch_add(lost, Ordering::Relaxed);
                            warn!("capture ring full: dropped {lost} samples");
                        }
                    },
                    |err| error!("capture stream error: {err}"),
                    None,
                )
            }

            SampleFormat::I16 => {
                let running = Arc::clone(&running);
                let dropped = Arc::clone(&dropped);
                let mut mono_buf: Vec<f32> = Vec::new();
                let mut f32_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        f32_buf.resize(data.len(), 0.0);
                        for (dst, &src) in f32_buf.iter_mut().zip(data) {
                            *dst = src as f32 / 32768.0;
                        }
                        let block: &[f32] = if channels == 1 {
                            &f32_buf
                        } else {
                            downmix_into(&mut mono_buf, &f32_buf, channels);
                            &mono_buf
                        };
                        let written = producer.push_slice(block);
                        if written < block.len() {
                            let lost = block.len() - written;
                            dropped.fetch_add(lost, Ordering::Relaxed);
                            warn!("capture ring full: dropped {lost} samples");
                        }
                    },
                    |err| error!("capture stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(ColloquyError::AudioStream(format!(
                    "unsupported capture sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| ColloquyError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ColloquyError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
            dropped,
        })
    }

    /// Stop: signal the callback to no-op on its next invocation.
    ///
    /// Dropping the handle afterwards releases the device. No samples are
    /// pushed after this returns (the flag is read before every push).
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Samples dropped at the ring boundary since the stream opened.
    pub fn dropped_samples(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Stub when the `audio-cpal` feature is disabled. `stop` and
/// `dropped_samples` live in the ungated impl above.
#[cfg(not(feature = "audio-cpal"))]
impl CaptureSource {
    pub fn open(
        _producer: CaptureProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(ColloquyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(all(test, not(feature = "audio-cpal")))]
mod stub_tests {
    use super::*;
    use crate::buffering::create_capture_ring;

    #[test]
    fn open_without_the_audio_backend_is_a_stream_error() {
        let (producer, _consumer) = create_capture_ring();
        assert!(matches!(
            CaptureSource::open(producer, Arc::new(AtomicBool::new(true)), None),
            Err(ColloquyError::AudioStream(_))
        ));
    }
}
