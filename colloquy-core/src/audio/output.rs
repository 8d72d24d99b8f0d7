//! Output device wiring: cpal stream pulling from the playback scheduler.
//!
//! The output callback is the consumer of the playback timeline and the
//! source of its clock: every device pull calls
//! [`PlaybackScheduler::render`], which advances the frame counter the
//! scheduler treats as "now". Multi-channel devices get the mono render
//! duplicated across channels.
//!
//! Same thread-affinity rule as capture: `cpal::Stream` is `!Send`, so the
//! handle is created and dropped on the session thread.

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, Stream,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::error::{ColloquyError, Result};
use crate::playback::PlaybackScheduler;
#[cfg(feature = "audio-cpal")]
use tracing::{error, info};

/// Handle to an active output stream. **Not `Send`.**
pub struct OutputDevice {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag — `false` makes the callback render silence only.
    running: Arc<AtomicBool>,
    /// Actual output sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

impl OutputDevice {
    /// Open the default output device and start pulling from a scheduler.
    ///
    /// The scheduler must run at the device's native rate, which is only
    /// known once the device is opened — `make_scheduler` is called with
    /// that rate and the resulting scheduler is shared with the callback
    /// and returned to the caller.
    ///
    /// # Errors
    /// - `ColloquyError::DeviceUnavailable` when no output device exists or
    ///   it rejects its default config.
    /// - `ColloquyError::AudioStream` when cpal fails to build the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        running: Arc<AtomicBool>,
        make_scheduler: impl FnOnce(u32) -> Arc<PlaybackScheduler>,
    ) -> Result<(Self, Arc<PlaybackScheduler>)> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| ColloquyError::DeviceUnavailable("no default output device".into()))?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| ColloquyError::DeviceUnavailable(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;

        info!(sample_rate, channels, "playback config selected");

        let scheduler = make_scheduler(sample_rate);
        let config = supported.config();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let running = Arc::clone(&running);
                let scheduler = Arc::clone(&scheduler);
                let mut mono_buf: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _info| {
                        if !running.load(Ordering::Relaxed) {
                            data.fill(0.0);
                            return;
                        }
                        if channels == 1 {
                            scheduler.render(data);
                            return;
                        }
                        let frames = data.len() / channels;
                        mono_buf.resize(frames, 0.0);
                        scheduler.render(&mut mono_buf);
                        for (frame, &sample) in mono_buf.iter().enumerate() {
                            let base = frame * channels;
                            data[base..base + channels].fill(sample);
                        }
                    },
                    |err| error!("output stream error: {err}"),
                    None,
                )
            }

            SampleFormat::I16 => {
                let running = Arc::clone(&running);
                let scheduler = Arc::clone(&scheduler);
                let mut mono_buf: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _info| {
                        if !running.load(Ordering::Relaxed) {
                            data.fill(0);
                            return;
                        }
                        let frames = data.len() / channels;
                        mono_buf.resize(frames, 0.0);
                        scheduler.render(&mut mono_buf);
                        for (frame, &sample) in mono_buf.iter().enumerate() {
                            let quantized = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                            let base = frame * channels;
                            data[base..base + channels].fill(quantized);
                        }
                    },
                    |err| error!("output stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(ColloquyError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| ColloquyError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ColloquyError::AudioStream(e.to_string()))?;

        Ok((
            Self {
                _stream: stream,
                running,
                sample_rate,
            },
            scheduler,
        ))
    }

    /// Stop: the callback renders silence from the next pull onward.
    /// Dropping the handle afterwards releases the device.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled. `stop` lives in the
/// ungated impl above.
#[cfg(not(feature = "audio-cpal"))]
impl OutputDevice {
    pub fn open(
        _running: Arc<AtomicBool>,
        _make_scheduler: impl FnOnce(u32) -> Arc<PlaybackScheduler>,
    ) -> Result<(Self, Arc<PlaybackScheduler>)> {
        Err(ColloquyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(all(test, not(feature = "audio-cpal")))]
mod stub_tests {
    use super::*;

    #[test]
    fn open_without_the_audio_backend_is_a_stream_error() {
        assert!(matches!(
            OutputDevice::open(Arc::new(AtomicBool::new(true)), |rate| {
                Arc::new(PlaybackScheduler::new(rate))
            }),
            Err(ColloquyError::AudioStream(_))
        ));
    }
}
