//! PCM wire codec: `AudioFrame` ⇄ `WireBlock`.
//!
//! The remote endpoint speaks linear PCM: little-endian signed 16-bit mono
//! samples, base64-wrapped inside a JSON message whose mime type carries the
//! sample rate (`audio/pcm;rate=16000`). Both directions are pure,
//! synchronous conversions; no buffering, no I/O.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::buffering::frame::AudioFrame;
use crate::error::{ColloquyError, Result};

/// Bytes per encoded sample (i16).
pub const SAMPLE_WIDTH: usize = 2;

/// Wire encodings the codec understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEncoding {
    /// Linear PCM, signed 16-bit little-endian, mono.
    PcmI16Le,
}

/// An encoded audio payload plus the format metadata the endpoint needs.
///
/// Created from an [`AudioFrame`] on the way out; consumed exactly once by
/// the transport send call. Inbound blocks are decoded back into frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireBlock {
    /// Raw PCM bytes.
    pub payload: Vec<u8>,
    /// Sample rate of the encoded audio (Hz).
    pub sample_rate: u32,
    pub encoding: WireEncoding,
}

impl WireBlock {
    /// Mime string sent alongside the payload, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        match self.encoding {
            WireEncoding::PcmI16Le => format!("audio/pcm;rate={}", self.sample_rate),
        }
    }

    /// Number of whole samples in the payload.
    pub fn sample_count(&self) -> usize {
        self.payload.len() / SAMPLE_WIDTH
    }
}

/// Convert normalized f32 samples to the PCM byte encoding.
///
/// Samples are clamped to [-1.0, 1.0] first so out-of-range input degrades
/// to hard clipping instead of integer wraparound artifacts.
pub fn encode(frame: &AudioFrame) -> WireBlock {
    let mut payload = Vec::with_capacity(frame.samples.len() * SAMPLE_WIDTH);
    for &sample in &frame.samples {
        let clamped = sample.clamp(-1.0, 1.0);
        // Round-to-nearest on the same /32768 scale decode uses, so the
        // round trip stays within half a quantization step.
        let quantized =
            (clamped * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        payload.extend_from_slice(&quantized.to_le_bytes());
    }
    WireBlock {
        payload,
        sample_rate: frame.sample_rate,
        encoding: WireEncoding::PcmI16Le,
    }
}

/// Convert a PCM wire block back into an [`AudioFrame`].
///
/// # Errors
/// `ColloquyError::MalformedAudioData` when the payload length is not a
/// whole multiple of the sample width.
pub fn decode(block: &WireBlock) -> Result<AudioFrame> {
    if block.payload.len() % SAMPLE_WIDTH != 0 {
        return Err(ColloquyError::MalformedAudioData(format!(
            "payload length {} is not a multiple of the {}-byte sample width",
            block.payload.len(),
            SAMPLE_WIDTH
        )));
    }

    let samples = block
        .payload
        .chunks_exact(SAMPLE_WIDTH)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(AudioFrame::new(samples, block.sample_rate))
}

// ---------------------------------------------------------------------------
// JSON wire form: { "data": <base64>, "mimeType": "audio/pcm;rate=16000" }
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBlockRepr {
    data: String,
    mime_type: String,
}

fn parse_mime(mime: &str) -> Result<(WireEncoding, u32)> {
    let rest = mime
        .strip_prefix("audio/pcm;rate=")
        .ok_or_else(|| ColloquyError::MalformedAudioData(format!("unsupported mime: {mime}")))?;
    let rate: u32 = rest
        .parse()
        .map_err(|_| ColloquyError::MalformedAudioData(format!("bad rate in mime: {mime}")))?;
    Ok((WireEncoding::PcmI16Le, rate))
}

impl Serialize for WireBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        WireBlockRepr {
            data: BASE64.encode(&self.payload),
            mime_type: self.mime_type(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WireBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error;

        let repr = WireBlockRepr::deserialize(deserializer)?;
        let (encoding, sample_rate) = parse_mime(&repr.mime_type).map_err(D::Error::custom)?;
        let payload = BASE64
            .decode(repr.data.as_bytes())
            .map_err(|e| D::Error::custom(format!("bad base64 payload: {e}")))?;

        Ok(WireBlock {
            payload,
            sample_rate,
            encoding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn round_trip_preserves_count_and_values_within_quantization() {
        let samples: Vec<f32> = (0..4096)
            .map(|i| (i as f32 * 0.01).sin() * 0.8)
            .collect();
        let frame = AudioFrame::new(samples.clone(), 16_000);

        let block = encode(&frame);
        assert_eq!(block.sample_count(), 4096);
        assert_eq!(block.mime_type(), "audio/pcm;rate=16000");

        let decoded = decode(&block).expect("decode");
        assert_eq!(decoded.samples.len(), samples.len());
        assert_eq!(decoded.sample_rate, 16_000);
        for (a, b) in samples.iter().zip(&decoded.samples) {
            // One i16 quantization step is 1/32768 ≈ 3.1e-5.
            assert_abs_diff_eq!(a, b, epsilon = 1.0 / 32_000.0);
        }
    }

    #[test]
    fn encode_clamps_out_of_range_samples() {
        let frame = AudioFrame::new(vec![2.0, -3.0, 1.0, -1.0], 16_000);
        let decoded = decode(&encode(&frame)).unwrap();
        assert!(decoded.samples[0] > 0.99);
        assert!(decoded.samples[1] < -0.99);
        // No wraparound: clamped extremes keep their sign.
        assert!(decoded.samples.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn odd_length_payload_is_malformed() {
        let block = WireBlock {
            payload: vec![0u8; 4097],
            sample_rate: 24_000,
            encoding: WireEncoding::PcmI16Le,
        };
        let err = decode(&block).unwrap_err();
        assert!(matches!(err, ColloquyError::MalformedAudioData(_)));
    }

    #[test]
    fn empty_payload_decodes_to_empty_frame() {
        let block = WireBlock {
            payload: vec![],
            sample_rate: 24_000,
            encoding: WireEncoding::PcmI16Le,
        };
        let frame = decode(&block).unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn json_form_uses_base64_data_and_mime_type() {
        let frame = AudioFrame::new(vec![0.0, 0.5], 24_000);
        let block = encode(&frame);

        let json = serde_json::to_value(&block).expect("serialize");
        assert_eq!(json["mimeType"], "audio/pcm;rate=24000");
        assert!(json["data"].is_string());

        let round_trip: WireBlock = serde_json::from_value(json).expect("deserialize");
        assert_eq!(round_trip, block);
    }

    #[test]
    fn json_form_rejects_unknown_mime() {
        let bad = serde_json::json!({ "data": "", "mimeType": "audio/opus" });
        assert!(serde_json::from_value::<WireBlock>(bad).is_err());

        let bad_rate = serde_json::json!({ "data": "", "mimeType": "audio/pcm;rate=fast" });
        assert!(serde_json::from_value::<WireBlock>(bad_rate).is_err());
    }
}
