//! PCM frame codec: float samples <-> little-endian 16-bit wire form.
//!
//! All functions are pure; the capture engine encodes outbound frames and
//! the session state machine decodes inbound chunk payloads with them.

use crate::error::{Result, VoiceError};
use base64::Engine;

/// Format tag carried alongside encoded audio bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (1 = mono).
    pub channels: u16,
    /// Sample width in bits.
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// Mono 16-bit PCM at the given rate.
    pub fn pcm16_mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            bits_per_sample: 16,
        }
    }

    /// MIME-style tag used on the wire, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Wire-ready encoded audio: raw little-endian PCM bytes plus format tag.
#[derive(Debug, Clone)]
pub struct EncodedBlob {
    /// Raw little-endian 16-bit PCM bytes.
    pub data: Vec<u8>,
    /// Format of `data`.
    pub format: AudioFormat,
}

/// Decoded audio: one float buffer per channel at a known rate.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    channels: Vec<Vec<f32>>,
    frame_count: usize,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Build a mono buffer from samples at the given rate.
    pub fn from_mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        let frame_count = samples.len();
        Self {
            channels: vec![samples],
            frame_count,
            sample_rate,
        }
    }

    /// Number of frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples of one channel, if present.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count as f64 / f64::from(self.sample_rate)
    }

    /// Collapse to a single mono buffer, averaging channels when needed.
    pub fn into_mono(mut self) -> Vec<f32> {
        if self.channels.len() == 1 {
            return self.channels.remove(0);
        }
        let ch = self.channels.len() as f32;
        (0..self.frame_count)
            .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / ch)
            .collect()
    }
}

/// Encode a captured frame as little-endian 16-bit PCM.
///
/// Samples are clamped to \[-1, 1\] before conversion; out-of-range input
/// is never an error.
pub fn encode_frame(samples: &[f32], sample_rate: u32) -> EncodedBlob {
    let mut data = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let value = (clamped * 32768.0)
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX))
            .round() as i16;
        data.extend_from_slice(&value.to_le_bytes());
    }
    EncodedBlob {
        data,
        format: AudioFormat::pcm16_mono(sample_rate),
    }
}

/// Decode a base64 chunk payload into raw bytes.
///
/// # Errors
///
/// Returns [`VoiceError::MalformedPayload`] when the text violates the
/// base64 alphabet or padding rules.
pub fn decode_payload(text: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| VoiceError::MalformedPayload(e.to_string()))
}

/// Interpret raw bytes as interleaved little-endian 16-bit PCM.
///
/// Produces one normalized float buffer per channel at `target_rate`.
///
/// # Errors
///
/// Returns [`VoiceError::UnsupportedFormat`] when `channels` is zero or the
/// byte length is not a multiple of `2 * channels`.
pub fn to_sample_buffer(bytes: &[u8], target_rate: u32, channels: u16) -> Result<SampleBuffer> {
    if channels == 0 {
        return Err(VoiceError::UnsupportedFormat(
            "channel count must be at least 1".to_owned(),
        ));
    }
    let stride = 2 * channels as usize;
    if bytes.len() % stride != 0 {
        return Err(VoiceError::UnsupportedFormat(format!(
            "{} bytes is not a whole number of {}-channel 16-bit frames",
            bytes.len(),
            channels
        )));
    }

    let frame_count = bytes.len() / stride;
    let mut chans = vec![Vec::with_capacity(frame_count); channels as usize];
    for frame in bytes.chunks_exact(stride) {
        for (ch, pair) in frame.chunks_exact(2).enumerate() {
            let value = i16::from_le_bytes([pair[0], pair[1]]);
            chans[ch].push(f32::from(value) / 32768.0);
        }
    }

    Ok(SampleBuffer {
        channels: chans,
        frame_count,
        sample_rate: target_rate,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn encode_produces_two_bytes_per_sample() {
        let blob = encode_frame(&[0.0; 4096], 16_000);
        assert_eq!(blob.data.len(), 8192);
        assert_eq!(blob.format.sample_rate, 16_000);
        assert_eq!(blob.format.channels, 1);
        assert_eq!(blob.format.bits_per_sample, 16);
    }

    #[test]
    fn encode_clamps_out_of_range_samples() {
        let blob = encode_frame(&[2.0, -2.0], 16_000);
        let hi = i16::from_le_bytes([blob.data[0], blob.data[1]]);
        let lo = i16::from_le_bytes([blob.data[2], blob.data[3]]);
        assert_eq!(hi, i16::MAX);
        assert_eq!(lo, i16::MIN);
    }

    #[test]
    fn encode_then_decode_round_trips_within_quantization_error() {
        let samples: Vec<f32> = (0..1000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.9)
            .chain([1.0, -1.0, 0.0, 0.5, -0.5])
            .collect();
        let blob = encode_frame(&samples, 16_000);
        let buffer = to_sample_buffer(&blob.data, 16_000, 1).expect("decode");
        let decoded = buffer.channel(0).expect("channel 0");

        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(decoded) {
            assert!(
                (a - b).abs() <= 1.0 / 32768.0 + f32::EPSILON,
                "sample {a} decoded as {b}"
            );
        }
    }

    #[test]
    fn decode_payload_rejects_invalid_base64() {
        let result = decode_payload("not!!valid@@base64");
        assert!(matches!(result, Err(VoiceError::MalformedPayload(_))));
    }

    #[test]
    fn decode_payload_accepts_standard_alphabet() {
        let bytes = decode_payload("AAAA").expect("decode");
        assert_eq!(bytes, vec![0, 0, 0]);
    }

    #[test]
    fn to_sample_buffer_rejects_odd_length() {
        let result = to_sample_buffer(&[0, 0, 0], 24_000, 1);
        assert!(matches!(result, Err(VoiceError::UnsupportedFormat(_))));
    }

    #[test]
    fn to_sample_buffer_rejects_length_not_matching_channels() {
        // 6 bytes = 3 mono frames but only 1.5 stereo frames.
        let result = to_sample_buffer(&[0; 6], 24_000, 2);
        assert!(matches!(result, Err(VoiceError::UnsupportedFormat(_))));
    }

    #[test]
    fn to_sample_buffer_rejects_zero_channels() {
        let result = to_sample_buffer(&[0; 4], 24_000, 0);
        assert!(matches!(result, Err(VoiceError::UnsupportedFormat(_))));
    }

    #[test]
    fn to_sample_buffer_reports_frame_count_and_duration() {
        // 0.5s of 24kHz mono: 12000 frames = 24000 bytes.
        let buffer = to_sample_buffer(&vec![0u8; 24_000], 24_000, 1).expect("decode");
        assert_eq!(buffer.frame_count(), 12_000);
        assert!((buffer.duration_secs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn to_sample_buffer_deinterleaves_stereo() {
        // L = 1000, R = -1000, two frames.
        let mut bytes = Vec::new();
        for _ in 0..2 {
            bytes.extend_from_slice(&1000i16.to_le_bytes());
            bytes.extend_from_slice(&(-1000i16).to_le_bytes());
        }
        let buffer = to_sample_buffer(&bytes, 48_000, 2).expect("decode");
        assert_eq!(buffer.channel_count(), 2);
        assert_eq!(buffer.frame_count(), 2);
        let left = buffer.channel(0).expect("left");
        let right = buffer.channel(1).expect("right");
        assert!(left.iter().all(|&s| s > 0.0));
        assert!(right.iter().all(|&s| s < 0.0));
    }

    #[test]
    fn empty_payload_is_zero_frames() {
        let buffer = to_sample_buffer(&[], 24_000, 1).expect("decode");
        assert_eq!(buffer.frame_count(), 0);
        assert!(buffer.duration_secs().abs() < f64::EPSILON);
    }

    #[test]
    fn into_mono_averages_channels() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&16000i16.to_le_bytes());
        bytes.extend_from_slice(&(-16000i16).to_le_bytes());
        let buffer = to_sample_buffer(&bytes, 24_000, 2).expect("decode");
        let mono = buffer.into_mono();
        assert_eq!(mono.len(), 1);
        assert!(mono[0].abs() < 1e-6);
    }

    #[test]
    fn mime_type_carries_rate() {
        assert_eq!(
            AudioFormat::pcm16_mono(16_000).mime_type(),
            "audio/pcm;rate=16000"
        );
    }
}
