//! Microphone capture: device acquisition and the frame/encode engine.
//!
//! Capture runs at the device's native rate and channel count; the engine
//! converts to mono, resamples to the configured capture rate, packs
//! fixed-size frames, and pushes encoded blobs to a sink without blocking
//! the audio thread.

use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use crate::pcm::{self, EncodedBlob};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::any::Any;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Raw sample blocks buffered between the device callback and the engine.
const BLOCK_CHANNEL_SIZE: usize = 64;

/// A live microphone stream.
///
/// Carries native-rate sample blocks plus an opaque guard; dropping the
/// stream releases the underlying device.
pub struct MicStream {
    /// Native sample rate of the device.
    pub sample_rate: u32,
    /// Native channel count of the device.
    pub channels: u16,
    /// Raw interleaved sample blocks as delivered by the device.
    pub blocks: mpsc::Receiver<Vec<f32>>,
    _guard: Box<dyn Any + Send>,
}

impl MicStream {
    /// Wrap a block channel and device guard as a microphone stream.
    pub fn new(
        sample_rate: u32,
        channels: u16,
        blocks: mpsc::Receiver<Vec<f32>>,
        guard: Box<dyn Any + Send>,
    ) -> Self {
        Self {
            sample_rate,
            channels,
            blocks,
            _guard: guard,
        }
    }
}

/// Microphone capability: yields a live sample stream or fails.
#[async_trait]
pub trait Microphone: Send {
    /// Acquire the capture device.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::DeviceUnavailable`] when no usable input
    /// device exists or the stream cannot be opened.
    async fn acquire(&mut self, config: &AudioConfig) -> Result<MicStream>;
}

/// System microphone via cpal.
///
/// Uses the device's default configuration for maximum compatibility and
/// leaves rate/channel conversion to the capture engine.
#[derive(Debug, Default)]
pub struct CpalMicrophone;

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&mut self, config: &AudioConfig) -> Result<MicStream> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            host.input_devices()
                .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| {
                    VoiceError::DeviceUnavailable(format!("input device '{name}' not found"))
                })?
        } else {
            host.default_input_device()
                .ok_or_else(|| VoiceError::DeviceUnavailable("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| VoiceError::DeviceUnavailable(format!("no default input config: {e}")))?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();

        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "native input config: {}Hz, {} channels",
            native_rate, native_channels
        );

        let (block_tx, block_rx) = mpsc::channel::<Vec<f32>>(BLOCK_CHANNEL_SIZE);

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    // try_send keeps the audio thread non-blocking
                    if block_tx.try_send(data.to_vec()).is_err() {
                        debug!("capture block channel full, dropping block");
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| {
                VoiceError::DeviceUnavailable(format!("failed to build input stream: {e}"))
            })?;

        stream
            .play()
            .map_err(|e| {
                VoiceError::DeviceUnavailable(format!("failed to start input stream: {e}"))
            })?;

        Ok(MicStream::new(
            native_rate,
            native_channels,
            block_rx,
            Box::new(stream),
        ))
    }
}

impl CpalMicrophone {
    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

/// Turns a microphone stream into encoded frames pushed to a sink.
///
/// Frames are fixed-size (`AudioConfig::frame_size` samples at the capture
/// rate); a full sink drops the frame rather than stalling capture.
#[derive(Default)]
pub struct CaptureEngine {
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl CaptureEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the engine currently owns a running capture task.
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Start framing and encoding the given stream into `sink`.
    ///
    /// Returns immediately; the engine owns the stream until [`stop`].
    /// Starting while already running is ignored with a warning.
    ///
    /// [`stop`]: CaptureEngine::stop
    pub fn start(
        &mut self,
        mut stream: MicStream,
        sink: mpsc::Sender<EncodedBlob>,
        config: &AudioConfig,
    ) {
        if self.task.is_some() {
            warn!("capture engine already running, ignoring start");
            return;
        }

        let native_rate = stream.sample_rate;
        let native_channels = stream.channels;
        let target_rate = config.input_sample_rate;
        let frame_size = config.frame_size;
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut pending: Vec<f32> = Vec::with_capacity(frame_size * 2);
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    block = stream.blocks.recv() => {
                        let Some(data) = block else {
                            debug!("microphone stream ended");
                            break;
                        };
                        let mono = if native_channels > 1 {
                            to_mono(&data, native_channels)
                        } else {
                            data
                        };
                        let samples = if native_rate != target_rate {
                            resample(&mono, native_rate, target_rate)
                        } else {
                            mono
                        };
                        pending.extend_from_slice(&samples);
                        while pending.len() >= frame_size {
                            let frame: Vec<f32> = pending.drain(..frame_size).collect();
                            let blob = pcm::encode_frame(&frame, target_rate);
                            if sink.try_send(blob).is_err() {
                                debug!("frame sink full, dropping frame");
                            }
                        }
                    }
                }
            }
            // Dropping the stream releases the device.
            drop(stream);
            debug!("capture engine task exited");
        });

        self.task = Some((cancel, handle));
        info!(
            "audio capture started: native {}Hz -> target {}Hz, {} samples/frame",
            native_rate, target_rate, frame_size
        );
    }

    /// Stop capture and release the device. Idempotent.
    pub async fn stop(&mut self) {
        if let Some((cancel, handle)) = self.task.take() {
            cancel.cancel();
            let _ = handle.await;
            info!("audio capture stopped");
        }
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
///
/// Sufficient quality for speech capture (48kHz -> 16kHz); human speech
/// energy sits below 8kHz, so no anti-alias filter is needed.
fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };

        output.push(sample as f32);
    }

    output
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::time::Duration;

    fn fake_stream(sample_rate: u32, channels: u16) -> (mpsc::Sender<Vec<f32>>, MicStream) {
        let (tx, rx) = mpsc::channel(16);
        (tx, MicStream::new(sample_rate, channels, rx, Box::new(())))
    }

    #[test]
    fn to_mono_averages_interleaved_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        let mono = to_mono(&stereo, 2);
        assert_eq!(mono.len(), 3);
        assert!((mono[0] - 0.5).abs() < 1e-6);
        assert!((mono[1] - 0.5).abs() < 1e-6);
        assert!(mono[2].abs() < 1e-6);
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let samples = [0.1, 0.2, 0.3];
        assert_eq!(resample(&samples, 16_000, 16_000), samples.to_vec());
    }

    #[test]
    fn resample_48k_to_16k_thirds_the_length() {
        let samples = vec![0.25; 12_288];
        let out = resample(&samples, 48_000, 16_000);
        assert_eq!(out.len(), 4096);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[tokio::test]
    async fn engine_emits_one_blob_per_frame() {
        let config = AudioConfig::default();
        let (block_tx, stream) = fake_stream(16_000, 1);
        let (sink_tx, mut sink_rx) = mpsc::channel(8);

        let mut engine = CaptureEngine::new();
        engine.start(stream, sink_tx, &config);

        block_tx.send(vec![0.5; 2048]).await.expect("send block");
        block_tx.send(vec![0.5; 2048]).await.expect("send block");

        let blob = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv())
            .await
            .expect("frame within timeout")
            .expect("frame");
        assert_eq!(blob.data.len(), 4096 * 2);
        assert_eq!(blob.format.sample_rate, 16_000);
        assert_eq!(blob.format.channels, 1);

        engine.stop().await;
    }

    #[tokio::test]
    async fn engine_resamples_native_rate_to_target() {
        let config = AudioConfig::default();
        let (block_tx, stream) = fake_stream(48_000, 1);
        let (sink_tx, mut sink_rx) = mpsc::channel(8);

        let mut engine = CaptureEngine::new();
        engine.start(stream, sink_tx, &config);

        // 12288 samples at 48kHz resample to exactly one 4096-sample frame.
        block_tx.send(vec![0.1; 12_288]).await.expect("send block");

        let blob = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv())
            .await
            .expect("frame within timeout")
            .expect("frame");
        assert_eq!(blob.data.len(), 4096 * 2);

        engine.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let config = AudioConfig::default();
        let (_block_tx, stream) = fake_stream(16_000, 1);
        let (sink_tx, _sink_rx) = mpsc::channel(8);

        let mut engine = CaptureEngine::new();
        engine.stop().await;
        assert!(!engine.is_running());

        engine.start(stream, sink_tx, &config);
        assert!(engine.is_running());

        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running());
    }
}
