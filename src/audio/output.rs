//! Output mixing: sample-accurate scheduled playback units over one stream.
//!
//! Rather than one stream per chunk, all scheduled units are summed into a
//! single cpal output stream. The mixer tracks an absolute frame clock
//! (`frames_written`) which the scheduler reads as the playback timeline.

use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use crate::pcm::SampleBuffer;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Identifier for one scheduled playback unit.
pub type UnitId = u64;

/// A playback surface with a monotonic clock and sample-accurate starts.
pub trait OutputContext: Send {
    /// Current position of the playback clock, in seconds.
    fn current_time(&self) -> f64;

    /// Schedule `buffer` to begin at `start` seconds on the playback clock.
    ///
    /// A start time already in the past begins immediately without
    /// skipping samples.
    ///
    /// # Errors
    ///
    /// Returns an error when the context has been closed.
    fn play_at(&mut self, id: UnitId, buffer: SampleBuffer, start: f64) -> Result<()>;

    /// Stop one unit immediately. Unknown ids are ignored, and no end
    /// notification is emitted for stopped units.
    fn stop(&mut self, id: UnitId);

    /// Release the output device and discard all pending units.
    fn close(&mut self);
}

/// Factory for output contexts.
pub trait OutputDevice: Send {
    /// Open the output device.
    ///
    /// Units that play to completion report their id on `ended`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::DeviceUnavailable`] when no usable output
    /// device exists or the stream cannot be opened.
    fn open(
        &mut self,
        config: &AudioConfig,
        ended: mpsc::UnboundedSender<UnitId>,
    ) -> Result<Box<dyn OutputContext>>;
}

struct ScheduledUnit {
    id: UnitId,
    samples: Vec<f32>,
    start_frame: u64,
    cursor: usize,
}

struct MixerState {
    units: Vec<ScheduledUnit>,
    frames_written: u64,
    ended: mpsc::UnboundedSender<UnitId>,
}

impl MixerState {
    fn new(ended: mpsc::UnboundedSender<UnitId>) -> Self {
        Self {
            units: Vec::new(),
            frames_written: 0,
            ended,
        }
    }
}

/// Sum all active units into one output block and advance the clock.
fn mix_block(state: &mut MixerState, data: &mut [f32]) {
    data.fill(0.0);

    let block_start = state.frames_written;
    let block_len = data.len() as u64;
    state.frames_written += block_len;

    let MixerState { units, ended, .. } = state;

    for unit in units.iter_mut() {
        // Units that have begun continue contiguously; late starts clamp
        // to the head of this block without skipping samples.
        let begin = if unit.cursor == 0 {
            unit.start_frame.max(block_start)
        } else {
            block_start
        };
        if begin >= block_start + block_len {
            continue;
        }
        let offset = (begin - block_start) as usize;
        let remaining = unit.samples.len() - unit.cursor;
        let n = remaining.min(data.len() - offset);
        for (dst, src) in data[offset..offset + n]
            .iter_mut()
            .zip(&unit.samples[unit.cursor..unit.cursor + n])
        {
            *dst += src;
        }
        unit.cursor += n;
    }

    units.retain(|u| {
        if u.cursor >= u.samples.len() {
            let _ = ended.send(u.id);
            false
        } else {
            true
        }
    });

    for sample in data.iter_mut() {
        *sample = sample.clamp(-1.0, 1.0);
    }
}

/// Mixing output context backed by a cpal stream.
pub struct CpalOutput {
    state: Arc<Mutex<MixerState>>,
    stream: Option<cpal::Stream>,
    sample_rate: u32,
}

impl OutputContext for CpalOutput {
    fn current_time(&self) -> f64 {
        let frames = self.state.lock().map_or(0, |s| s.frames_written);
        frames as f64 / f64::from(self.sample_rate)
    }

    fn play_at(&mut self, id: UnitId, buffer: SampleBuffer, start: f64) -> Result<()> {
        if self.stream.is_none() {
            return Err(VoiceError::Audio("output context is closed".into()));
        }
        let start_frame = (start.max(0.0) * f64::from(self.sample_rate)).round() as u64;
        let samples = buffer.into_mono();
        if let Ok(mut state) = self.state.lock() {
            state.units.push(ScheduledUnit {
                id,
                samples,
                start_frame,
                cursor: 0,
            });
        }
        Ok(())
    }

    fn stop(&mut self, id: UnitId) {
        if let Ok(mut state) = self.state.lock() {
            state.units.retain(|u| u.id != id);
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }
        if let Ok(mut state) = self.state.lock() {
            state.units.clear();
        }
        debug!("output context closed");
    }
}

/// System audio output via cpal.
#[derive(Debug, Default)]
pub struct CpalOutputDevice;

impl OutputDevice for CpalOutputDevice {
    fn open(
        &mut self,
        config: &AudioConfig,
        ended: mpsc::UnboundedSender<UnitId>,
    ) -> Result<Box<dyn OutputContext>> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| {
                    VoiceError::DeviceUnavailable(format!("output device '{name}' not found"))
                })?
        } else {
            host.default_output_device()
                .ok_or_else(|| VoiceError::DeviceUnavailable("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let sample_rate = config.output_sample_rate;
        let stream_config = StreamConfig {
            channels: 1,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let state = Arc::new(Mutex::new(MixerState::new(ended)));
        let callback_state = Arc::clone(&state);

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut state = match callback_state.lock() {
                        Ok(s) => s,
                        Err(_) => return,
                    };
                    mix_block(&mut state, data);
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| {
                VoiceError::DeviceUnavailable(format!("failed to build output stream: {e}"))
            })?;

        stream
            .play()
            .map_err(|e| {
                VoiceError::DeviceUnavailable(format!("failed to start output stream: {e}"))
            })?;

        info!("audio output opened at {sample_rate}Hz");

        Ok(Box::new(CpalOutput {
            state,
            stream: Some(stream),
            sample_rate,
        }))
    }
}

impl CpalOutputDevice {
    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
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

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn state_with_unit(
        id: UnitId,
        samples: Vec<f32>,
        start_frame: u64,
    ) -> (MixerState, mpsc::UnboundedReceiver<UnitId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = MixerState::new(tx);
        state.units.push(ScheduledUnit {
            id,
            samples,
            start_frame,
            cursor: 0,
        });
        (state, rx)
    }

    #[test]
    fn unit_begins_at_its_start_frame() {
        let (mut state, _rx) = state_with_unit(1, vec![0.5; 4], 2);
        let mut block = [0.0f32; 8];
        mix_block(&mut state, &mut block);
        assert_eq!(block, [0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
        assert_eq!(state.frames_written, 8);
    }

    #[test]
    fn unit_spans_blocks_contiguously() {
        let (mut state, _rx) = state_with_unit(1, vec![0.5; 6], 2);
        let mut first = [0.0f32; 4];
        mix_block(&mut state, &mut first);
        assert_eq!(first, [0.0, 0.0, 0.5, 0.5]);

        let mut second = [0.0f32; 4];
        mix_block(&mut state, &mut second);
        assert_eq!(second, [0.5, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn late_start_begins_immediately_without_skipping() {
        let (mut state, _rx) = state_with_unit(1, vec![0.5; 4], 0);
        let mut warmup = [0.0f32; 8];
        mix_block(&mut state, &mut warmup);
        // Clock is now at frame 8; a unit scheduled for frame 4 is late.
        state.units.push(ScheduledUnit {
            id: 2,
            samples: vec![0.25; 4],
            start_frame: 4,
            cursor: 0,
        });
        let mut block = [0.0f32; 8];
        mix_block(&mut state, &mut block);
        assert_eq!(block[..4], [0.25, 0.25, 0.25, 0.25]);
        assert_eq!(block[4..], [0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn overlapping_units_are_summed_and_clamped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut state = MixerState::new(tx);
        state.units.push(ScheduledUnit {
            id: 1,
            samples: vec![0.8; 4],
            start_frame: 0,
            cursor: 0,
        });
        state.units.push(ScheduledUnit {
            id: 2,
            samples: vec![0.8; 4],
            start_frame: 0,
            cursor: 0,
        });
        let mut block = [0.0f32; 4];
        mix_block(&mut state, &mut block);
        assert_eq!(block, [1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn completed_unit_reports_ended_once() {
        let (mut state, mut rx) = state_with_unit(7, vec![0.5; 4], 0);
        let mut block = [0.0f32; 8];
        mix_block(&mut state, &mut block);
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert!(rx.try_recv().is_err());
        assert!(state.units.is_empty());

        mix_block(&mut state, &mut block);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stopped_unit_does_not_report_ended() {
        let (mut state, mut rx) = state_with_unit(3, vec![0.5; 4], 0);
        state.units.retain(|u| u.id != 3);
        let mut block = [0.0f32; 8];
        mix_block(&mut state, &mut block);
        assert!(rx.try_recv().is_err());
    }
}
