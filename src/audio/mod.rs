//! Audio capture and scheduled playback via cpal.

pub mod capture;
pub mod output;
pub mod playback;

pub use capture::{CaptureEngine, CpalMicrophone, MicStream, Microphone};
pub use output::{CpalOutputDevice, OutputContext, OutputDevice, UnitId};
pub use playback::PlaybackScheduler;
