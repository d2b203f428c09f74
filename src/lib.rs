//! Selkie: real-time full-duplex voice sessions with a conversational agent.
//!
//! Microphone audio is framed, PCM-encoded, and streamed to a remote agent
//! over a live session; agent audio streams back and plays gaplessly, with
//! barge-in interruption support.
//!
//! # Architecture
//!
//! Everything hangs off one cooperative event loop:
//! - **Capture**: records from the microphone via `cpal`, frames and
//!   encodes to 16-bit PCM
//! - **Session**: full-duplex transport to the agent (Gemini Live over
//!   websocket by default), surfaced as an event stream
//! - **Playback**: decoded agent chunks scheduled back-to-back on a mixing
//!   output stream
//! - **Client**: the state machine tying them together, driven through
//!   cloneable handles

pub mod activity;
pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod pcm;
pub mod session;

pub use client::{ClientEvent, ClientHandle, ConnectionState, VoiceClient};
pub use config::VoiceConfig;
pub use error::{Result, VoiceError};
pub use pcm::{AudioFormat, EncodedBlob, SampleBuffer};
pub use session::{Connector, LiveSession, SessionEvent};
