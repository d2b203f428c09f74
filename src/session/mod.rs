//! Live agent sessions.
//!
//! A [`LiveSession`] is an opaque full-duplex handle: encoded microphone
//! frames go out, [`SessionEvent`]s come in. The [`Connector`] seam lets
//! tests drive the client with a scripted session instead of a network.

pub mod gemini;

pub use gemini::GeminiConnector;

use crate::config::AgentConfig;
use crate::error::{Result, VoiceError};
use crate::pcm::EncodedBlob;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// Events emitted by a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The remote end accepted the session and is ready for audio.
    Opened,
    /// One chunk of agent audio, still in its wire encoding.
    Chunk { payload: String },
    /// The agent was interrupted; pending playback should be discarded.
    Interrupted,
    /// The session failed. Fatal to the session.
    Error { message: String },
    /// The remote end closed the connection.
    Closed { code: Option<u16>, reason: String },
}

/// Frames the client pushes toward the remote end.
#[derive(Debug)]
pub enum OutboundFrame {
    /// One encoded microphone frame.
    Audio(EncodedBlob),
    /// Ask the transport to close cleanly.
    Close,
}

/// Handle to one live session.
///
/// Dropping the handle abandons the transport tasks, which exit once their
/// channels close.
pub struct LiveSession {
    outbound: mpsc::Sender<OutboundFrame>,
    /// Inbound session events, in arrival order.
    pub events: mpsc::Receiver<SessionEvent>,
    session_id: String,
}

impl LiveSession {
    pub fn new(
        outbound: mpsc::Sender<OutboundFrame>,
        events: mpsc::Receiver<SessionEvent>,
        session_id: String,
    ) -> Self {
        Self {
            outbound,
            events,
            session_id,
        }
    }

    /// Push one microphone frame toward the agent without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Channel`] when the outbound queue is full or
    /// the transport has shut down. Callers drop the frame; session
    /// failures surface through [`SessionEvent`]s instead.
    pub fn send(&self, blob: EncodedBlob) -> Result<()> {
        use mpsc::error::TrySendError;
        self.outbound
            .try_send(OutboundFrame::Audio(blob))
            .map_err(|e| match e {
                TrySendError::Full(_) => VoiceError::Channel("session outbound queue full".into()),
                TrySendError::Closed(_) => {
                    VoiceError::Channel("session transport has shut down".into())
                }
            })
    }

    /// Request a clean close. Best effort: a transport already gone is fine.
    pub fn close(&self) {
        if self.outbound.try_send(OutboundFrame::Close).is_err() {
            debug!("close requested on inactive session transport");
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Connects to a remote conversational agent.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a session.
    ///
    /// Resolution of the returned future means the transport is up and the
    /// session is being negotiated; readiness arrives later as
    /// [`SessionEvent::Opened`].
    ///
    /// # Errors
    ///
    /// Returns an error when the transport cannot be established at all.
    async fn connect(&self, config: &AgentConfig) -> Result<LiveSession>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::pcm::AudioFormat;

    fn blob() -> EncodedBlob {
        EncodedBlob {
            data: vec![0, 0],
            format: AudioFormat::pcm16_mono(16_000),
        }
    }

    #[tokio::test]
    async fn send_forwards_audio_frames() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (_ev_tx, ev_rx) = mpsc::channel(4);
        let session = LiveSession::new(out_tx, ev_rx, "s-1".into());

        session.send(blob()).unwrap();
        assert!(matches!(out_rx.recv().await, Some(OutboundFrame::Audio(_))));
    }

    #[tokio::test]
    async fn send_reports_full_queue_without_blocking() {
        let (out_tx, _out_rx) = mpsc::channel(1);
        let (_ev_tx, ev_rx) = mpsc::channel(4);
        let session = LiveSession::new(out_tx, ev_rx, "s-2".into());

        session.send(blob()).unwrap();
        assert!(matches!(
            session.send(blob()),
            Err(VoiceError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn close_is_best_effort_after_transport_exit() {
        let (out_tx, out_rx) = mpsc::channel(4);
        let (_ev_tx, ev_rx) = mpsc::channel(4);
        let session = LiveSession::new(out_tx, ev_rx, "s-3".into());

        drop(out_rx);
        session.close();
        assert!(session.send(blob()).is_err());
    }
}
