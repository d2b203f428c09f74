//! Agent speaking-state tracking.
//!
//! The primary quiet signal is the playback queue draining (every scheduled
//! unit finished or flushed). A debounce deadline re-armed on each inbound
//! chunk backs that up, so a missed end notification cannot leave the state
//! stuck at speaking.

use std::time::Duration;
use tokio::time::Instant;

/// Tracks whether the agent is audibly speaking.
#[derive(Debug)]
pub struct SpeakingTracker {
    quiet_interval: Duration,
    speaking: bool,
    deadline: Option<Instant>,
}

impl SpeakingTracker {
    pub fn new(quiet_interval: Duration) -> Self {
        Self {
            quiet_interval,
            speaking: false,
            deadline: None,
        }
    }

    /// Note an inbound audio chunk at `now`.
    ///
    /// Re-arms the quiet deadline and returns `true` if this transitioned
    /// the state from quiet to speaking.
    pub fn on_chunk(&mut self, now: Instant) -> bool {
        self.deadline = Some(now + self.quiet_interval);
        if self.speaking {
            false
        } else {
            self.speaking = true;
            true
        }
    }

    /// Note that playback has drained or been flushed.
    ///
    /// Returns `true` if this transitioned the state from speaking to quiet.
    pub fn on_idle(&mut self) -> bool {
        self.deadline = None;
        if self.speaking {
            self.speaking = false;
            true
        } else {
            false
        }
    }

    /// Check the failsafe deadline at `now`.
    ///
    /// Returns `true` if the deadline had passed and this transitioned the
    /// state from speaking to quiet. A deadline superseded by a newer chunk
    /// has no effect.
    pub fn on_deadline(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                if self.speaking {
                    self.speaking = false;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// The armed failsafe deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }
}
