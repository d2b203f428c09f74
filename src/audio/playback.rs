//! Gapless playback scheduling over an output context.
//!
//! The scheduler keeps a cursor one step ahead of real time: each buffer is
//! scheduled at `max(cursor, now)` and the cursor advances by the buffer's
//! duration, so consecutive chunks butt against each other with no gaps.

use crate::audio::output::{OutputContext, UnitId};
use crate::error::{Result, VoiceError};
use crate::pcm::SampleBuffer;
use std::collections::HashSet;
use tracing::debug;

/// Schedules decoded audio buffers back-to-back and tracks which are still
/// playing.
pub struct PlaybackScheduler {
    ctx: Option<Box<dyn OutputContext>>,
    cursor: f64,
    outstanding: HashSet<UnitId>,
    next_unit_id: UnitId,
}

impl PlaybackScheduler {
    pub fn new(ctx: Box<dyn OutputContext>) -> Self {
        Self {
            ctx: Some(ctx),
            cursor: 0.0,
            outstanding: HashSet::new(),
            next_unit_id: 0,
        }
    }

    /// Number units starting from `id` instead of zero.
    ///
    /// Seeding each scheduler past its predecessor's watermark keeps ids
    /// unique across scheduler generations, so an end notification that
    /// outlives its scheduler cannot be mistaken for a current unit.
    #[must_use]
    pub fn with_first_unit_id(mut self, id: UnitId) -> Self {
        self.next_unit_id = id;
        self
    }

    /// The id the next enqueued buffer would get.
    pub fn next_unit_id(&self) -> UnitId {
        self.next_unit_id
    }

    /// Schedule `buffer` to play immediately after everything already
    /// enqueued, or now if the queue has drained.
    ///
    /// # Errors
    ///
    /// Returns an error when the scheduler has been torn down or the
    /// context rejects the buffer.
    pub fn enqueue(&mut self, buffer: SampleBuffer) -> Result<UnitId> {
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| VoiceError::Audio("playback scheduler is torn down".into()))?;

        let duration = buffer.duration_secs();
        let now = ctx.current_time();
        let start = self.cursor.max(now);
        let id = self.next_unit_id;
        self.next_unit_id += 1;

        ctx.play_at(id, buffer, start)?;
        self.outstanding.insert(id);
        self.cursor = start + duration;
        debug!("scheduled unit {id}: start {start:.3}s, duration {duration:.3}s");
        Ok(id)
    }

    /// Record that a unit finished playing.
    ///
    /// Returns `true` when this notification emptied the outstanding set,
    /// i.e. playback just went idle. Ids already removed by a flush are
    /// ignored.
    pub fn on_unit_ended(&mut self, id: UnitId) -> bool {
        if !self.outstanding.remove(&id) {
            return false;
        }
        self.outstanding.is_empty()
    }

    /// Stop everything scheduled and rewind the cursor to zero.
    ///
    /// The next enqueue starts at the current clock time.
    pub fn flush(&mut self) {
        if let Some(ctx) = self.ctx.as_mut() {
            for id in self.outstanding.drain() {
                ctx.stop(id);
            }
        } else {
            self.outstanding.clear();
        }
        self.cursor = 0.0;
        debug!("playback flushed");
    }

    /// Flush and release the output context. Idempotent.
    pub fn teardown(&mut self) {
        self.flush();
        if let Some(mut ctx) = self.ctx.take() {
            ctx.close();
        }
    }

    /// Whether no scheduled unit is still playing.
    pub fn is_idle(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Where the next enqueued buffer would be scheduled no earlier than.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }
}
