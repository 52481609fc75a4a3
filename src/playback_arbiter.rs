//! Process-wide playback token.
//!
//! At most one track holds the token. Rows never command each other: each row
//! compares its own id with the published token to decide whether to play.

use crate::protocol::TrackId;

/// What a row should do with its media element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackIntent {
    Play,
    Pause,
}

/// Token change produced by an arbiter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackTransition {
    pub previous: Option<TrackId>,
    pub current: Option<TrackId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackArbiter {
    active: Option<TrackId>,
}

impl PlaybackArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.as_deref() == Some(id)
    }

    pub fn intent(&self, id: &str) -> PlaybackIntent {
        if self.is_active(id) {
            PlaybackIntent::Play
        } else {
            PlaybackIntent::Pause
        }
    }

    fn replace(&mut self, next: Option<TrackId>) -> Option<PlaybackTransition> {
        if self.active == next {
            return None;
        }
        let previous = std::mem::replace(&mut self.active, next);
        Some(PlaybackTransition {
            previous,
            current: self.active.clone(),
        })
    }

    /// Hands the token to `id`, implicitly silencing whoever held it.
    pub fn activate(&mut self, id: TrackId) -> Option<PlaybackTransition> {
        self.replace(Some(id))
    }

    /// Explicit pause by the user.
    pub fn deactivate(&mut self) -> Option<PlaybackTransition> {
        self.replace(None)
    }

    /// Natural end of `id`'s media. Ignored unless `id` holds the token, so a
    /// late event from a row that was already silenced cannot stop another.
    pub fn ended(&mut self, id: &str) -> Option<PlaybackTransition> {
        self.release(id)
    }

    /// Drops the token if `id` holds it; used when `id`'s media is removed.
    pub fn release(&mut self, id: &str) -> Option<PlaybackTransition> {
        if !self.is_active(id) {
            return None;
        }
        self.replace(None)
    }
}
