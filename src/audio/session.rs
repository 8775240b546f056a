//! Contracts between the playback controller and the voice transport.
//!
//! A [`VoiceSession`] is whatever can stream audio into one guild's voice
//! channel. It gets a [`TrackEndNotifier`] with every track and must fire it
//! exactly once when that track stops for any reason.

use async_trait::async_trait;
use serenity::model::id::GuildId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::StreamOpenError;

/// Monotonic id handed out per playback attempt.
pub type PlaybackId = u64;

/// Completion message posted back into the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackEnded {
    pub guild_id: GuildId,
    pub playback_id: PlaybackId,
}

/// One-shot completion signal for a single playback.
///
/// `notify` consumes the notifier, so a track can never report twice.
#[derive(Debug)]
pub struct TrackEndNotifier {
    guild_id: GuildId,
    playback_id: PlaybackId,
    tx: mpsc::UnboundedSender<TrackEnded>,
}

impl TrackEndNotifier {
    pub(crate) fn new(
        guild_id: GuildId,
        playback_id: PlaybackId,
        tx: mpsc::UnboundedSender<TrackEnded>,
    ) -> Self {
        Self {
            guild_id,
            playback_id,
            tx,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn playback_id(&self) -> PlaybackId {
        self.playback_id
    }

    pub fn notify(self) {
        let event = TrackEnded {
            guild_id: self.guild_id,
            playback_id: self.playback_id,
        };
        // The receiver is gone only while the process shuts down.
        if self.tx.send(event).is_err() {
            debug!("Completion for guild {} dropped, dispatcher stopped", self.guild_id);
        }
    }
}

/// Control over a track that is already streaming.
pub trait PlaybackHandle: Send + Sync {
    /// Stops the track; the session then fires the track's notifier.
    fn stop(&self);
}

#[async_trait]
pub trait VoiceSession: Send + Sync {
    /// Opens `source_locator` and starts streaming it.
    ///
    /// On error the notifier is dropped without firing.
    async fn play(
        &self,
        source_locator: &str,
        on_end: TrackEndNotifier,
    ) -> Result<Box<dyn PlaybackHandle>, StreamOpenError>;

    async fn is_connected(&self) -> bool;
}
