use serenity::model::id::GuildId;

/// Notifications published by the playback controller.
///
/// Delivered over a `tokio::sync::broadcast` channel; a subscriber that lags
/// behind simply misses the oldest ones.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    TrackQueued {
        guild_id: GuildId,
        title: String,
        position: usize,
    },
    TrackStarted {
        guild_id: GuildId,
        title: String,
    },
    TrackFinished {
        guild_id: GuildId,
        title: String,
        skipped: bool,
    },
    TrackFailed {
        guild_id: GuildId,
        title: String,
        error: String,
    },
    QueueFinished {
        guild_id: GuildId,
    },
}

impl PlayerEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            Self::TrackQueued { guild_id, .. }
            | Self::TrackStarted { guild_id, .. }
            | Self::TrackFinished { guild_id, .. }
            | Self::TrackFailed { guild_id, .. }
            | Self::QueueFinished { guild_id } => *guild_id,
        }
    }
}
