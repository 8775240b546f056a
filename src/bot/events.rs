use dashmap::DashMap;
use serenity::{
    http::Http,
    model::id::{ChannelId, GuildId},
};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::audio::events::PlayerEvent;

/// Chat line posted for a player event, if it deserves one.
pub fn announcement(event: &PlayerEvent) -> Option<String> {
    match event {
        PlayerEvent::TrackStarted { title, .. } => Some(format!("🎧 Now playing: **{}**", title)),
        PlayerEvent::TrackFailed { title, error, .. } => Some(format!(
            "❌ Error while playing the next song **{}**: {}",
            title, error
        )),
        PlayerEvent::TrackQueued { .. }
        | PlayerEvent::TrackFinished { .. }
        | PlayerEvent::QueueFinished { .. } => None,
    }
}

/// Posts player events to the text channel each guild last used `/play` in.
///
/// Runs until the controller's event channel closes.
pub async fn announce_player_events(
    http: Arc<Http>,
    mut events: broadcast::Receiver<PlayerEvent>,
    channels: Arc<DashMap<GuildId, ChannelId>>,
) {
    info!("📣 Player announcements enabled");

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!("Announcer fell behind, {} events dropped", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        debug!("Player event: {:?}", event);

        let Some(message) = announcement(&event) else {
            continue;
        };
        let Some(channel_id) = channels.get(&event.guild_id()).map(|c| *c) else {
            continue;
        };

        if let Err(e) = channel_id.say(&http, message).await {
            error!("Error sending announcement to {}: {:?}", channel_id, e);
        }
    }

    debug!("Announcer stopped");
}
