//! # Bot Module
//!
//! Serenity front end for Open Jukebox.
//!
//! This module contains the thin command layer around the playback core:
//! - Slash command registration ([`commands`])
//! - Command handling and reply formatting ([`handlers`])
//! - Chat announcements for player events ([`events`])
//! - Voice connection management
//!
//! ## Architecture
//!
//! [`JukeboxBot`] implements Serenity's [`EventHandler`]. It owns nothing
//! stateful beyond bookkeeping: queues and playback state belong to the
//! shared [`PlaybackController`], and voice connections to songbird.

use anyhow::Result;
use dashmap::DashMap;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod events;
pub mod handlers;

use crate::{
    audio::{player::PlaybackController, voice::SongbirdSession},
    config::Config,
};

/// Main Discord event handler.
///
/// ## Fields
///
/// - `config`: bot configuration (token, volume, timeouts)
/// - `player`: the playback controller shared by every guild
/// - `http_client`: reused for every songbird HTTP input
/// - `text_channels`: where each guild's announcements go
pub struct JukeboxBot {
    config: Arc<Config>,
    pub player: Arc<PlaybackController>,
    http_client: reqwest::Client,
    text_channels: Arc<DashMap<GuildId, ChannelId>>,
    announcer_started: AtomicBool,
}

impl JukeboxBot {
    pub fn new(config: Config, player: Arc<PlaybackController>) -> Self {
        Self {
            config: Arc::new(config),
            player,
            http_client: reqwest::Client::new(),
            text_channels: Arc::new(DashMap::new()),
            announcer_started: AtomicBool::new(false),
        }
    }

    /// Registers slash commands with Discord.
    ///
    /// Guild commands (when `GUILD_ID` is set) propagate in about a second,
    /// global ones can take up to an hour.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registering slash commands...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                commands::register_guild_commands(ctx, guild_id).await?;
                info!("✅ Guild commands registered for: {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await?;
                info!("✅ Global commands registered");
            }
        }

        Ok(())
    }

    /// Makes sure the bot sits in `channel_id` with a session attached.
    ///
    /// Joins when disconnected, moves when in another channel.
    pub async fn ensure_voice_channel(
        &self,
        ctx: &Context,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<()> {
        let current = self.current_voice_channel(ctx, guild_id).await;
        if current == Some(channel_id) && self.player.has_session(guild_id) {
            return Ok(());
        }

        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird not initialised"))?;

        let call = manager.join(guild_id, channel_id).await.map_err(|e| {
            error!("Error joining voice channel: {:?}", e);
            anyhow::anyhow!("Error connecting to the voice channel")
        })?;

        let session = SongbirdSession::new(
            call,
            self.http_client.clone(),
            self.config.default_volume,
        );
        self.player.attach_session(guild_id, Arc::new(session));

        match current {
            Some(previous) => info!(
                "🔀 Moved from {} to {} in guild {}",
                previous, channel_id, guild_id
            ),
            None => info!("🔊 Connected to voice channel {} in guild {}", channel_id, guild_id),
        }
        Ok(())
    }

    /// Stops playback, drops the queue and disconnects.
    ///
    /// Returns `false` when the bot was not in a voice channel.
    pub async fn leave_voice_channel(&self, ctx: &Context, guild_id: GuildId) -> Result<bool> {
        let manager = songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow::anyhow!("Songbird not initialised"))?;

        if manager.get(guild_id).is_none() {
            return Ok(false);
        }

        self.player.leave(guild_id);
        manager.remove(guild_id).await?;

        info!("👋 Disconnected from voice in guild {}", guild_id);
        Ok(true)
    }

    pub async fn current_voice_channel(&self, ctx: &Context, guild_id: GuildId) -> Option<ChannelId> {
        let manager = songbird::get(ctx).await?;
        let call = manager.get(guild_id)?;
        let channel = call.lock().await.current_channel();
        channel.map(|id| ChannelId::from(id.0))
    }

    pub fn remember_text_channel(&self, guild_id: GuildId, channel_id: ChannelId) {
        self.text_channels.insert(guild_id, channel_id);
    }
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} is online!", ready.user.name);
        info!("📊 Connected to {} servers", ready.guilds.len());
        info!("🎛️ Player holds queues for {} guilds", self.player.guild_count());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error registering commands: {:?}", e);
        }

        // `ready` fires again after reconnects; one announcer is enough.
        if !self.announcer_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(events::announce_player_events(
                ctx.http.clone(),
                self.player.subscribe(),
                self.text_channels.clone(),
            ));
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                error!("Error handling command: {:?}", e);
            }
        }
    }

    /// Clears the guild when the bot is disconnected from outside.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }

        let Some(guild_id) = new.guild_id else {
            return;
        };

        let manager = songbird::get(&ctx).await;
        let call = manager.as_ref().and_then(|manager| manager.get(guild_id));
        let call_channel = match &call {
            Some(call) => Some(call.lock().await.current_channel()),
            None => None,
        };

        match disconnect_action(call_channel) {
            DisconnectAction::Ignore => {
                debug!("Ignoring stale disconnect in guild {}", guild_id);
                return;
            }
            DisconnectAction::Cleanup { drop_call } => {
                if let (true, Some(manager)) = (drop_call, &manager) {
                    if let Err(e) = manager.remove(guild_id).await {
                        warn!("Could not drop voice call in guild {}: {:?}", guild_id, e);
                    }
                }
            }
        }

        warn!("🔌 Bot disconnected from voice in guild {}", guild_id);
        let dropped = self.player.leave(guild_id);
        info!("🧹 Cleared guild {} after disconnect ({} tracks)", guild_id, dropped);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum DisconnectAction {
    Ignore,
    Cleanup { drop_call: bool },
}

/// Decides what a "bot left voice" event means, given the channel songbird's
/// call reports for the guild (`None` when there is no call at all).
///
/// Events are dispatched concurrently, so the disconnect may land after a
/// `/play` that already rejoined; songbird's call is the source of truth.
fn disconnect_action(call_channel: Option<Option<songbird::id::ChannelId>>) -> DisconnectAction {
    match call_channel {
        Some(Some(_)) => DisconnectAction::Ignore,
        Some(None) => DisconnectAction::Cleanup { drop_call: true },
        None => DisconnectAction::Cleanup { drop_call: false },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU64;

    #[test]
    fn late_disconnect_after_rejoin_is_ignored() {
        let rejoined = songbird::id::ChannelId(NonZeroU64::new(5).unwrap());
        assert_eq!(disconnect_action(Some(Some(rejoined))), DisconnectAction::Ignore);
    }

    #[test]
    fn dead_call_is_removed_before_cleanup() {
        assert_eq!(
            disconnect_action(Some(None)),
            DisconnectAction::Cleanup { drop_call: true }
        );
        assert_eq!(
            disconnect_action(None),
            DisconnectAction::Cleanup { drop_call: false }
        );
    }
}
