use anyhow::Result;
use serenity::{
    builder::{
        CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse,
    },
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::time::Duration;
use tracing::{info, warn};

use crate::{audio::track::Track, bot::JukeboxBot};

/// Longest queue listing we print before collapsing the tail.
const MAX_LISTED: usize = 20;

/// Dispatches slash commands
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &JukeboxBot,
) -> Result<()> {
    let Some(guild_id) = command.guild_id else {
        return respond(ctx, &command, "❌ This command only works inside a server", true).await;
    };

    info!(
        "📝 Command /{} used by {} in guild {}",
        command.data.name, command.user.name, guild_id
    );

    match command.data.name.as_str() {
        "play" => handle_play(ctx, &command, bot, guild_id).await?,
        "skip" => handle_skip(ctx, &command, bot, guild_id).await?,
        "queue" => handle_queue(ctx, &command, bot, guild_id).await?,
        "leave" => handle_leave(ctx, &command, bot, guild_id).await?,
        _ => respond(ctx, &command, "❌ Unknown command", true).await?,
    }

    Ok(())
}

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let query = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "query")
        .and_then(|opt| opt.value.as_str())
        .ok_or_else(|| anyhow::anyhow!("Query not provided"))?
        .to_string();

    let Some(voice_channel_id) = get_user_voice_channel(ctx, guild_id, command.user.id) else {
        return respond(ctx, command, "You need to join a voice channel first!", true).await;
    };

    // Resolving can take a while
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    if let Err(e) = bot.ensure_voice_channel(ctx, guild_id, voice_channel_id).await {
        warn!("Could not join voice in guild {}: {:?}", guild_id, e);
        command
            .edit_response(
                &ctx.http,
                EditInteractionResponse::new().content("❌ Could not join your voice channel"),
            )
            .await?;
        return Ok(());
    }
    bot.remember_text_channel(guild_id, command.channel_id);

    let content = match bot
        .player
        .enqueue_as(guild_id, &query, command.user.id)
        .await
    {
        Ok(track) => format!(
            "🎧 Added **{}**{} to the queue",
            track.title(),
            duration_suffix(&track)
        ),
        Err(e) => {
            warn!("Play failed in guild {}: {}", guild_id, e);
            format!("❌ Error while playing: {}", e)
        }
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;

    Ok(())
}

async fn handle_skip(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let content = if bot.player.skip(guild_id) {
        if bot.player.has_pending(guild_id) {
            "⏭️ Skipped the current song"
        } else {
            "⏭️ Skipped the current song, that was the last one"
        }
    } else {
        "Nothing is playing right now"
    };

    respond(ctx, command, content, false).await
}

async fn handle_queue(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let current = bot.player.now_playing(guild_id);
    let pending = bot.player.pending(guild_id);

    respond(ctx, command, &format_queue(current.as_ref(), &pending), false).await
}

async fn handle_leave(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &JukeboxBot,
    guild_id: GuildId,
) -> Result<()> {
    let content = if bot.leave_voice_channel(ctx, guild_id).await? {
        "👋 I left the voice channel."
    } else {
        "I'm not in any voice channel."
    };

    respond(ctx, command, content, false).await
}

async fn respond(
    ctx: &Context,
    command: &CommandInteraction,
    content: &str,
    ephemeral: bool,
) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;

    Ok(())
}

/// Renders the queue listing shown by `/queue`.
pub fn format_queue(current: Option<&Track>, pending: &[Track]) -> String {
    let mut lines = Vec::new();

    if let Some(track) = current {
        let title = match track.page_url() {
            Some(url) => format!("[{}](<{}>)", track.title(), url),
            None => track.title().to_string(),
        };
        lines.push(format!(
            "▶️ Now playing: **{}**{}{}",
            title,
            duration_suffix(track),
            requester_suffix(track)
        ));
    }

    if pending.is_empty() {
        lines.push("The queue is empty".to_string());
        return lines.join("\n");
    }

    lines.push("📋 Queue:".to_string());
    lines.extend(pending.iter().take(MAX_LISTED).enumerate().map(|(i, track)| {
        format!(
            "{}. {}{}{} <t:{}:R>",
            i + 1,
            track.title(),
            duration_suffix(track),
            requester_suffix(track),
            track.added_at().timestamp()
        )
    }));
    if pending.len() > MAX_LISTED {
        lines.push(format!("…and {} more", pending.len() - MAX_LISTED));
    }

    let mut info = format!("**Total:** {} songs", pending.len());
    let total: Duration = pending.iter().filter_map(Track::duration).sum();
    if total > Duration::ZERO {
        info.push_str(&format!(" • **Duration:** {}", format_duration(total)));
    }
    lines.push(info);

    lines.join("\n")
}

fn duration_suffix(track: &Track) -> String {
    match track.duration() {
        Some(duration) => format!(" `[{}]`", format_duration(duration)),
        None => String::new(),
    }
}

fn requester_suffix(track: &Track) -> String {
    match track.requested_by() {
        Some(user_id) => format!(" · requested by <@{}>", user_id),
        None => String::new(),
    }
}

fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;

    let channel_id = guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id);

    channel_id
}
