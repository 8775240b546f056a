use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::CommandOptionType, id::GuildId},
    prelude::Context,
};

/// Registers commands globally
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    for command in all_commands() {
        ctx.http.create_global_command(&command).await?;
    }

    Ok(())
}

/// Registers commands for a single guild (development)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;

    Ok(())
}

fn all_commands() -> Vec<CreateCommand> {
    vec![play_command(), skip_command(), queue_command(), leave_command()]
}

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Play a song from a URL or search terms")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "query", "URL or search terms")
                .required(true),
        )
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Skip the current song")
}

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue").description("Show the playback queue")
}

fn leave_command() -> CreateCommand {
    CreateCommand::new("leave").description("Make the bot leave the voice channel")
}
