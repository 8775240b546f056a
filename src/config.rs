use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub guild_id: Option<u64>, // For development command registration

    // Audio
    pub default_volume: f32,
    pub ytdlp_path: String,

    // Timeouts, in seconds. 0 disables the limit.
    pub resolve_timeout_secs: u64,
    pub stream_open_timeout_secs: u64,

    // Player event buffer
    pub event_capacity: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            discord_token: std::env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN environment variable not found"))?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            default_volume: std::env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()?,
            ytdlp_path: std::env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string()),

            resolve_timeout_secs: std::env::var("RESOLVE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            stream_open_timeout_secs: std::env::var("STREAM_OPEN_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,

            event_capacity: std::env::var("EVENT_CAPACITY")
                .unwrap_or_else(|_| "64".to_string())
                .parse()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// - Volume must be between 0.0 and 2.0
    /// - The token must not be blank
    /// - The event buffer must hold at least one event
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN must not be empty");
        }

        if !(0.0..=2.0).contains(&self.default_volume) {
            anyhow::bail!(
                "Default volume must be between 0.0 and 2.0, got: {}",
                self.default_volume
            );
        }

        if self.ytdlp_path.trim().is_empty() {
            anyhow::bail!("YTDLP_PATH must not be empty");
        }

        if self.event_capacity == 0 {
            anyhow::bail!("Event capacity must be greater than 0");
        }

        Ok(())
    }

    pub fn resolve_timeout(&self) -> Option<Duration> {
        (self.resolve_timeout_secs > 0).then(|| Duration::from_secs(self.resolve_timeout_secs))
    }

    pub fn stream_open_timeout(&self) -> Option<Duration> {
        (self.stream_open_timeout_secs > 0)
            .then(|| Duration::from_secs(self.stream_open_timeout_secs))
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The token is never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: commands {}\n  \
            Audio: {}% vol, resolver {}\n  \
            Timeouts: resolve {}, stream open {}",
            self.guild_id
                .map_or("global".to_string(), |id| format!("in guild {}", id)),
            (self.default_volume * 100.0) as u32,
            self.ytdlp_path,
            describe_timeout(self.resolve_timeout()),
            describe_timeout(self.stream_open_timeout()),
        )
    }
}

fn describe_timeout(timeout: Option<Duration>) -> String {
    match timeout {
        Some(limit) => format!("{}s", limit.as_secs()),
        None => "off".to_string(),
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            guild_id: None,

            default_volume: 0.5,
            ytdlp_path: "yt-dlp".to_string(),

            resolve_timeout_secs: 30,
            stream_open_timeout_secs: 30,

            event_capacity: 64,
        }
    }
}
