//! Error types for the playback core.
//!
//! The bot shell works with [`anyhow::Result`]; everything below the command
//! layer reports through [`PlayerError`] so callers can tell a bad query from
//! a missing voice connection.

use serenity::model::id::GuildId;
use std::time::Duration;
use thiserror::Error;

/// Result alias used by the playback core.
pub type PlayerResult<T> = std::result::Result<T, PlayerError>;

/// A query could not be turned into a playable track.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ResolutionError(pub String);

/// A queued track's locator could not be opened for playback.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StreamOpenError(pub String);

#[derive(Debug, Clone, Error)]
pub enum PlayerError {
    #[error("could not resolve track: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("could not open stream: {0}")]
    StreamOpen(#[from] StreamOpenError),

    #[error("no active voice connection in guild {0}")]
    NotConnected(GuildId),

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },
}
