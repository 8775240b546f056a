//! # Audio Module
//!
//! Per-guild queueing and playback for Open Jukebox.
//!
//! ## Architecture
//!
//! ### [`track`] - Track
//! - Immutable description of one playable item
//!
//! ### [`queue`] - Queue Management
//! - FIFO queue per guild, one lock per guild
//! - Process-wide registry, entries created lazily
//!
//! ### [`player`] - Playback Controller
//! - `Idle -> Loading -> Playing` state machine per guild
//! - Auto-advance driven by completion messages
//! - Stream-open failures skip to the next track
//!
//! ### [`session`] / [`voice`] - Voice Transport
//! - Traits the controller plays through
//! - Songbird implementation used by the bot
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_jukebox::audio::player::{ControllerOptions, PlaybackController};
//! use open_jukebox::sources::YtDlpResolver;
//! use serenity::all::GuildId;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let player = PlaybackController::start(
//!     Arc::new(YtDlpResolver::default()),
//!     ControllerOptions::default(),
//! );
//! let guild_id = GuildId::new(123456789);
//!
//! // A voice session must be attached first (see `voice::SongbirdSession`).
//! player.enqueue(guild_id, "never gonna give you up").await?;
//! player.skip(guild_id);
//! println!("{:?}", player.list_pending(guild_id));
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod player;
pub mod queue;
pub mod session;
pub mod track;
pub mod voice;
