//! Per-guild queueing Discord music bot.
//!
//! The interesting part lives in [`audio`]: a queue per guild and a playback
//! state machine that keeps exactly one track playing and advances on its own.
//! [`sources`] resolves user queries, [`bot`] is the serenity front end.

pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod sources;
