use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::model::id::GuildId;
use std::{collections::VecDeque, sync::Arc};
use tracing::{debug, info};

use super::track::Track;

/// Pending tracks of a single guild, in play order.
///
/// The track that is currently playing is never stored here.
#[derive(Debug)]
pub struct GuildQueue {
    guild_id: GuildId,
    tracks: VecDeque<Track>,
}

impl GuildQueue {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            tracks: VecDeque::new(),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Appends a track at the tail and returns its 1-based position.
    pub fn push_back(&mut self, track: Track) -> usize {
        info!("➕ Queued in guild {}: {}", self.guild_id, track.title());
        self.tracks.push_back(track);
        self.tracks.len()
    }

    pub fn pop_front(&mut self) -> Option<Track> {
        let next = self.tracks.pop_front();
        match &next {
            Some(track) => debug!("➡️ Next in guild {} (FIFO): {}", self.guild_id, track.title()),
            None => debug!("📭 Queue empty in guild {}", self.guild_id),
        }
        next
    }

    /// Copies the pending tracks out so callers never see the live container.
    pub fn snapshot(&self) -> Vec<Track> {
        self.tracks.iter().cloned().collect()
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.tracks.len();
        self.tracks.clear();
        info!("🗑️ Queue cleared in guild {}: {} tracks removed", self.guild_id, cleared);
        cleared
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Process-wide map from guild to its queue.
///
/// Entries are created on first touch and live until the process exits. Each
/// queue sits behind its own lock, so two guilds never contend with each other.
#[derive(Debug, Default)]
pub struct GuildQueueRegistry {
    queues: DashMap<GuildId, Arc<Mutex<GuildQueue>>>,
}

impl GuildQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<Mutex<GuildQueue>> {
        self.queues
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(GuildQueue::new(guild_id))))
            .clone()
    }

    /// Returns the 1-based position the track landed at.
    pub fn enqueue(&self, guild_id: GuildId, track: Track) -> usize {
        self.get_or_create(guild_id).lock().push_back(track)
    }

    pub fn pop_front(&self, guild_id: GuildId) -> Option<Track> {
        self.get_or_create(guild_id).lock().pop_front()
    }

    pub fn peek(&self, guild_id: GuildId) -> Vec<Track> {
        match self.queues.get(&guild_id) {
            Some(queue) => queue.lock().snapshot(),
            None => Vec::new(),
        }
    }

    pub fn clear(&self, guild_id: GuildId) -> usize {
        match self.queues.get(&guild_id) {
            Some(queue) => queue.lock().clear(),
            None => 0,
        }
    }

    pub fn len(&self, guild_id: GuildId) -> usize {
        self.queues
            .get(&guild_id)
            .map(|queue| queue.lock().len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, guild_id: GuildId) -> bool {
        self.queues
            .get(&guild_id)
            .map_or(true, |queue| queue.lock().is_empty())
    }

    /// Number of guilds that have ever used the player.
    pub fn guild_count(&self) -> usize {
        self.queues.len()
    }
}
