use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::model::id::{GuildId, UserId};
use std::{
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        events::PlayerEvent,
        queue::GuildQueueRegistry,
        session::{PlaybackHandle, PlaybackId, TrackEndNotifier, TrackEnded, VoiceSession},
        track::Track,
    },
    config::Config,
    error::{PlayerError, PlayerResult, StreamOpenError},
    sources::SourceResolver,
};

/// Coarse per-guild state, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Idle,
    Loading,
    Playing,
}

/// Tuning knobs for [`PlaybackController`].
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// `None` waits for the resolver indefinitely.
    pub resolve_timeout: Option<Duration>,
    /// `None` waits for the stream to open indefinitely.
    pub stream_open_timeout: Option<Duration>,
    pub event_capacity: usize,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            resolve_timeout: None,
            stream_open_timeout: None,
            event_capacity: 64,
        }
    }
}

impl From<&Config> for ControllerOptions {
    fn from(config: &Config) -> Self {
        Self {
            resolve_timeout: config.resolve_timeout(),
            stream_open_timeout: config.stream_open_timeout(),
            event_capacity: config.event_capacity,
        }
    }
}

struct NowPlaying {
    playback_id: PlaybackId,
    track: Track,
    handle: Box<dyn PlaybackHandle>,
    skipped: bool,
}

enum GuildPhase {
    Idle,
    /// `ended_early` is set when the track's completion arrives before its
    /// stream finished opening.
    Loading {
        playback_id: PlaybackId,
        ended_early: bool,
    },
    Playing(NowPlaying),
}

/// Playback state of one guild. Lock order: this lock, then the queue lock.
struct GuildPlayback {
    phase: GuildPhase,
}

impl GuildPlayback {
    fn new() -> Self {
        Self {
            phase: GuildPhase::Idle,
        }
    }

    fn is_loading(&self, playback_id: PlaybackId) -> bool {
        matches!(self.phase, GuildPhase::Loading { playback_id: id, .. } if id == playback_id)
    }
}

/// Per-guild queue plus the state machine that keeps it playing.
///
/// Every guild moves through `Idle -> Loading -> Playing` and back. Track
/// completions come back as [`TrackEnded`] messages on a channel and are
/// matched against the playback id that is currently live, so late or
/// duplicate completions never advance the queue twice.
pub struct PlaybackController {
    registry: GuildQueueRegistry,
    playback: DashMap<GuildId, Arc<Mutex<GuildPlayback>>>,
    sessions: DashMap<GuildId, Arc<dyn VoiceSession>>,
    resolver: Arc<dyn SourceResolver>,
    events: broadcast::Sender<PlayerEvent>,
    completions: mpsc::UnboundedSender<TrackEnded>,
    next_playback_id: AtomicU64,
    options: ControllerOptions,
}

impl PlaybackController {
    /// Builds the controller and spawns its completion dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(resolver: Arc<dyn SourceResolver>, options: ControllerOptions) -> Arc<Self> {
        let (completions, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(options.event_capacity.max(1));

        let controller = Arc::new(Self {
            registry: GuildQueueRegistry::new(),
            playback: DashMap::new(),
            sessions: DashMap::new(),
            resolver,
            events,
            completions,
            next_playback_id: AtomicU64::new(1),
            options,
        });

        tokio::spawn(dispatch_completions(Arc::downgrade(&controller), rx));
        info!("🎛️ Playback controller started");
        controller
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn attach_session(&self, guild_id: GuildId, session: Arc<dyn VoiceSession>) {
        debug!("🔊 Voice session attached for guild {}", guild_id);
        self.sessions.insert(guild_id, session);
    }

    pub fn detach_session(&self, guild_id: GuildId) -> bool {
        self.sessions.remove(&guild_id).is_some()
    }

    pub fn has_session(&self, guild_id: GuildId) -> bool {
        self.sessions.contains_key(&guild_id)
    }

    /// Resolves `query` and appends the result to the guild's queue.
    pub async fn enqueue(&self, guild_id: GuildId, query: &str) -> PlayerResult<Track> {
        self.enqueue_inner(guild_id, query, None).await
    }

    /// Same as [`enqueue`](Self::enqueue), remembering who asked for it.
    pub async fn enqueue_as(
        &self,
        guild_id: GuildId,
        query: &str,
        requested_by: UserId,
    ) -> PlayerResult<Track> {
        self.enqueue_inner(guild_id, query, Some(requested_by)).await
    }

    async fn enqueue_inner(
        &self,
        guild_id: GuildId,
        query: &str,
        requested_by: Option<UserId>,
    ) -> PlayerResult<Track> {
        let session = self
            .session(guild_id)
            .ok_or(PlayerError::NotConnected(guild_id))?;
        if !session.is_connected().await {
            return Err(PlayerError::NotConnected(guild_id));
        }

        // Resolution is slow and touches no shared state, so no lock here.
        let resolved = match self.options.resolve_timeout {
            Some(limit) => tokio::time::timeout(limit, self.resolver.resolve(query))
                .await
                .map_err(|_| PlayerError::Timeout {
                    operation: "track resolution",
                    elapsed: limit,
                })?,
            None => self.resolver.resolve(query).await,
        };
        let resolved = resolved.map_err(|e| {
            warn!("❌ Could not resolve '{}' in guild {}: {}", query, guild_id, e);
            PlayerError::from(e)
        })?;

        let mut track = Track::from(resolved);
        if let Some(user_id) = requested_by {
            track = track.with_requested_by(user_id);
        }

        let state = self.state(guild_id);
        let (position, idle) = {
            let state = state.lock();
            let position = self.registry.enqueue(guild_id, track.clone());
            (position, matches!(state.phase, GuildPhase::Idle))
        };

        self.emit(PlayerEvent::TrackQueued {
            guild_id,
            title: track.title().to_string(),
            position,
        });

        if idle {
            self.advance(guild_id).await;
        }

        Ok(track)
    }

    /// Starts the next queued track if the guild is idle.
    ///
    /// A no-op while a track is loading or playing. Tracks whose stream
    /// cannot be opened are reported and skipped.
    pub async fn advance(&self, guild_id: GuildId) -> PlaybackPhase {
        self.advance_inner(guild_id, false).await
    }

    async fn advance_inner(&self, guild_id: GuildId, after_track: bool) -> PlaybackPhase {
        let state = self.state(guild_id);
        let mut attempted = after_track;

        // Each pass pops one track, so the loop ends once the queue drains.
        loop {
            let Some(session) = self.session(guild_id) else {
                warn!("🔇 No voice session in guild {}, leaving queue untouched", guild_id);
                return self.phase(guild_id);
            };

            let (playback_id, track) = {
                let mut state = state.lock();
                match state.phase {
                    GuildPhase::Loading { .. } => return PlaybackPhase::Loading,
                    GuildPhase::Playing(_) => return PlaybackPhase::Playing,
                    GuildPhase::Idle => {}
                }

                let Some(track) = self.registry.pop_front(guild_id) else {
                    drop(state);
                    info!("📭 Nothing left to play in guild {}", guild_id);
                    if attempted {
                        self.emit(PlayerEvent::QueueFinished { guild_id });
                    }
                    return PlaybackPhase::Idle;
                };

                let playback_id = self.next_playback_id.fetch_add(1, Ordering::Relaxed);
                state.phase = GuildPhase::Loading {
                    playback_id,
                    ended_early: false,
                };
                (playback_id, track)
            };
            attempted = true;

            info!("🎵 Loading in guild {}: {}", guild_id, track.title());
            let notifier = TrackEndNotifier::new(guild_id, playback_id, self.completions.clone());

            match self.open_stream(session.as_ref(), &track, notifier).await {
                Ok(handle) => {
                    let mut state = state.lock();
                    if !state.is_loading(playback_id) {
                        // Left or cleared while the stream was opening.
                        drop(state);
                        info!("⏹️ Discarding stale stream in guild {}: {}", guild_id, track.title());
                        handle.stop();
                        return self.phase(guild_id);
                    }

                    if matches!(state.phase, GuildPhase::Loading { ended_early: true, .. }) {
                        state.phase = GuildPhase::Idle;
                        drop(state);
                        info!("✅ Finished before it started in guild {}: {}", guild_id, track.title());
                        handle.stop();
                        self.emit(PlayerEvent::TrackFinished {
                            guild_id,
                            title: track.title().to_string(),
                            skipped: false,
                        });
                        continue;
                    }

                    let title = track.title().to_string();
                    state.phase = GuildPhase::Playing(NowPlaying {
                        playback_id,
                        track,
                        handle,
                        skipped: false,
                    });
                    drop(state);

                    info!("▶️ Playing in guild {}: {}", guild_id, title);
                    self.emit(PlayerEvent::TrackStarted { guild_id, title });
                    return PlaybackPhase::Playing;
                }
                Err(e) => {
                    warn!("❌ Could not play '{}' in guild {}: {}", track.title(), guild_id, e);
                    self.emit(PlayerEvent::TrackFailed {
                        guild_id,
                        title: track.title().to_string(),
                        error: e.to_string(),
                    });

                    let mut state = state.lock();
                    if !state.is_loading(playback_id) {
                        return PlaybackPhase::Idle;
                    }
                    state.phase = GuildPhase::Idle;
                }
            }
        }
    }

    async fn open_stream(
        &self,
        session: &dyn VoiceSession,
        track: &Track,
        notifier: TrackEndNotifier,
    ) -> Result<Box<dyn PlaybackHandle>, StreamOpenError> {
        let play = session.play(track.source_locator(), notifier);
        match self.options.stream_open_timeout {
            Some(limit) => tokio::time::timeout(limit, play).await.map_err(|_| {
                StreamOpenError(format!("stream did not open within {:?}", limit))
            })?,
            None => play.await,
        }
    }

    /// Stops the current track. Returns whether anything was playing.
    ///
    /// The queue advances once the voice session reports the stop.
    pub fn skip(&self, guild_id: GuildId) -> bool {
        let state = self.state(guild_id);
        let mut state = state.lock();
        match &mut state.phase {
            GuildPhase::Playing(now) => {
                info!("⏭️ Skipping in guild {}: {}", guild_id, now.track.title());
                now.skipped = true;
                now.handle.stop();
                true
            }
            _ => false,
        }
    }

    /// Drops every pending track but keeps the current one playing.
    pub fn clear_pending(&self, guild_id: GuildId) -> usize {
        let state = self.state(guild_id);
        let _state = state.lock();
        self.registry.clear(guild_id)
    }

    /// Stops playback, empties the queue and forgets the voice session.
    ///
    /// Returns how many pending tracks were dropped.
    pub fn leave(&self, guild_id: GuildId) -> usize {
        let state = self.state(guild_id);
        let (cleared, previous) = {
            let mut state = state.lock();
            let cleared = self.registry.clear(guild_id);
            (cleared, mem::replace(&mut state.phase, GuildPhase::Idle))
        };
        self.detach_session(guild_id);

        if let GuildPhase::Playing(now) = previous {
            info!("⏹️ Stopping in guild {}: {}", guild_id, now.track.title());
            now.handle.stop();
        }

        info!("👋 Left guild {} ({} pending tracks dropped)", guild_id, cleared);
        cleared
    }

    pub fn list_pending(&self, guild_id: GuildId) -> Vec<String> {
        self.registry
            .peek(guild_id)
            .iter()
            .map(|track| track.title().to_string())
            .collect()
    }

    pub fn pending(&self, guild_id: GuildId) -> Vec<Track> {
        self.registry.peek(guild_id)
    }

    pub fn pending_count(&self, guild_id: GuildId) -> usize {
        self.registry.len(guild_id)
    }

    pub fn has_pending(&self, guild_id: GuildId) -> bool {
        !self.registry.is_empty(guild_id)
    }

    /// Guilds that have used the player since startup.
    pub fn guild_count(&self) -> usize {
        self.registry.guild_count()
    }

    pub fn now_playing(&self, guild_id: GuildId) -> Option<Track> {
        let state = self.playback.get(&guild_id)?.clone();
        let state = state.lock();
        match &state.phase {
            GuildPhase::Playing(now) => Some(now.track.clone()),
            _ => None,
        }
    }

    pub fn phase(&self, guild_id: GuildId) -> PlaybackPhase {
        let Some(state) = self.playback.get(&guild_id).map(|s| s.clone()) else {
            return PlaybackPhase::Idle;
        };
        let state = state.lock();
        match state.phase {
            GuildPhase::Idle => PlaybackPhase::Idle,
            GuildPhase::Loading { .. } => PlaybackPhase::Loading,
            GuildPhase::Playing(_) => PlaybackPhase::Playing,
        }
    }

    pub fn is_playing(&self, guild_id: GuildId) -> bool {
        self.phase(guild_id) == PlaybackPhase::Playing
    }

    async fn on_track_ended(&self, ended: TrackEnded) {
        let guild_id = ended.guild_id;
        let state = self.state(guild_id);

        let finished = {
            let mut state = state.lock();
            if let GuildPhase::Loading {
                playback_id,
                ended_early,
            } = &mut state.phase
            {
                if *playback_id == ended.playback_id {
                    // The opening advance picks this up once `play` returns.
                    *ended_early = true;
                    debug!(
                        "Completion {} arrived while loading in guild {}",
                        ended.playback_id, guild_id
                    );
                    return;
                }
            }

            let live = matches!(
                &state.phase,
                GuildPhase::Playing(now) if now.playback_id == ended.playback_id
            );
            if !live {
                None
            } else if let GuildPhase::Playing(now) = mem::replace(&mut state.phase, GuildPhase::Idle)
            {
                Some(now)
            } else {
                None
            }
        };

        let Some(now) = finished else {
            debug!(
                "Ignoring stale completion {} in guild {}",
                ended.playback_id, guild_id
            );
            return;
        };

        let remaining = self.registry.len(guild_id);
        if now.skipped {
            info!(
                "⏭️ Skipped in guild {}: {} ({} pending)",
                guild_id,
                now.track.title(),
                remaining
            );
        } else {
            info!(
                "✅ Finished in guild {}: {} ({} pending)",
                guild_id,
                now.track.title(),
                remaining
            );
        }
        self.emit(PlayerEvent::TrackFinished {
            guild_id,
            title: now.track.title().to_string(),
            skipped: now.skipped,
        });

        self.advance_inner(guild_id, true).await;
    }

    fn state(&self, guild_id: GuildId) -> Arc<Mutex<GuildPlayback>> {
        self.playback
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(GuildPlayback::new())))
            .clone()
    }

    fn session(&self, guild_id: GuildId) -> Option<Arc<dyn VoiceSession>> {
        self.sessions.get(&guild_id).map(|s| s.clone())
    }

    fn emit(&self, event: PlayerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Feeds completion messages back into the controller.
///
/// Each completion is handled on its own task so that a slow stream open in
/// one guild never delays another guild's advance.
async fn dispatch_completions(
    controller: Weak<PlaybackController>,
    mut rx: mpsc::UnboundedReceiver<TrackEnded>,
) {
    while let Some(ended) = rx.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            controller.on_track_ended(ended).await;
        });
    }
    debug!("Completion dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ResolutionError,
        sources::{MockSourceResolver, ResolvedSource},
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, AtomicUsize},
    };
    use tokio::sync::Notify;

    type Active = Arc<Mutex<Vec<TrackEndNotifier>>>;

    /// In-memory voice session that records every `play` call.
    struct FakeSession {
        plays: Mutex<Vec<String>>,
        active: Active,
        failing: Mutex<HashSet<String>>,
        hanging: Mutex<HashSet<String>>,
        ending_early: Mutex<HashSet<String>>,
        gate: Mutex<Option<Arc<Notify>>>,
        connected: AtomicBool,
        stops: Arc<AtomicUsize>,
    }

    impl FakeSession {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                plays: Mutex::new(Vec::new()),
                active: Arc::new(Mutex::new(Vec::new())),
                failing: Mutex::new(HashSet::new()),
                hanging: Mutex::new(HashSet::new()),
                ending_early: Mutex::new(HashSet::new()),
                gate: Mutex::new(None),
                connected: AtomicBool::new(true),
                stops: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn fail_on(&self, locator: &str) {
            self.failing.lock().insert(locator.to_string());
        }

        fn hang_on(&self, locator: &str) {
            self.hanging.lock().insert(locator.to_string());
        }

        /// The track reports its end before `play` returns.
        fn end_early_on(&self, locator: &str) {
            self.ending_early.lock().insert(locator.to_string());
        }

        fn gate(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.gate.lock() = Some(gate.clone());
            gate
        }

        fn plays(&self) -> Vec<String> {
            self.plays.lock().clone()
        }

        /// Simulates the current track reaching its natural end.
        fn finish_current(&self) -> bool {
            let notifier = self.active.lock().pop();
            match notifier {
                Some(notifier) => {
                    notifier.notify();
                    true
                }
                None => false,
            }
        }
    }

    struct FakeHandle {
        playback_id: PlaybackId,
        active: Active,
        stops: Arc<AtomicUsize>,
    }

    impl PlaybackHandle for FakeHandle {
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            let notifier = {
                let mut active = self.active.lock();
                active
                    .iter()
                    .position(|n| n.playback_id() == self.playback_id)
                    .map(|index| active.remove(index))
            };
            if let Some(notifier) = notifier {
                notifier.notify();
            }
        }
    }

    #[async_trait]
    impl VoiceSession for FakeSession {
        async fn play(
            &self,
            source_locator: &str,
            on_end: TrackEndNotifier,
        ) -> Result<Box<dyn PlaybackHandle>, StreamOpenError> {
            self.plays.lock().push(source_locator.to_string());
            let playback_id = on_end.playback_id();

            let mut on_end = Some(on_end);
            if self.ending_early.lock().contains(source_locator) {
                if let Some(notifier) = on_end.take() {
                    notifier.notify();
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            if self.hanging.lock().contains(source_locator) {
                std::future::pending::<()>().await;
            }
            let gate = self.gate.lock().take();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if self.failing.lock().contains(source_locator) {
                return Err(StreamOpenError(format!("cannot open {}", source_locator)));
            }

            if let Some(on_end) = on_end {
                self.active.lock().push(on_end);
            }
            Ok(Box::new(FakeHandle {
                playback_id,
                active: self.active.clone(),
                stops: self.stops.clone(),
            }))
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    /// Resolver mapping "songX" to `x.mp3` / "Song X".
    fn song_resolver() -> MockSourceResolver {
        let mut resolver = MockSourceResolver::new();
        resolver.expect_resolve().returning(|query| {
            match query.strip_prefix("song") {
                Some(name) if !name.is_empty() => Ok(ResolvedSource::new(
                    format!("{}.mp3", name.to_lowercase()),
                    format!("Song {}", name),
                )),
                _ => Err(ResolutionError(format!("no results for {}", query))),
            }
        });
        resolver
    }

    fn controller_with(resolver: MockSourceResolver) -> Arc<PlaybackController> {
        PlaybackController::start(Arc::new(resolver), ControllerOptions::default())
    }

    fn ended_while_loading(controller: &PlaybackController, guild: GuildId) -> bool {
        matches!(
            controller.state(guild).lock().phase,
            GuildPhase::Loading {
                ended_early: true,
                ..
            }
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition was never reached");
    }

    #[tokio::test]
    async fn first_enqueue_starts_playback_and_later_ones_wait() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());

        let track = controller.enqueue(guild, "songA").await.unwrap();
        assert_eq!(track.title(), "Song A");
        assert_eq!(session.plays(), vec!["a.mp3"]);
        assert_eq!(controller.phase(guild), PlaybackPhase::Playing);
        assert!(controller.list_pending(guild).is_empty());

        controller.enqueue(guild, "songB").await.unwrap();
        assert_eq!(controller.list_pending(guild), vec!["Song B"]);
        assert_eq!(session.plays(), vec!["a.mp3"]);

        assert!(session.finish_current());
        eventually(|| session.plays().len() == 2).await;
        assert_eq!(session.plays(), vec!["a.mp3", "b.mp3"]);
        eventually(|| controller.now_playing(guild).map(|t| t.title().to_string()) == Some("Song B".into())).await;
        assert!(controller.list_pending(guild).is_empty());
    }

    #[tokio::test]
    async fn pending_titles_keep_enqueue_order() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());

        for query in ["songA", "songB", "songC", "songD"] {
            controller.enqueue(guild, query).await.unwrap();
        }

        assert_eq!(controller.list_pending(guild), vec!["Song B", "Song C", "Song D"]);
        assert_eq!(
            controller.pending(guild).iter().map(|t| t.source_locator().to_string()).collect::<Vec<_>>(),
            vec!["b.mp3", "c.mp3", "d.mp3"]
        );
    }

    #[tokio::test]
    async fn every_track_plays_exactly_once() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());

        for query in ["songA", "songB", "songC"] {
            controller.enqueue(guild, query).await.unwrap();
        }

        for expected in 1..=3 {
            eventually(|| session.plays().len() == expected && controller.is_playing(guild)).await;
            assert!(session.finish_current());
        }

        eventually(|| controller.phase(guild) == PlaybackPhase::Idle).await;
        assert_eq!(session.plays(), vec!["a.mp3", "b.mp3", "c.mp3"]);
    }

    #[tokio::test]
    async fn resolution_failure_leaves_queue_alone() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());

        let err = controller.enqueue(guild, "nothing").await.unwrap_err();
        assert!(matches!(err, PlayerError::Resolution(_)));
        assert!(controller.list_pending(guild).is_empty());
        assert!(session.plays().is_empty());
        assert_eq!(controller.phase(guild), PlaybackPhase::Idle);
    }

    #[tokio::test]
    async fn enqueue_without_session_is_rejected() {
        let mut resolver = MockSourceResolver::new();
        resolver.expect_resolve().never();
        let controller = controller_with(resolver);
        let guild = GuildId::new(9);

        let err = controller.enqueue(guild, "songA").await.unwrap_err();
        assert!(matches!(err, PlayerError::NotConnected(g) if g == guild));

        let session = FakeSession::new();
        session.connected.store(false, Ordering::SeqCst);
        controller.attach_session(guild, session.clone());
        let err = controller.enqueue(guild, "songA").await.unwrap_err();
        assert!(matches!(err, PlayerError::NotConnected(_)));
        assert!(controller.list_pending(guild).is_empty());
    }

    #[tokio::test]
    async fn skip_while_idle_does_nothing() {
        let controller = controller_with(song_resolver());
        let guild = GuildId::new(1);

        assert!(!controller.skip(guild));
        assert!(controller.list_pending(guild).is_empty());
        assert_eq!(controller.phase(guild), PlaybackPhase::Idle);
    }

    #[tokio::test]
    async fn skip_moves_to_next_track() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());
        let mut events = controller.subscribe();

        controller.enqueue(guild, "songA").await.unwrap();
        controller.enqueue(guild, "songB").await.unwrap();

        assert!(controller.skip(guild));
        assert_eq!(session.stops.load(Ordering::SeqCst), 1);
        eventually(|| session.plays().len() == 2).await;
        eventually(|| controller.is_playing(guild)).await;
        assert_eq!(session.plays(), vec!["a.mp3", "b.mp3"]);

        let mut finished = None;
        while let Ok(event) = events.try_recv() {
            if let PlayerEvent::TrackFinished { title, skipped, .. } = event {
                finished = Some((title, skipped));
            }
        }
        assert_eq!(finished, Some(("Song A".to_string(), true)));
    }

    #[tokio::test]
    async fn skip_on_last_track_goes_idle() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());

        controller.enqueue(guild, "songA").await.unwrap();
        assert!(controller.skip(guild));

        eventually(|| controller.phase(guild) == PlaybackPhase::Idle).await;
        assert!(controller.now_playing(guild).is_none());
        assert!(!controller.skip(guild));
    }

    #[tokio::test]
    async fn stream_failure_moves_on_to_next_track() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());
        let mut events = controller.subscribe();

        controller.enqueue(guild, "songA").await.unwrap();
        session.fail_on("b.mp3");
        controller.enqueue(guild, "songB").await.unwrap();
        controller.enqueue(guild, "songC").await.unwrap();

        assert!(session.finish_current());
        eventually(|| session.plays().len() == 3 && controller.is_playing(guild)).await;
        assert_eq!(session.plays(), vec!["a.mp3", "b.mp3", "c.mp3"]);
        assert_eq!(
            controller.now_playing(guild).map(|t| t.title().to_string()),
            Some("Song C".to_string())
        );

        let mut failed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PlayerEvent::TrackFailed { title, .. } = event {
                failed.push(title);
            }
        }
        assert_eq!(failed, vec!["Song B"]);
    }

    #[tokio::test]
    async fn failing_last_track_returns_to_idle() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());
        session.fail_on("a.mp3");
        session.fail_on("b.mp3");

        controller.enqueue(guild, "songA").await.unwrap();
        assert_eq!(controller.phase(guild), PlaybackPhase::Idle);

        controller.enqueue(guild, "songB").await.unwrap();
        assert_eq!(controller.phase(guild), PlaybackPhase::Idle);
        assert_eq!(session.plays(), vec!["a.mp3", "b.mp3"]);
        assert!(controller.list_pending(guild).is_empty());
    }

    #[tokio::test]
    async fn stream_open_timeout_counts_as_failure() {
        let options = ControllerOptions {
            stream_open_timeout: Some(Duration::from_millis(30)),
            ..ControllerOptions::default()
        };
        let controller = PlaybackController::start(Arc::new(song_resolver()), options);
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());
        session.hang_on("a.mp3");

        controller.enqueue(guild, "songA").await.unwrap();
        assert_eq!(controller.phase(guild), PlaybackPhase::Idle);

        controller.enqueue(guild, "songB").await.unwrap();
        assert_eq!(controller.phase(guild), PlaybackPhase::Playing);
        assert_eq!(session.plays(), vec!["a.mp3", "b.mp3"]);
    }

    #[tokio::test]
    async fn enqueue_while_loading_does_not_start_twice() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());
        let gate = session.gate();

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.enqueue(guild, "songA").await }
        });
        eventually(|| controller.phase(guild) == PlaybackPhase::Loading).await;

        controller.enqueue(guild, "songB").await.unwrap();
        assert_eq!(session.plays(), vec!["a.mp3"]);
        assert_eq!(controller.advance(guild).await, PlaybackPhase::Loading);

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(controller.phase(guild), PlaybackPhase::Playing);
        assert_eq!(session.plays(), vec!["a.mp3"]);
        assert_eq!(controller.list_pending(guild), vec!["Song B"]);
    }

    #[tokio::test]
    async fn leave_clears_queue_and_stops_playback() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());

        controller.enqueue(guild, "songA").await.unwrap();
        controller.enqueue(guild, "songB").await.unwrap();
        controller.enqueue(guild, "songC").await.unwrap();

        assert_eq!(controller.leave(guild), 2);
        assert_eq!(session.stops.load(Ordering::SeqCst), 1);
        assert!(controller.list_pending(guild).is_empty());
        assert!(!controller.has_session(guild));

        // The stop's completion must not start anything.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.phase(guild), PlaybackPhase::Idle);
        assert_eq!(session.plays(), vec!["a.mp3"]);

        // A fresh session behaves like a brand new guild.
        let fresh = FakeSession::new();
        controller.attach_session(guild, fresh.clone());
        controller.enqueue(guild, "songD").await.unwrap();
        assert_eq!(fresh.plays(), vec!["d.mp3"]);
        assert_eq!(controller.phase(guild), PlaybackPhase::Playing);
        assert!(controller.list_pending(guild).is_empty());
    }

    #[tokio::test]
    async fn leave_while_loading_discards_the_stream() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());
        let gate = session.gate();

        let pending = tokio::spawn({
            let controller = controller.clone();
            async move { controller.enqueue(guild, "songA").await }
        });
        eventually(|| controller.phase(guild) == PlaybackPhase::Loading).await;

        controller.leave(guild);
        gate.notify_one();
        pending.await.unwrap().unwrap();

        assert_eq!(controller.phase(guild), PlaybackPhase::Idle);
        assert_eq!(session.stops.load(Ordering::SeqCst), 1);
        assert!(controller.now_playing(guild).is_none());
    }

    #[tokio::test]
    async fn clear_pending_keeps_current_track() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());

        controller.enqueue(guild, "songA").await.unwrap();
        controller.enqueue(guild, "songB").await.unwrap();
        assert_eq!(controller.pending_count(guild), 1);
        assert!(controller.has_pending(guild));

        assert_eq!(controller.clear_pending(guild), 1);
        assert!(controller.is_playing(guild));
        assert!(controller.list_pending(guild).is_empty());
        assert!(!controller.has_pending(guild));

        assert!(session.finish_current());
        eventually(|| controller.phase(guild) == PlaybackPhase::Idle).await;
        assert_eq!(session.plays(), vec!["a.mp3"]);
    }

    /// Resolver whose "slow" query blocks until released.
    struct GatedResolver {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl SourceResolver for GatedResolver {
        async fn resolve(&self, query: &str) -> Result<ResolvedSource, ResolutionError> {
            if query == "slow" {
                self.release.notified().await;
            }
            Ok(ResolvedSource::new(format!("{}.mp3", query), query.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn guilds_are_independent() {
        let release = Arc::new(Notify::new());
        let controller = PlaybackController::start(
            Arc::new(GatedResolver {
                release: release.clone(),
            }),
            ControllerOptions::default(),
        );
        let left = GuildId::new(1);
        let right = GuildId::new(2);
        let left_session = FakeSession::new();
        let right_session = FakeSession::new();
        controller.attach_session(left, left_session.clone());
        controller.attach_session(right, right_session.clone());

        let slow = tokio::spawn({
            let controller = controller.clone();
            async move { controller.enqueue(left, "slow").await }
        });

        // The right guild finishes while the left one is still resolving.
        controller.enqueue(right, "fast").await.unwrap();
        controller.enqueue(right, "faster").await.unwrap();
        assert!(!slow.is_finished());

        release.notify_one();
        slow.await.unwrap().unwrap();

        assert_eq!(left_session.plays(), vec!["slow.mp3"]);
        assert_eq!(right_session.plays(), vec!["fast.mp3"]);
        assert!(controller.list_pending(left).is_empty());
        assert_eq!(controller.list_pending(right), vec!["FASTER"]);
        assert_eq!(controller.pending_count(right), 1);
        assert_eq!(controller.guild_count(), 2);
    }

    #[tokio::test]
    async fn resolution_timeout_is_reported() {
        let options = ControllerOptions {
            resolve_timeout: Some(Duration::from_millis(20)),
            ..ControllerOptions::default()
        };
        let controller = PlaybackController::start(
            Arc::new(GatedResolver {
                release: Arc::new(Notify::new()),
            }),
            options,
        );
        let guild = GuildId::new(1);
        controller.attach_session(guild, FakeSession::new());

        let err = controller.enqueue(guild, "slow").await.unwrap_err();
        assert!(matches!(err, PlayerError::Timeout { .. }));
        assert!(controller.list_pending(guild).is_empty());
    }

    #[tokio::test]
    async fn queue_events_are_published() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(4);
        controller.attach_session(guild, session.clone());
        let mut events = controller.subscribe();

        controller.enqueue(guild, "songA").await.unwrap();
        assert!(session.finish_current());

        let mut seen = Vec::new();
        while seen.len() < 4 {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.guild_id(), guild);
            seen.push(event);
        }

        assert_eq!(
            seen,
            vec![
                PlayerEvent::TrackQueued {
                    guild_id: guild,
                    title: "Song A".into(),
                    position: 1,
                },
                PlayerEvent::TrackStarted {
                    guild_id: guild,
                    title: "Song A".into(),
                },
                PlayerEvent::TrackFinished {
                    guild_id: guild,
                    title: "Song A".into(),
                    skipped: false,
                },
                PlayerEvent::QueueFinished { guild_id: guild },
            ]
        );
    }

    #[tokio::test]
    async fn track_ending_while_loading_does_not_stall_the_guild() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());
        session.end_early_on("a.mp3");

        controller.enqueue(guild, "songA").await.unwrap();
        eventually(|| controller.phase(guild) == PlaybackPhase::Idle).await;
        assert!(controller.now_playing(guild).is_none());
        assert!(!controller.skip(guild));

        // The guild still accepts and plays new tracks.
        controller.enqueue(guild, "songB").await.unwrap();
        assert_eq!(controller.phase(guild), PlaybackPhase::Playing);
        assert_eq!(session.plays(), vec!["a.mp3", "b.mp3"]);
    }

    #[tokio::test]
    async fn completion_during_loading_moves_on_to_next_track() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());
        session.end_early_on("a.mp3");
        let gate = session.gate();
        let mut events = controller.subscribe();

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.enqueue(guild, "songA").await }
        });
        eventually(|| ended_while_loading(&controller, guild)).await;
        controller.enqueue(guild, "songB").await.unwrap();
        assert_eq!(controller.phase(guild), PlaybackPhase::Loading);

        gate.notify_one();
        first.await.unwrap().unwrap();

        assert_eq!(session.plays(), vec!["a.mp3", "b.mp3"]);
        assert_eq!(
            controller.now_playing(guild).map(|t| t.title().to_string()),
            Some("Song B".to_string())
        );

        let mut finished = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PlayerEvent::TrackFinished { title, skipped, .. } = event {
                finished.push((title, skipped));
            }
        }
        assert_eq!(finished, vec![("Song A".to_string(), false)]);
    }

    #[tokio::test]
    async fn leave_after_completion_during_loading_stays_idle() {
        let controller = controller_with(song_resolver());
        let session = FakeSession::new();
        let guild = GuildId::new(1);
        controller.attach_session(guild, session.clone());
        session.end_early_on("a.mp3");
        let gate = session.gate();

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.enqueue(guild, "songA").await }
        });
        eventually(|| ended_while_loading(&controller, guild)).await;
        controller.enqueue(guild, "songB").await.unwrap();

        assert_eq!(controller.leave(guild), 1);
        gate.notify_one();
        first.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.phase(guild), PlaybackPhase::Idle);
        assert_eq!(session.plays(), vec!["a.mp3"]);
        assert_eq!(session.stops.load(Ordering::SeqCst), 1);
        assert!(controller.list_pending(guild).is_empty());
    }
}
