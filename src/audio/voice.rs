use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use songbird::{
    input::{
        codecs::{get_codec_registry, get_probe},
        HttpRequest, Input,
    },
    tracks::{PlayMode, TrackHandle},
    Call, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::session::{PlaybackHandle, TrackEndNotifier, VoiceSession};
use crate::error::StreamOpenError;

/// [`VoiceSession`] backed by a songbird call.
pub struct SongbirdSession {
    call: Arc<Mutex<Call>>,
    http: reqwest::Client,
    volume: f32,
}

impl SongbirdSession {
    pub fn new(call: Arc<Mutex<Call>>, http: reqwest::Client, volume: f32) -> Self {
        Self {
            call,
            http,
            volume: volume.clamp(0.0, 2.0),
        }
    }
}

#[async_trait]
impl VoiceSession for SongbirdSession {
    async fn play(
        &self,
        source_locator: &str,
        on_end: TrackEndNotifier,
    ) -> Result<Box<dyn PlaybackHandle>, StreamOpenError> {
        let request = HttpRequest::new(self.http.clone(), source_locator.to_string());

        // Probe before handing the input to the driver so that a dead link
        // surfaces here instead of as a silent track.
        let input = Input::from(request)
            .make_playable_async(get_codec_registry(), get_probe())
            .await
            .map_err(|e| StreamOpenError(e.to_string()))?;

        let handle = {
            let mut call = self.call.lock().await;
            call.play_input(input)
        };

        if let Err(e) = handle.set_volume(self.volume) {
            debug!("Could not set volume on new track: {:?}", e);
        }

        let forwarder = TrackEndForwarder {
            notifier: Arc::new(SyncMutex::new(Some(on_end))),
        };

        for event in [TrackEvent::End, TrackEvent::Error] {
            if let Err(e) = handle.add_event(Event::Track(event), forwarder.clone()) {
                let _ = handle.stop();
                return Err(StreamOpenError(format!(
                    "track ended before it could be observed: {:?}",
                    e
                )));
            }
        }

        Ok(Box::new(SongbirdPlayback(handle)))
    }

    async fn is_connected(&self) -> bool {
        self.call.lock().await.current_channel().is_some()
    }
}

struct SongbirdPlayback(TrackHandle);

impl PlaybackHandle for SongbirdPlayback {
    fn stop(&self) {
        if let Err(e) = self.0.stop() {
            // Already finished; its end event has fired or is about to.
            debug!("Stop on finished track: {:?}", e);
        }
    }
}

/// Bridges songbird's track events to our one-shot notifier.
///
/// Registered for both `End` and `Error`; whichever fires first wins.
#[derive(Clone)]
struct TrackEndForwarder {
    notifier: Arc<SyncMutex<Option<TrackEndNotifier>>>,
}

#[async_trait]
impl VoiceEventHandler for TrackEndForwarder {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(tracks) = ctx {
            for (state, _handle) in *tracks {
                if let PlayMode::Errored(e) = &state.playing {
                    warn!("❌ Track reported an error: {:?}", e);
                }
            }
        }

        if let Some(notifier) = self.notifier.lock().take() {
            info!("🎵 Track ended in guild {}", notifier.guild_id());
            notifier.notify();
        }

        None
    }
}
