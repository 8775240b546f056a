use chrono::{DateTime, Utc};
use serenity::model::id::UserId;
use std::time::Duration;

use crate::sources::ResolvedSource;

/// Title shown when the resolver could not tell us one.
pub const UNKNOWN_TITLE: &str = "Unknown title";

/// One resolved, playable item.
///
/// Tracks are built once and never mutated. The queue owns them until they
/// are popped, after which the controller holds the track for as long as it
/// plays.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    source_locator: String,
    title: String,
    page_url: Option<String>,
    duration: Option<Duration>,
    requested_by: Option<UserId>,
    added_at: DateTime<Utc>,
}

impl Track {
    pub fn new(source_locator: impl Into<String>, title: impl Into<String>) -> Self {
        let title = title.into();
        let title = if title.trim().is_empty() {
            UNKNOWN_TITLE.to_string()
        } else {
            title
        };

        Self {
            source_locator: source_locator.into(),
            title,
            page_url: None,
            duration: None,
            requested_by: None,
            added_at: Utc::now(),
        }
    }

    pub fn with_page_url(mut self, page_url: String) -> Self {
        self.page_url = Some(page_url);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_requested_by(mut self, user_id: UserId) -> Self {
        self.requested_by = Some(user_id);
        self
    }

    pub fn source_locator(&self) -> &str {
        &self.source_locator
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn page_url(&self) -> Option<&str> {
        self.page_url.as_deref()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn requested_by(&self) -> Option<UserId> {
        self.requested_by
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }
}

impl From<ResolvedSource> for Track {
    fn from(source: ResolvedSource) -> Self {
        let mut track = Track::new(source.source_locator, source.title.unwrap_or_default());
        if let Some(page_url) = source.page_url {
            track = track.with_page_url(page_url);
        }
        if let Some(duration) = source.duration {
            track = track.with_duration(duration);
        }
        track
    }
}
