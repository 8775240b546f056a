//! # Sources
//!
//! Turns what a user typed into something the voice layer can stream.
//!
//! The playback core only sees the [`SourceResolver`] trait. The shipped
//! implementation, [`YtDlpResolver`], shells out to `yt-dlp` and accepts both
//! direct links and free-text searches (first search hit wins).

pub mod youtube;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::ResolutionError;

pub use youtube::YtDlpResolver;

/// Result of resolving a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    /// Locator the voice session can open directly.
    pub source_locator: String,
    pub title: Option<String>,
    pub page_url: Option<String>,
    pub duration: Option<Duration>,
}

impl ResolvedSource {
    pub fn new(source_locator: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source_locator: source_locator.into(),
            title: Some(title.into()),
            page_url: None,
            duration: None,
        }
    }
}

/// Resolves a search string or URL into a playable stream.
///
/// Network failures, empty search results and extractor errors all collapse
/// into a single [`ResolutionError`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<ResolvedSource, ResolutionError>;
}
