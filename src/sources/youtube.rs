use async_process::Command;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::{sync::OnceLock, time::Duration};
use tracing::{debug, info, warn};
use url::Url;

use super::{ResolvedSource, SourceResolver};
use crate::error::ResolutionError;

const AUDIO_EXTENSIONS: [&str; 6] = [".mp3", ".wav", ".ogg", ".flac", ".m4a", ".opus"];

/// How a raw query is going to be resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKind {
    /// A YouTube watch or short link, handed to yt-dlp as is.
    YouTube(String),
    /// A link straight to an audio file, played without extraction.
    DirectMedia(Url),
    /// Any other http(s) page, left to yt-dlp's generic extractor.
    Page(String),
    /// Free text, resolved as the first YouTube search hit.
    Search(String),
}

impl QueryKind {
    pub fn classify(query: &str) -> Self {
        let query = query.trim();

        if YtDlpResolver::is_youtube_url(query) {
            return Self::YouTube(query.to_string());
        }

        match Url::parse(query) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                let path = url.path().to_lowercase();
                if AUDIO_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
                    Self::DirectMedia(url)
                } else {
                    Self::Page(query.to_string())
                }
            }
            _ => Self::Search(query.to_string()),
        }
    }
}

/// Subset of yt-dlp's `--dump-json` output that we care about.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    duration: Option<f64>,
}

/// Resolver backed by the `yt-dlp` executable.
pub struct YtDlpResolver {
    binary: String,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn is_youtube_url(url: &str) -> bool {
        static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
        PATTERN
            .get_or_init(|| {
                Regex::new(
                    r"^(https?://)?(www\.|m\.|music\.)?(youtube\.com/(watch\?v=|shorts/)|youtu\.be/)[\w-]+",
                )
                .ok()
            })
            .as_ref()
            .is_some_and(|re| re.is_match(url))
    }

    async fn run_ytdlp(&self, target: &str) -> Result<ResolvedSource, ResolutionError> {
        debug!("📊 Running {} for: {}", self.binary, target);

        let output = Command::new(&self.binary)
            .args([
                "--dump-json",
                "--no-playlist",
                "--no-warnings",
                "--skip-download",
                "--format",
                "bestaudio/best",
                "--default-search",
                "auto",
                target,
            ])
            .output()
            .await
            .map_err(|e| ResolutionError(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("❌ yt-dlp failed for {}: {}", target, stderr.trim());
            return Err(ResolutionError(format!("yt-dlp error: {}", stderr.trim())));
        }

        parse_ytdlp_output(&String::from_utf8_lossy(&output.stdout))
    }
}

impl Default for YtDlpResolver {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

#[async_trait]
impl SourceResolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<ResolvedSource, ResolutionError> {
        let kind = QueryKind::classify(query);
        info!("🔍 Resolving {:?}", kind);

        match kind {
            QueryKind::DirectMedia(url) => Ok(direct_media_source(&url)),
            QueryKind::YouTube(url) | QueryKind::Page(url) => self.run_ytdlp(&url).await,
            QueryKind::Search(text) if text.is_empty() => {
                Err(ResolutionError("empty search query".to_string()))
            }
            QueryKind::Search(text) => self.run_ytdlp(&format!("ytsearch1:{}", text)).await,
        }
    }
}

fn direct_media_source(url: &Url) -> ResolvedSource {
    let title = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(str::to_string);

    ResolvedSource {
        source_locator: url.to_string(),
        title,
        page_url: Some(url.to_string()),
        duration: None,
    }
}

/// Picks the first JSON document yt-dlp printed.
fn parse_ytdlp_output(stdout: &str) -> Result<ResolvedSource, ResolutionError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| ResolutionError("no results found".to_string()))?;

    let info: YtDlpInfo = serde_json::from_str(line)
        .map_err(|e| ResolutionError(format!("could not parse yt-dlp output: {}", e)))?;

    let source_locator = info
        .url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ResolutionError("no playable stream in yt-dlp output".to_string()))?;

    Ok(ResolvedSource {
        source_locator,
        title: info.title,
        page_url: info.webpage_url,
        duration: info
            .duration
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64),
    })
}
