//! Core domain model for YTF: the stored video record, the upstream search
//! response shape, and the normalization step between the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ytf-core";

/// Upper bound the search API accepts for `maxResults`.
pub const MAX_RESULTS_LIMIT: u32 = 50;

/// Canonical persisted video row, keyed by `video_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub title: String,
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchOrder {
    #[default]
    Date,
    Relevance,
    ViewCount,
    Rating,
    Title,
}

impl SearchOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchOrder::Date => "date",
            SearchOrder::Relevance => "relevance",
            SearchOrder::ViewCount => "viewCount",
            SearchOrder::Rating => "rating",
            SearchOrder::Title => "title",
        }
    }
}

/// A single `search.list` request. Defaults ask for the newest 50 snippets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub part: String,
    pub order: SearchOrder,
    pub max_results: u32,
}

impl SearchQuery {
    pub fn new(q: impl Into<String>) -> Self {
        Self {
            q: q.into(),
            part: "snippet".to_string(),
            order: SearchOrder::Date,
            max_results: MAX_RESULTS_LIMIT,
        }
    }

    pub fn with_order(mut self, order: SearchOrder) -> Self {
        self.order = order;
        self
    }

    /// Clamped to `1..=MAX_RESULTS_LIMIT`.
    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results.clamp(1, MAX_RESULTS_LIMIT);
        self
    }
}

/// Upstream `search.list` response body. Only the first page is ever read;
/// `next_page_token` is kept for logging.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchListResponse {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(default)]
    pub page_info: Option<PageInfo>,
    #[serde(default)]
    pub items: Vec<SearchItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(default)]
    pub total_results: Option<u64>,
    #[serde(default)]
    pub results_per_page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchItem {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    pub id: ResourceId,
    #[serde(default)]
    pub snippet: Option<Snippet>,
}

/// Search results mix videos, channels and playlists; only one of the ids is set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceId {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub playlist_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    pub published_at: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub thumbnails: Thumbnails,
    #[serde(default)]
    pub channel_title: Option<String>,
    #[serde(default)]
    pub live_broadcast_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Thumbnails {
    #[serde(default)]
    pub default: Option<Thumbnail>,
    #[serde(default)]
    pub medium: Option<Thumbnail>,
    #[serde(default)]
    pub high: Option<Thumbnail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Item-scoped reasons a search result cannot become a [`VideoRecord`].
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("search item {id} has no snippet")]
    MissingSnippet { id: String },
    #[error("search item `{title}` is a {kind} result, not a video")]
    NotAVideo { title: String, kind: String },
    #[error("invalid publishedAt `{value}` for `{title}`: {source}")]
    InvalidPublishedAt {
        title: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

impl SearchItem {
    /// Best identifier for log lines, whatever the resource kind.
    pub fn display_id(&self) -> &str {
        self.id
            .video_id
            .as_deref()
            .or(self.id.channel_id.as_deref())
            .or(self.id.playlist_id.as_deref())
            .unwrap_or("<unknown>")
    }
}

pub fn parse_published_at(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|ts| ts.with_timezone(&Utc))
}

/// Map one upstream search result onto the stored record shape.
pub fn normalize_item(item: &SearchItem) -> Result<VideoRecord, NormalizeError> {
    let Some(snippet) = &item.snippet else {
        return Err(NormalizeError::MissingSnippet {
            id: item.display_id().to_string(),
        });
    };

    let published_at =
        parse_published_at(&snippet.published_at).map_err(|source| {
            NormalizeError::InvalidPublishedAt {
                title: snippet.title.clone(),
                value: snippet.published_at.clone(),
                source,
            }
        })?;

    let video_id = match item.id.video_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            return Err(NormalizeError::NotAVideo {
                title: snippet.title.clone(),
                kind: item.id.kind.clone(),
            })
        }
    };

    let thumbnail_url = snippet
        .thumbnails
        .default
        .as_ref()
        .map(|t| t.url.clone())
        .unwrap_or_default();

    Ok(VideoRecord {
        video_id,
        title: snippet.title.clone(),
        description: snippet.description.clone(),
        published_at,
        thumbnail_url,
    })
}
