//! Video search source contracts + the YouTube Data API and fixture implementations.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use ytf_core::{SearchItem, SearchListResponse, SearchQuery};
use ytf_storage::{FetchError, HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "ytf-adapters";

pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search client misconfigured: {0}")]
    Config(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading search fixture {path}: {message}")]
    Fixture { path: String, message: String },
}

/// One page of results, exactly as the service ordered them.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub fetched_at: DateTime<Utc>,
    pub items: Vec<SearchItem>,
    pub next_page_token: Option<String>,
    pub total_results: Option<u64>,
}

impl SearchPage {
    pub fn from_response(response: SearchListResponse, fetched_at: DateTime<Utc>) -> Self {
        Self {
            fetched_at,
            total_results: response.page_info.and_then(|p| p.total_results),
            next_page_token: response.next_page_token,
            items: response.items,
        }
    }
}

#[async_trait]
pub trait VideoSearch: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, SearchError>;
}

#[derive(Clone)]
pub struct YouTubeSearchConfig {
    pub api_key: String,
    pub base_url: String,
    pub http: HttpClientConfig,
}

impl YouTubeSearchConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            http: HttpClientConfig::default(),
        }
    }
}

impl fmt::Debug for YouTubeSearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YouTubeSearchConfig")
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .field("http", &self.http)
            .finish()
    }
}

/// `search.list` over HTTPS, authenticated with an API key.
pub struct YouTubeSearchClient {
    http: HttpFetcher,
    api_key: String,
    search_url: Url,
}

impl fmt::Debug for YouTubeSearchClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YouTubeSearchClient")
            .field("search_url", &self.search_url.as_str())
            .finish_non_exhaustive()
    }
}

impl YouTubeSearchClient {
    pub fn new(config: YouTubeSearchConfig) -> Result<Self, SearchError> {
        let api_key = config.api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(SearchError::Config("api key is empty".to_string()));
        }

        let search_url = Url::parse(&format!("{}/search", config.base_url.trim_end_matches('/')))
            .map_err(|e| SearchError::Config(format!("invalid base url `{}`: {e}", config.base_url)))?;
        let http = HttpFetcher::new(config.http).map_err(|e| SearchError::Config(format!("{e:#}")))?;

        Ok(Self {
            http,
            api_key,
            search_url,
        })
    }

    pub fn request_url(&self, query: &SearchQuery) -> Url {
        let mut url = self.search_url.clone();
        url.query_pairs_mut()
            .append_pair("part", &query.part)
            .append_pair("q", &query.q)
            .append_pair("order", query.order.as_str())
            .append_pair("maxResults", &query.max_results.to_string())
            .append_pair("key", &self.api_key);
        url
    }
}

#[async_trait]
impl VideoSearch for YouTubeSearchClient {
    fn source_id(&self) -> &'static str {
        "youtube"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, SearchError> {
        let response: SearchListResponse = self.http.get_json(self.request_url(query)).await?;
        let page = SearchPage::from_response(response, Utc::now());
        debug!(
            items = page.items.len(),
            has_next_page = page.next_page_token.is_some(),
            "search page received"
        );
        Ok(page)
    }
}

/// Serves a saved `search.list` response instead of calling the API.
///
/// File-backed fixtures are re-read on every search so edits show up on the next tick.
#[derive(Debug, Clone)]
pub enum FixtureSearch {
    File(PathBuf),
    Inline(SearchListResponse),
}

impl FixtureSearch {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn from_response(response: SearchListResponse) -> Self {
        Self::Inline(response)
    }
}

#[async_trait]
impl VideoSearch for FixtureSearch {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn search(&self, _query: &SearchQuery) -> Result<SearchPage, SearchError> {
        let response = match self {
            FixtureSearch::Inline(response) => response.clone(),
            FixtureSearch::File(path) => {
                load_search_fixture(path).map_err(|e| SearchError::Fixture {
                    path: path.display().to_string(),
                    message: format!("{e:#}"),
                })?
            }
        };
        Ok(SearchPage::from_response(response, Utc::now()))
    }
}

pub fn load_search_fixture(path: impl AsRef<Path>) -> Result<SearchListResponse> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn fixture_path() -> PathBuf {
        workspace_root().join("fixtures/search/golang_tutorials.json")
    }

    /// Accept one connection, answer it with `status` + `body`, and hand back the request head.
    async fn serve_once(status: &'static str, body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&head).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn client_for(base_url: String) -> YouTubeSearchClient {
        YouTubeSearchClient::new(YouTubeSearchConfig {
            base_url,
            ..YouTubeSearchConfig::new("test-key")
        })
        .expect("client")
    }

    #[test]
    fn empty_api_key_fails_construction() {
        let err = YouTubeSearchClient::new(YouTubeSearchConfig::new("  ")).unwrap_err();
        assert!(matches!(err, SearchError::Config(_)));
    }

    #[test]
    fn invalid_base_url_fails_construction() {
        let err = YouTubeSearchClient::new(YouTubeSearchConfig {
            base_url: "not a url".into(),
            ..YouTubeSearchConfig::new("k")
        })
        .unwrap_err();
        assert!(matches!(err, SearchError::Config(ref msg) if msg.contains("not a url")));
    }

    #[test]
    fn request_url_carries_search_parameters() {
        let client = YouTubeSearchClient::new(YouTubeSearchConfig::new("test-key")).expect("client");
        let url = client.request_url(&SearchQuery::new("golang tutorials"));
        assert_eq!(url.path(), "/youtube/v3/search");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("part".to_string(), "snippet".to_string()),
                ("q".to_string(), "golang tutorials".to_string()),
                ("order".to_string(), "date".to_string()),
                ("maxResults".to_string(), "50".to_string()),
                ("key".to_string(), "test-key".to_string()),
            ]
        );
    }

    #[test]
    fn debug_output_hides_api_key() {
        let config = YouTubeSearchConfig::new("super-secret");
        assert!(!format!("{config:?}").contains("super-secret"));
        let client = YouTubeSearchClient::new(config).expect("client");
        assert!(!format!("{client:?}").contains("super-secret"));
    }

    #[tokio::test]
    async fn search_decodes_page_from_http_response() {
        let body = std::fs::read_to_string(fixture_path()).expect("fixture");
        let (base_url, server) = serve_once("200 OK", body).await;
        let client = client_for(base_url);

        let page = client
            .search(&SearchQuery::new("golang tutorials"))
            .await
            .expect("search");
        let head = server.await.expect("server task");

        assert!(head.starts_with(
            "GET /search?part=snippet&q=golang+tutorials&order=date&maxResults=50&key=test-key "
        ));
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.items[0].id.video_id.as_deref(), Some("abc123"));
        assert_eq!(page.next_page_token.as_deref(), Some("CAMQAA"));
    }

    #[tokio::test]
    async fn search_surfaces_http_status_errors() {
        let body = r#"{"error":{"code":403,"message":"quotaExceeded"}}"#.to_string();
        let (base_url, server) = serve_once("403 Forbidden", body).await;
        let client = client_for(base_url);

        let err = client
            .search(&SearchQuery::new("golang tutorials"))
            .await
            .unwrap_err();
        server.await.expect("server task");

        match err {
            SearchError::Fetch(FetchError::HttpStatus { status, url, body }) => {
                assert_eq!(status, 403);
                assert!(body.contains("quotaExceeded"));
                assert!(!url.contains("test-key"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unreachable_host_error_hides_api_key() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let client = client_for(format!("http://{addr}"));

        let err = client
            .search(&SearchQuery::new("golang tutorials"))
            .await
            .unwrap_err();

        assert!(matches!(err, SearchError::Fetch(FetchError::Request { .. })));
        assert!(!err.to_string().contains("test-key"));
        assert!(!format!("{:#}", anyhow::Error::from(err)).contains("test-key"));
    }

    #[tokio::test]
    async fn search_surfaces_decode_errors() {
        let (base_url, server) = serve_once("200 OK", "<html>nope</html>".to_string()).await;
        let client = client_for(base_url);

        let err = client
            .search(&SearchQuery::new("golang tutorials"))
            .await
            .unwrap_err();
        server.await.expect("server task");
        assert!(matches!(err, SearchError::Fetch(FetchError::Decode { .. })));
    }

    #[tokio::test]
    async fn fixture_search_reads_saved_response() {
        let search = FixtureSearch::from_path(fixture_path());
        let page = search
            .search(&SearchQuery::new("ignored"))
            .await
            .expect("fixture search");
        let ids: Vec<_> = page.items.iter().map(|i| i.display_id().to_string()).collect();
        assert_eq!(ids, vec!["abc123", "def456", "UCgopher"]);
        assert_eq!(page.total_results, Some(3));
    }

    #[tokio::test]
    async fn missing_fixture_is_a_search_error() {
        let search = FixtureSearch::from_path(workspace_root().join("fixtures/search/missing.json"));
        let err = search.search(&SearchQuery::new("q")).await.unwrap_err();
        assert!(matches!(err, SearchError::Fixture { .. }));
    }
}
