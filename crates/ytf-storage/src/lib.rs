//! Video persistence (upsert-by-id stores) + HTTP fetch utilities for YTF.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use ytf_core::VideoRecord;

pub const CRATE_NAME: &str = "ytf-storage";

const PG_CREATE_VIDEOS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS videos (
    video_id VARCHAR(255) PRIMARY KEY,
    title VARCHAR(255),
    description TEXT,
    published_at TIMESTAMPTZ,
    thumbnail_url VARCHAR(255)
)
"#;

const PG_UPSERT_VIDEO: &str = r#"
INSERT INTO videos (video_id, title, description, published_at, thumbnail_url)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (video_id) DO UPDATE SET
    title = EXCLUDED.title,
    description = EXCLUDED.description,
    published_at = EXCLUDED.published_at,
    thumbnail_url = EXCLUDED.thumbnail_url
"#;

const SQLITE_CREATE_VIDEOS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS videos (
    video_id VARCHAR(255) PRIMARY KEY,
    title VARCHAR(255),
    description TEXT,
    published_at DATETIME,
    thumbnail_url VARCHAR(255)
)
"#;

const SQLITE_UPSERT_VIDEO: &str = r#"
INSERT INTO videos (video_id, title, description, published_at, thumbnail_url)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT (video_id) DO UPDATE SET
    title = excluded.title,
    description = excluded.description,
    published_at = excluded.published_at,
    thumbnail_url = excluded.thumbnail_url
"#;

const SQLITE_SELECT_VIDEO: &str =
    "SELECT video_id, title, description, published_at, thumbnail_url FROM videos WHERE video_id = ?";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("creating videos table: {0}")]
    Schema(#[source] sqlx::Error),
    #[error("upserting video row: {0}")]
    Upsert(#[source] sqlx::Error),
    #[error("querying videos: {0}")]
    Query(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failure to persist one record. Never fatal to the cycle that produced it.
#[derive(Debug, Error)]
#[error("writing video {video_id} (`{title}`): {source}")]
pub struct WriteError {
    pub video_id: String,
    pub title: String,
    #[source]
    pub source: StoreError,
}

/// Storage capability the ingest cycle writes through.
#[async_trait]
pub trait VideoStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Create the `videos` table if it is absent. Must leave existing rows untouched.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Insert or fully replace the row keyed by `record.video_id`.
    async fn upsert(&self, record: &VideoRecord) -> Result<(), StoreError>;
}

/// Writes one record at a time, bootstrapping the table lazily.
///
/// `ensure_schema` runs before writes until it succeeds once; after that the
/// writer trusts the table to exist. A failed bootstrap is logged and the
/// upsert is still attempted.
pub struct UpsertWriter {
    store: Arc<dyn VideoStore>,
    schema_ready: AtomicBool,
}

impl UpsertWriter {
    pub fn new(store: Arc<dyn VideoStore>) -> Self {
        Self {
            store,
            schema_ready: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn VideoStore> {
        &self.store
    }

    pub fn schema_ready(&self) -> bool {
        self.schema_ready.load(Ordering::Acquire)
    }

    pub async fn write(&self, record: &VideoRecord) -> Result<(), WriteError> {
        if !self.schema_ready() {
            match self.store.ensure_schema().await {
                Ok(()) => {
                    debug!(backend = self.store.backend(), "videos table ensured");
                    self.schema_ready.store(true, Ordering::Release);
                }
                Err(err) => {
                    warn!(
                        backend = self.store.backend(),
                        video_id = %record.video_id,
                        error = %err,
                        "creating videos table failed; attempting upsert anyway"
                    );
                }
            }
        }

        self.store
            .upsert(record)
            .await
            .map_err(|source| WriteError {
                video_id: record.video_id.clone(),
                title: record.title.clone(),
                source,
            })
    }
}

#[derive(Debug, Clone)]
pub struct PgVideoStore {
    pool: PgPool,
}

impl PgVideoStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl VideoStore for PgVideoStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(PG_CREATE_VIDEOS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Schema)?;
        Ok(())
    }

    async fn upsert(&self, record: &VideoRecord) -> Result<(), StoreError> {
        sqlx::query(PG_UPSERT_VIDEO)
            .bind(&record.video_id)
            .bind(&record.title)
            .bind(&record.description)
            .bind(record.published_at)
            .bind(&record.thumbnail_url)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Upsert)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteVideoStore {
    pool: SqlitePool,
}

impl SqliteVideoStore {
    /// In-memory URLs get a single long-lived connection so every query sees the same database.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("parsing sqlite database url")?
            .create_if_missing(true);
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .context("opening sqlite database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get(&self, video_id: &str) -> Result<Option<VideoRecord>, StoreError> {
        let row = sqlx::query(SQLITE_SELECT_VIDEO)
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| sqlite_row_to_record(&row)).transpose()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM videos")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn sqlite_row_to_record(row: &SqliteRow) -> Result<VideoRecord, StoreError> {
    Ok(VideoRecord {
        video_id: row.try_get("video_id")?,
        title: row.try_get::<Option<String>, _>("title")?.unwrap_or_default(),
        description: row.try_get::<Option<String>, _>("description")?.unwrap_or_default(),
        published_at: row.try_get("published_at")?,
        thumbnail_url: row
            .try_get::<Option<String>, _>("thumbnail_url")?
            .unwrap_or_default(),
    })
}

#[async_trait]
impl VideoStore for SqliteVideoStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(SQLITE_CREATE_VIDEOS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Schema)?;
        Ok(())
    }

    async fn upsert(&self, record: &VideoRecord) -> Result<(), StoreError> {
        sqlx::query(SQLITE_UPSERT_VIDEO)
            .bind(&record.video_id)
            .bind(&record.title)
            .bind(&record.description)
            .bind(record.published_at)
            .bind(&record.thumbnail_url)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Upsert)?;
        Ok(())
    }
}

/// In-process store for tests and dry runs. The table starts absent, like a fresh database.
#[derive(Debug, Default)]
pub struct MemoryVideoStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    table: Option<BTreeMap<String, VideoRecord>>,
    failing_schema_checks: usize,
    failing_ids: HashSet<String>,
    ensure_schema_calls: usize,
    upsert_calls: usize,
}

impl MemoryVideoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                table: Some(BTreeMap::new()),
                ..Default::default()
            }),
        }
    }

    /// Make the next `n` `ensure_schema` calls fail.
    pub async fn fail_next_schema_checks(&self, n: usize) {
        self.state.lock().await.failing_schema_checks = n;
    }

    /// Make every upsert of `video_id` fail.
    pub async fn fail_upserts_for(&self, video_id: impl Into<String>) {
        self.state.lock().await.failing_ids.insert(video_id.into());
    }

    pub async fn get(&self, video_id: &str) -> Option<VideoRecord> {
        let state = self.state.lock().await;
        state.table.as_ref().and_then(|t| t.get(video_id).cloned())
    }

    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.table.as_ref().map(BTreeMap::len).unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn has_table(&self) -> bool {
        self.state.lock().await.table.is_some()
    }

    pub async fn ensure_schema_calls(&self) -> usize {
        self.state.lock().await.ensure_schema_calls
    }

    pub async fn upsert_calls(&self) -> usize {
        self.state.lock().await.upsert_calls
    }
}

#[async_trait]
impl VideoStore for MemoryVideoStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_schema_calls += 1;
        if state.failing_schema_checks > 0 {
            state.failing_schema_checks -= 1;
            return Err(StoreError::Unavailable("schema check rejected".to_string()));
        }
        state.table.get_or_insert_with(BTreeMap::new);
        Ok(())
    }

    async fn upsert(&self, record: &VideoRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.upsert_calls += 1;
        if state.failing_ids.contains(&record.video_id) {
            return Err(StoreError::Unavailable(format!(
                "upsert rejected for {}",
                record.video_id
            )));
        }
        let Some(table) = state.table.as_mut() else {
            return Err(StoreError::Unavailable("no such table: videos".to_string()));
        };
        table.insert(record.video_id.clone(), record.clone());
        Ok(())
    }
}

/// Open the store matching the URL scheme (`postgres://`, `postgresql://`, `sqlite:`).
pub async fn connect_store(database_url: &str) -> anyhow::Result<Arc<dyn VideoStore>> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        Ok(Arc::new(PgVideoStore::connect(database_url).await?))
    } else if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteVideoStore::connect(database_url).await?))
    } else {
        let scheme = database_url.split(':').next().unwrap_or_default();
        anyhow::bail!("unsupported database url scheme `{scheme}`")
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport failure. `source` has its URL stripped; `url` is redacted.
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

const ERROR_BODY_LIMIT: usize = 512;

/// Query parameters whose values never reach logs or error messages.
const SECRET_QUERY_PARAMS: &[&str] = &["key", "access_token"];

/// Render `url` with credential query values masked.
pub fn redacted_url(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if SECRET_QUERY_PARAMS.contains(&k.as_ref()) {
                "***".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();
    if pairs.is_empty() {
        return redacted.to_string();
    }
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// One GET, no retries. Non-2xx statuses surface with a truncated body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
        let shown_url = redacted_url(&url);
        let span = info_span!("http_fetch", url = %shown_url);

        async move {
            let transport = |source: reqwest::Error| FetchError::Request {
                url: shown_url.clone(),
                source: source.without_url(),
            };
            let resp = self.client.get(url).send().await.map_err(transport)?;
            let status = resp.status();

            if !status.is_success() {
                let mut body = resp.text().await.unwrap_or_default();
                if body.len() > ERROR_BODY_LIMIT {
                    let mut cut = ERROR_BODY_LIMIT;
                    while !body.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    body.truncate(cut);
                }
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: shown_url.clone(),
                    body,
                });
            }

            let bytes = resp.bytes().await.map_err(transport)?;
            debug!(bytes = bytes.len(), "response received");
            serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                url: shown_url.clone(),
                source,
            })
        }
        .instrument(span)
        .await
    }
}
