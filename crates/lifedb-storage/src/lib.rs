//! HTTP transport and landed-table storage backends for LifeDB.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use lifedb_core::{LandedRecord, LandedTable, RetryDisposition, SubAccount, SyncError, TableName};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

pub use reqwest::Url;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a sibling temp file and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let result = write_temp_then_rename(&temp_path, path, bytes).await;
    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

async fn write_temp_then_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    fs::rename(temp_path, path).await.with_context(|| {
        format!(
            "atomically renaming {} -> {}",
            temp_path.display(),
            path.display()
        )
    })
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Strip the query string, which carries the API token.
pub fn redact_query(url: &Url) -> String {
    let mut redacted = url.clone();
    redacted.set_query(None);
    redacted.to_string()
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

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl From<FetchError> for SyncError {
    fn from(err: FetchError) -> Self {
        let disposition = match &err {
            FetchError::Request(inner) => classify_reqwest_error(inner),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        };
        SyncError::transport(err, disposition)
    }
}

/// Single-attempt HTTP GET client. Retries are left to the caller.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, SyncError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| SyncError::configuration(format!("building http client: {err}")))?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: Url) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("http_fetch", url = %redact_query(&url));
        async move {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;
            let status = resp.status();
            let final_url = redact_query(resp.url());

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?
                .to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "http response");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Storage collaborator for the landed table. `replace` must be atomic from a
/// reader's point of view: readers observe the old table or the new one.
#[async_trait]
pub trait LandedStore: Send + Sync {
    /// `None` when the table does not exist.
    async fn read(&self, table: &TableName) -> Result<Option<LandedTable>, SyncError>;

    async fn replace(&self, table: &TableName, rows: &LandedTable) -> Result<(), SyncError>;
}

#[derive(Debug, Default)]
pub struct MemoryLandedStore {
    tables: Mutex<HashMap<TableName, LandedTable>>,
    replacements: Mutex<usize>,
}

impl MemoryLandedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_table(self, table: TableName, rows: LandedTable) -> Self {
        self.tables.lock().await.insert(table, rows);
        self
    }

    /// Number of successful `replace` calls.
    pub async fn replacements(&self) -> usize {
        *self.replacements.lock().await
    }
}

#[async_trait]
impl LandedStore for MemoryLandedStore {
    async fn read(&self, table: &TableName) -> Result<Option<LandedTable>, SyncError> {
        Ok(self.tables.lock().await.get(table).cloned())
    }

    async fn replace(&self, table: &TableName, rows: &LandedTable) -> Result<(), SyncError> {
        self.tables.lock().await.insert(table.clone(), rows.clone());
        *self.replacements.lock().await += 1;
        Ok(())
    }
}

/// One JSON document per table under `root`, e.g. `landing.buxfer_api_transactions.json`.
#[derive(Debug, Clone)]
pub struct JsonFileLandedStore {
    root: PathBuf,
}

impl JsonFileLandedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, table: &TableName) -> PathBuf {
        self.root.join(format!("{table}.json"))
    }
}

#[async_trait]
impl LandedStore for JsonFileLandedStore {
    async fn read(&self, table: &TableName) -> Result<Option<LandedTable>, SyncError> {
        let path = self.table_path(table);
        let exists = fs::try_exists(&path)
            .await
            .map_err(|err| SyncError::storage(format!("checking {}", path.display()), err))?;
        if !exists {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .map_err(|err| SyncError::storage(format!("reading {}", path.display()), err))?;
        let rows: LandedTable = serde_json::from_slice(&bytes)
            .map_err(|err| SyncError::storage(format!("parsing {}", path.display()), err))?;
        Ok(Some(rows))
    }

    async fn replace(&self, table: &TableName, rows: &LandedTable) -> Result<(), SyncError> {
        let path = self.table_path(table);
        let bytes = serde_json::to_vec(rows)
            .map_err(|err| SyncError::storage(format!("serializing {table}"), err))?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|err| SyncError::storage(format!("replacing {}", path.display()), err))?;
        info!(%table, rows = rows.len(), path = %path.display(), "landed table replaced");
        Ok(())
    }
}

const LANDED_COLUMNS: &str = "id, description, date, type, transaction_type, amount, \
     expense_amount, account_id, account_name, tags, tag_names, status, is_future_dated, \
     is_pending, from_account, to_account";

/// Bind parameters per row; keeps each INSERT under the Postgres 65535 limit.
const INSERT_BATCH_ROWS: usize = 1000;

/// Postgres-backed landed table. Replace drops and recreates the table inside a
/// single transaction.
#[derive(Debug, Clone)]
pub struct PgLandedStore {
    pool: PgPool,
}

impl PgLandedStore {
    pub async fn connect(database_url: &str) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .map_err(|err| SyncError::storage("connecting to postgres", err))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    fn create_table_sql(table: &TableName) -> String {
        format!(
            "CREATE TABLE {} (\
             id BIGINT NOT NULL, \
             description TEXT, \
             date TEXT NOT NULL, \
             type TEXT, \
             transaction_type TEXT, \
             amount DOUBLE PRECISION, \
             expense_amount DOUBLE PRECISION, \
             account_id BIGINT, \
             account_name TEXT, \
             tags TEXT, \
             tag_names TEXT[], \
             status TEXT, \
             is_future_dated BOOLEAN, \
             is_pending BOOLEAN, \
             from_account JSONB, \
             to_account JSONB)",
            table.quoted()
        )
    }
}

/// Column-for-column image of a landed row in Postgres. Sub-accounts are JSONB
/// so an account with no fields survives the round trip.
#[derive(Debug, Clone, FromRow)]
struct LandedRow {
    id: i64,
    description: Option<String>,
    date: String,
    #[sqlx(rename = "type")]
    entry_type: Option<String>,
    transaction_type: Option<String>,
    amount: Option<f64>,
    expense_amount: Option<f64>,
    account_id: Option<i64>,
    account_name: Option<String>,
    tags: Option<String>,
    tag_names: Option<Vec<String>>,
    status: Option<String>,
    is_future_dated: Option<bool>,
    is_pending: Option<bool>,
    from_account: Option<Json<SubAccount>>,
    to_account: Option<Json<SubAccount>>,
}

impl From<&LandedRecord> for LandedRow {
    fn from(record: &LandedRecord) -> Self {
        Self {
            id: record.id,
            description: record.description.clone(),
            date: record.date.clone(),
            entry_type: record.entry_type.clone(),
            transaction_type: record.transaction_type.clone(),
            amount: record.amount,
            expense_amount: record.expense_amount,
            account_id: record.account_id,
            account_name: record.account_name.clone(),
            tags: record.tags.clone(),
            tag_names: record.tag_names.clone(),
            status: record.status.clone(),
            is_future_dated: record.is_future_dated,
            is_pending: record.is_pending,
            from_account: record.from_account.clone().map(Json),
            to_account: record.to_account.clone().map(Json),
        }
    }
}

impl From<LandedRow> for LandedRecord {
    fn from(row: LandedRow) -> Self {
        Self {
            id: row.id,
            description: row.description,
            date: row.date,
            entry_type: row.entry_type,
            transaction_type: row.transaction_type,
            amount: row.amount,
            expense_amount: row.expense_amount,
            account_id: row.account_id,
            account_name: row.account_name,
            tags: row.tags,
            tag_names: row.tag_names,
            status: row.status,
            is_future_dated: row.is_future_dated,
            is_pending: row.is_pending,
            from_account: row.from_account.map(|Json(account)| account),
            to_account: row.to_account.map(|Json(account)| account),
        }
    }
}

#[async_trait]
impl LandedStore for PgLandedStore {
    async fn read(&self, table: &TableName) -> Result<Option<LandedTable>, SyncError> {
        let regclass: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(table.quoted())
            .fetch_one(&self.pool)
            .await
            .map_err(|err| SyncError::storage(format!("resolving {table}"), err))?;
        if regclass.is_none() {
            return Ok(None);
        }

        let sql = format!(
            "SELECT {LANDED_COLUMNS} FROM {} ORDER BY date, id",
            table.quoted()
        );
        let rows: Vec<LandedRow> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| SyncError::storage(format!("reading {table}"), err))?;
        Ok(Some(LandedTable::new(
            rows.into_iter().map(LandedRecord::from).collect(),
        )))
    }

    async fn replace(&self, table: &TableName, rows: &LandedTable) -> Result<(), SyncError> {
        let storage_err = |err: sqlx::Error| SyncError::storage(format!("replacing {table}"), err);
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        if let Some(schema) = table.schema() {
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.quoted()))
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        sqlx::query(&Self::create_table_sql(table))
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        for chunk in rows.records().chunks(INSERT_BATCH_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({LANDED_COLUMNS}) ",
                table.quoted()
            ));
            builder.push_values(chunk.iter().map(LandedRow::from), |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(row.description)
                    .push_bind(row.date)
                    .push_bind(row.entry_type)
                    .push_bind(row.transaction_type)
                    .push_bind(row.amount)
                    .push_bind(row.expense_amount)
                    .push_bind(row.account_id)
                    .push_bind(row.account_name)
                    .push_bind(row.tags)
                    .push_bind(row.tag_names)
                    .push_bind(row.status)
                    .push_bind(row.is_future_dated)
                    .push_bind(row.is_pending)
                    .push_bind(row.from_account)
                    .push_bind(row.to_account);
            });
            builder.build().execute(&mut *tx).await.map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        info!(%table, rows = rows.len(), "landed table replaced");
        Ok(())
    }
}
