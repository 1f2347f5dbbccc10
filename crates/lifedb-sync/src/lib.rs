//! Incremental transaction sync: merge strategy, reconciliation and the
//! canonical analytics view.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::types::Date32Type;
use arrow_array::{ArrayRef, Date32Array, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use lifedb_adapters::{
    ApiToken, BuxferApiConfig, BuxferClient, PaginatedFetcher, TransactionsApi, BUXFER_API_URL,
};
use lifedb_core::{
    CanonicalTransaction, LandedRecord, LandedTable, SyncError, TableName, DEFAULT_LANDED_TABLE,
};
use lifedb_storage::{
    sha256_hex, write_atomic, HttpClientConfig, JsonFileLandedStore, LandedStore, PgLandedStore,
};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Namespace for deriving canonical transaction ids from Buxfer ids.
pub const BUXFER_TRANSACTION_UUID_NAMESPACE: Uuid =
    Uuid::from_u128(0xb62cbe9b_b190_49a2_83d1_59ff13025f68);

pub const DEFAULT_PAGE_LIMIT: u32 = 5;

#[derive(Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres { database_url: String },
    File { data_dir: PathBuf },
}

impl fmt::Debug for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres { .. } => f.write_str("Postgres { database_url: *** }"),
            Self::File { data_dir } => f.debug_struct("File").field("data_dir", data_dir).finish(),
        }
    }
}

/// Where the landed table lives. Enough to read it back without API credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandedTableConfig {
    pub table: TableName,
    pub store: StoreBackend,
}

impl LandedTableConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let table = TableName::parse(
            &var("LIFEDB_LANDED_TABLE").unwrap_or_else(|| DEFAULT_LANDED_TABLE.to_string()),
        )?;

        let store = match var("LIFEDB_STORE").as_deref().unwrap_or("postgres") {
            "postgres" => StoreBackend::Postgres {
                database_url: database_url_from(&var)?,
            },
            "file" => StoreBackend::File {
                data_dir: var("LIFEDB_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data")),
            },
            other => {
                return Err(SyncError::configuration(format!(
                    "LIFEDB_STORE must be `postgres` or `file`, got {other:?}"
                )))
            }
        };

        Ok(Self { table, store })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api: BuxferApiConfig,
    pub table: TableName,
    pub page_limit: u32,
    pub lookback_days: u32,
    pub store: StoreBackend,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source. Every value is
    /// validated here so a bad setting fails before any I/O.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_token = var("LIFEDB_BUXFER_API_TOKEN").and_then(ApiToken::new).ok_or_else(|| {
            SyncError::configuration(
                "environment variable LIFEDB_BUXFER_API_TOKEN is required to connect to the Buxfer API",
            )
        })?;

        let lookback_days = match var("LIFEDB_LOOKBACK_DAYS") {
            Some(raw) => parse_env_number::<u32>("LIFEDB_LOOKBACK_DAYS", &raw)?,
            None => {
                warn!(
                    "LIFEDB_LOOKBACK_DAYS is not set; using 0, so corrections to transactions \
                     dated before the latest landed date will not be re-fetched"
                );
                0
            }
        };

        let page_limit = match var("LIFEDB_PAGE_LIMIT") {
            Some(raw) => parse_env_number::<u32>("LIFEDB_PAGE_LIMIT", &raw)?,
            None => DEFAULT_PAGE_LIMIT,
        };
        validate_page_limit(page_limit)?;

        let LandedTableConfig { table, store } = LandedTableConfig::from_lookup(&var)?;

        let http_timeout_secs = match var("LIFEDB_HTTP_TIMEOUT_SECS") {
            Some(raw) => parse_env_number::<u64>("LIFEDB_HTTP_TIMEOUT_SECS", &raw)?,
            None => 20,
        };

        Ok(Self {
            api: BuxferApiConfig {
                base_url: var("LIFEDB_BUXFER_API_URL").unwrap_or_else(|| BUXFER_API_URL.to_string()),
                api_token: Some(api_token),
                http: HttpClientConfig {
                    timeout: Duration::from_secs(http_timeout_secs),
                    user_agent: Some(
                        var("LIFEDB_USER_AGENT").unwrap_or_else(|| "lifedb-sync/0.1".to_string()),
                    ),
                },
            },
            table,
            page_limit,
            lookback_days,
            store,
        })
    }

    pub fn landed_table(&self) -> LandedTableConfig {
        LandedTableConfig {
            table: self.table.clone(),
            store: self.store.clone(),
        }
    }

    pub fn merge_config(&self) -> MergeConfig {
        MergeConfig {
            table: self.table.clone(),
            page_limit: self.page_limit,
            lookback_days: self.lookback_days,
        }
    }
}

fn parse_env_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, SyncError> {
    raw.trim().parse().map_err(|_| {
        SyncError::configuration(format!("{key} must be a non-negative integer, got {raw:?}"))
    })
}

fn database_url_from(var: &impl Fn(&str) -> Option<String>) -> Result<String, SyncError> {
    if let Some(url) = var("DATABASE_URL") {
        return Ok(url);
    }
    let required = |key: &str| {
        var(key).ok_or_else(|| {
            SyncError::configuration(format!(
                "missing environment variable {key} required for database connection"
            ))
        })
    };
    Ok(format!(
        "postgresql://{}:{}@{}:{}/{}",
        required("LIFEDB_DB_USER")?,
        required("LIFEDB_DB_PASSWORD")?,
        required("LIFEDB_DB_HOST")?,
        required("LIFEDB_DB_PORT")?,
        required("LIFEDB_DB_NAME")?
    ))
}

fn validate_page_limit(page_limit: u32) -> Result<(), SyncError> {
    if page_limit < 1 {
        return Err(SyncError::configuration(
            "page_limit must be a positive integer of at least 1",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConfig {
    pub table: TableName,
    pub page_limit: u32,
    /// Days before the latest landed date to re-fetch. No default: callers choose.
    pub lookback_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MergeStrategy {
    /// No landed rows yet: full fetch, partial data tolerated.
    ColdStart,
    /// Re-fetch from `window_start` and evict refreshed ids.
    Incremental {
        latest: NaiveDate,
        window_start: NaiveDate,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub run_id: Uuid,
    pub strategy: MergeStrategy,
    pub existing_rows: usize,
    pub fetched_rows: usize,
    pub evicted_rows: usize,
    pub final_rows: usize,
    /// False when the cold-start fetch was clamped by the page limit.
    pub complete: bool,
}

/// Decide the merge strategy from the current landed table.
pub fn plan(existing: Option<&LandedTable>, lookback_days: u32) -> Result<MergeStrategy, SyncError> {
    let Some(latest) = existing.map(LandedTable::latest_date).transpose()?.flatten() else {
        return Ok(MergeStrategy::ColdStart);
    };
    let window_start = latest
        .checked_sub_days(Days::new(u64::from(lookback_days)))
        .ok_or_else(|| {
            SyncError::configuration(format!(
                "lookback of {lookback_days} days before {latest} is out of range"
            ))
        })?;
    Ok(MergeStrategy::Incremental {
        latest,
        window_start,
    })
}

/// Collapse repeated ids, keeping the last occurrence in its position.
/// Returns the surviving records and the number dropped.
pub fn dedupe_by_id(records: Vec<LandedRecord>) -> (Vec<LandedRecord>, usize) {
    let before = records.len();
    let mut seen = HashSet::with_capacity(before);
    let mut kept: Vec<LandedRecord> = records
        .into_iter()
        .rev()
        .filter(|record| seen.insert(record.id))
        .collect();
    kept.reverse();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// Existing rows whose id was not re-fetched, followed by the fetched rows.
/// Returns the reconciled table and the number of existing rows evicted.
pub fn reconcile(existing: LandedTable, fetched: Vec<LandedRecord>) -> (LandedTable, usize) {
    let (fetched, collapsed) = dedupe_by_id(fetched);
    if collapsed > 0 {
        warn!(collapsed, "fetched batch contained repeated ids; kept the last occurrence");
    }
    let fetched_ids: HashSet<i64> = fetched.iter().map(|r| r.id).collect();

    let existing_rows = existing.len();
    let mut merged: Vec<LandedRecord> = existing
        .into_records()
        .into_iter()
        .filter(|record| !fetched_ids.contains(&record.id))
        .collect();
    let evicted = existing_rows - merged.len();
    merged.extend(fetched);
    (LandedTable::new(merged), evicted)
}

/// Runs one cold-start or incremental merge and replaces the landed table.
/// Nothing is written unless the whole run succeeds.
pub struct IncrementalMerger<'a, A, S: ?Sized> {
    fetcher: &'a PaginatedFetcher<A>,
    store: &'a S,
    config: MergeConfig,
}

impl<'a, A, S> IncrementalMerger<'a, A, S>
where
    A: TransactionsApi,
    S: LandedStore + ?Sized,
{
    pub fn new(
        fetcher: &'a PaginatedFetcher<A>,
        store: &'a S,
        config: MergeConfig,
    ) -> Result<Self, SyncError> {
        validate_page_limit(config.page_limit)?;
        Ok(Self {
            fetcher,
            store,
            config,
        })
    }

    pub async fn run(&self) -> Result<MergeOutcome, SyncError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("merge_run", %run_id, table = %self.config.table);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<MergeOutcome, SyncError> {
        let existing = self.store.read(&self.config.table).await?;
        let existing_rows = existing.as_ref().map_or(0, LandedTable::len);
        let strategy = plan(existing.as_ref(), self.config.lookback_days)?;
        info!(?strategy, existing_rows, "merge strategy selected");

        let (table, fetched_rows, evicted_rows, complete) = match strategy {
            MergeStrategy::ColdStart => {
                let outcome = self
                    .fetcher
                    .fetch(None, self.config.page_limit, true)
                    .await?;
                let fetched_rows = outcome.records.len();
                let (records, collapsed) = dedupe_by_id(outcome.records);
                if collapsed > 0 {
                    warn!(collapsed, "fetched batch contained repeated ids; kept the last occurrence");
                }
                if !outcome.complete {
                    warn!(
                        total = outcome.total_available,
                        landed = records.len(),
                        "cold start landed partial data"
                    );
                }
                (LandedTable::new(records), fetched_rows, 0, outcome.complete)
            }
            MergeStrategy::Incremental { window_start, .. } => {
                let outcome = self
                    .fetcher
                    .fetch(Some(window_start), self.config.page_limit, false)
                    .await?;
                let fetched_rows = outcome.records.len();
                let (table, evicted) = reconcile(existing.unwrap_or_default(), outcome.records);
                (table, fetched_rows, evicted, outcome.complete)
            }
        };

        self.store.replace(&self.config.table, &table).await?;

        let merged = MergeOutcome {
            run_id,
            strategy,
            existing_rows,
            fetched_rows,
            evicted_rows,
            final_rows: table.len(),
            complete,
        };
        info!(
            fetched_rows,
            evicted_rows,
            final_rows = merged.final_rows,
            "merge complete"
        );
        Ok(merged)
    }
}

pub fn transaction_uuid(source_id: i64) -> Uuid {
    Uuid::new_v5(
        &BUXFER_TRANSACTION_UUID_NAMESPACE,
        source_id.to_string().as_bytes(),
    )
}

pub fn conform_transaction(record: &LandedRecord) -> Result<CanonicalTransaction, SyncError> {
    Ok(CanonicalTransaction {
        financial_txn_uuid: transaction_uuid(record.id),
        txn_dt: record.parsed_date()?,
        financial_txn_type: record.transaction_type.clone(),
        income_amt: record.expense_amount.map(|amount| -amount),
        expense_amt: record.expense_amount,
        financial_txn_desc: record.description.clone(),
        financial_account: record.account_name.clone(),
        tags: record.tags.clone(),
        tag_names: record.tag_names.clone(),
    })
}

/// Derive the analytic view. A single unparseable record fails the whole call.
pub fn conform_transactions(
    records: &[LandedRecord],
) -> Result<Vec<CanonicalTransaction>, SyncError> {
    records.iter().map(conform_transaction).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct CanonicalExport {
    pub path: PathBuf,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

fn canonical_schema() -> Schema {
    Schema::new(vec![
        ArrowField::new("financial_txn_uuid", DataType::Utf8, false),
        ArrowField::new("txn_dt", DataType::Date32, false),
        ArrowField::new("financial_txn_type", DataType::Utf8, true),
        ArrowField::new("income_amt", DataType::Float64, true),
        ArrowField::new("expense_amt", DataType::Float64, true),
        ArrowField::new("financial_txn_desc", DataType::Utf8, true),
        ArrowField::new("financial_account", DataType::Utf8, true),
        ArrowField::new("tags", DataType::Utf8, true),
    ])
}

fn canonical_record_batch(transactions: &[CanonicalTransaction]) -> Result<RecordBatch> {
    let uuids = StringArray::from(
        transactions
            .iter()
            .map(|t| Some(t.financial_txn_uuid.to_string()))
            .collect::<Vec<_>>(),
    );
    let dates = Date32Array::from(
        transactions
            .iter()
            .map(|t| Date32Type::from_naive_date(t.txn_dt))
            .collect::<Vec<_>>(),
    );
    let types = StringArray::from(
        transactions
            .iter()
            .map(|t| t.financial_txn_type.as_deref())
            .collect::<Vec<_>>(),
    );
    let incomes = Float64Array::from(transactions.iter().map(|t| t.income_amt).collect::<Vec<_>>());
    let expenses =
        Float64Array::from(transactions.iter().map(|t| t.expense_amt).collect::<Vec<_>>());
    let descriptions = StringArray::from(
        transactions
            .iter()
            .map(|t| t.financial_txn_desc.as_deref())
            .collect::<Vec<_>>(),
    );
    let accounts = StringArray::from(
        transactions
            .iter()
            .map(|t| t.financial_account.as_deref())
            .collect::<Vec<_>>(),
    );
    let tags = StringArray::from(
        transactions
            .iter()
            .map(|t| t.tags.as_deref())
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        Arc::new(canonical_schema()),
        vec![
            Arc::new(uuids) as ArrayRef,
            Arc::new(dates),
            Arc::new(types),
            Arc::new(incomes),
            Arc::new(expenses),
            Arc::new(descriptions),
            Arc::new(accounts),
            Arc::new(tags),
        ],
    )
    .context("building canonical transactions record batch")
}

fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.into_inner().context("closing parquet writer")
}

/// Write the canonical view to `path` as a single Parquet file.
pub async fn export_canonical_parquet(
    path: &Path,
    transactions: &[CanonicalTransaction],
) -> Result<CanonicalExport> {
    let batch = canonical_record_batch(transactions)?;
    let bytes = encode_parquet(&batch)?;
    write_atomic(path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(CanonicalExport {
        path: path.to_path_buf(),
        rows: transactions.len(),
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// The landed-table backend selected by configuration, opened for one run.
pub enum ConfiguredStore {
    Postgres(PgLandedStore),
    File(JsonFileLandedStore),
}

impl ConfiguredStore {
    pub async fn open(backend: &StoreBackend) -> Result<Self, SyncError> {
        Ok(match backend {
            StoreBackend::Postgres { database_url } => {
                Self::Postgres(PgLandedStore::connect(database_url).await?)
            }
            StoreBackend::File { data_dir } => Self::File(JsonFileLandedStore::new(data_dir)),
        })
    }

    pub async fn close(self) {
        if let Self::Postgres(store) = self {
            store.close().await;
        }
    }
}

#[async_trait]
impl LandedStore for ConfiguredStore {
    async fn read(&self, table: &TableName) -> Result<Option<LandedTable>, SyncError> {
        match self {
            Self::Postgres(store) => store.read(table).await,
            Self::File(store) => store.read(table).await,
        }
    }

    async fn replace(&self, table: &TableName, rows: &LandedTable) -> Result<(), SyncError> {
        match self {
            Self::Postgres(store) => store.replace(table, rows).await,
            Self::File(store) => store.replace(table, rows).await,
        }
    }
}

/// One merge run with resources scoped to the run.
pub async fn run_sync_once(config: &SyncConfig) -> Result<MergeOutcome, SyncError> {
    let fetcher = PaginatedFetcher::new(BuxferClient::new(config.api.clone())?);
    let merge_config = config.merge_config();
    validate_page_limit(merge_config.page_limit)?;

    let store = ConfiguredStore::open(&config.store).await?;
    let result = match IncrementalMerger::new(&fetcher, &store, merge_config) {
        Ok(merger) => merger.run().await,
        Err(err) => Err(err),
    };
    store.close().await;
    result
}

pub async fn run_sync_once_from_env(page_limit: Option<u32>) -> Result<MergeOutcome, SyncError> {
    let mut config = SyncConfig::from_env()?;
    if let Some(page_limit) = page_limit {
        validate_page_limit(page_limit)?;
        config.page_limit = page_limit;
    }
    run_sync_once(&config).await
}

/// Read the landed table and export its canonical view.
pub async fn export_canonical(
    config: &LandedTableConfig,
    output: &Path,
) -> Result<CanonicalExport> {
    let store = ConfiguredStore::open(&config.store).await?;
    let landed = store.read(&config.table).await;
    store.close().await;

    let landed = landed?
        .with_context(|| format!("landed table {} does not exist; run sync first", config.table))?;
    let transactions = conform_transactions(landed.records())?;
    let export = export_canonical_parquet(output, &transactions).await?;
    info!(
        rows = export.rows,
        path = %export.path.display(),
        sha256 = %export.sha256,
        "canonical transactions exported"
    );
    Ok(export)
}

pub async fn export_canonical_from_env(output: &Path) -> Result<CanonicalExport> {
    let config = LandedTableConfig::from_env()?;
    export_canonical(&config, output).await
}
