//! Core domain model and error taxonomy for LifeDB ledger sync.

use std::collections::HashSet;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Date format used by the upstream API and by landed rows.
pub const LANDED_DATE_FORMAT: &str = "%Y-%m-%d";

pub const DEFAULT_LANDED_TABLE: &str = "landing.buxfer_api_transactions";

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Linked account reference carried by transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SubAccount {
    pub id: Option<i64>,
    pub name: Option<String>,
}

/// One upstream transaction after schema conformance, keyed by canonical names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandedRecord {
    pub id: i64,
    pub description: Option<String>,
    pub date: String,
    #[serde(rename = "type")]
    pub entry_type: Option<String>,
    pub transaction_type: Option<String>,
    pub amount: Option<f64>,
    pub expense_amount: Option<f64>,
    pub account_id: Option<i64>,
    pub account_name: Option<String>,
    pub tags: Option<String>,
    pub tag_names: Option<Vec<String>>,
    pub status: Option<String>,
    pub is_future_dated: Option<bool>,
    pub is_pending: Option<bool>,
    pub from_account: Option<SubAccount>,
    pub to_account: Option<SubAccount>,
}

impl LandedRecord {
    /// Minimal record with only the required fields set.
    pub fn new(id: i64, date: impl Into<String>) -> Self {
        Self {
            id,
            description: None,
            date: date.into(),
            entry_type: None,
            transaction_type: None,
            amount: None,
            expense_amount: None,
            account_id: None,
            account_name: None,
            tags: None,
            tag_names: None,
            status: None,
            is_future_dated: None,
            is_pending: None,
            from_account: None,
            to_account: None,
        }
    }

    pub fn parsed_date(&self) -> Result<NaiveDate, SyncError> {
        NaiveDate::parse_from_str(&self.date, LANDED_DATE_FORMAT).map_err(|err| {
            SyncError::validation(format!(
                "transaction {}: invalid date {:?} (expected YYYY-MM-DD): {err}",
                self.id, self.date
            ))
        })
    }
}

/// The full materialized set of landed rows. Replaced wholesale on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct LandedTable {
    records: Vec<LandedRecord>,
}

impl LandedTable {
    pub fn new(records: Vec<LandedRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[LandedRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<LandedRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> HashSet<i64> {
        self.records.iter().map(|r| r.id).collect()
    }

    pub fn has_unique_ids(&self) -> bool {
        self.ids().len() == self.records.len()
    }

    /// Latest transaction date in the table, or `None` when the table is empty.
    pub fn latest_date(&self) -> Result<Option<NaiveDate>, SyncError> {
        let mut latest: Option<NaiveDate> = None;
        for record in &self.records {
            let date = record.parsed_date()?;
            latest = Some(latest.map_or(date, |cur| cur.max(date)));
        }
        Ok(latest)
    }

    pub fn get(&self, id: i64) -> Option<&LandedRecord> {
        self.records.iter().find(|r| r.id == id)
    }
}

impl From<Vec<LandedRecord>> for LandedTable {
    fn from(records: Vec<LandedRecord>) -> Self {
        Self::new(records)
    }
}

/// Analytics-ready transaction derived from a landed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTransaction {
    pub financial_txn_uuid: Uuid,
    pub txn_dt: NaiveDate,
    pub financial_txn_type: Option<String>,
    pub income_amt: Option<f64>,
    pub expense_amt: Option<f64>,
    pub financial_txn_desc: Option<String>,
    pub financial_account: Option<String>,
    pub tags: Option<String>,
    pub tag_names: Option<Vec<String>>,
}

/// Validated `[schema.]table` identifier. Parts are restricted to
/// `[A-Za-z_][A-Za-z0-9_]*` so they can be spliced into SQL and file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    schema: Option<String>,
    table: String,
}

impl TableName {
    pub fn parse(input: &str) -> Result<Self, SyncError> {
        let parts: Vec<&str> = input.trim().split('.').collect();
        let (schema, table) = match parts.as_slice() {
            [table] => (None, *table),
            [schema, table] => (Some(*schema), *table),
            _ => {
                return Err(SyncError::configuration(format!(
                    "table name {input:?} must be `table` or `schema.table`"
                )))
            }
        };
        for part in schema.iter().chain(std::iter::once(&table)) {
            if !is_identifier(part) {
                return Err(SyncError::configuration(format!(
                    "table name {input:?} contains invalid identifier {part:?}"
                )));
            }
        }
        Ok(Self {
            schema: schema.map(str::to_string),
            table: table.to_string(),
        })
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Double-quoted SQL identifier, e.g. `"landing"."buxfer_api_transactions"`.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("\"{schema}\".\"{}\"", self.table),
            None => format!("\"{}\"", self.table),
        }
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self {
            schema: Some("landing".to_string()),
            table: "buxfer_api_transactions".to_string(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.table),
            None => f.write_str(&self.table),
        }
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Coarse classification of [`SyncError`] for callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    PaginationLimitExceeded,
    Transport,
    Validation,
    Storage,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing credentials, invalid limits or malformed settings. Never retried.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The declared field map and target schema disagree on their key sets.
    #[error(
        "validation error: field map must map the target schema exactly \
         (missing from field map: {missing_from_map:?}, missing from schema: {missing_from_schema:?})"
    )]
    FieldMapMismatch {
        missing_from_map: Vec<String>,
        missing_from_schema: Vec<String>,
    },

    #[error(
        "upstream has {page_count} pages ({total} transactions) but page_limit is {page_limit}; \
         increase page_limit or query a shorter period to avoid incomplete data"
    )]
    PaginationLimitExceeded {
        total: u64,
        page_count: u32,
        page_limit: u32,
    },

    #[error("upstream transport error: {source}")]
    Transport {
        #[source]
        source: BoxError,
        disposition: RetryDisposition,
    },

    /// Upstream payload or stored data does not match the declared schema.
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("storage error while {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl SyncError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn transport(source: impl Into<BoxError>, disposition: RetryDisposition) -> Self {
        Self::Transport {
            source: source.into(),
            disposition,
        }
    }

    pub fn storage(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Storage {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } | Self::FieldMapMismatch { .. } => ErrorKind::Configuration,
            Self::PaginationLimitExceeded { .. } => ErrorKind::PaginationLimitExceeded,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Storage { .. } => ErrorKind::Storage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                disposition: RetryDisposition::Retryable,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_accepts_schema_qualified_identifiers() {
        let name = TableName::parse("landing.buxfer_api_transactions").unwrap();
        assert_eq!(name.schema(), Some("landing"));
        assert_eq!(name.table(), "buxfer_api_transactions");
        assert_eq!(name.quoted(), "\"landing\".\"buxfer_api_transactions\"");
        assert_eq!(name.to_string(), DEFAULT_LANDED_TABLE);
        assert_eq!(name, TableName::default());
    }

    #[test]
    fn table_name_rejects_injection_attempts() {
        for bad in ["", "a.b.c", "landing.tx; drop table x", "1abc", "landing.\"tx\""] {
            let err = TableName::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{bad}");
        }
    }

    #[test]
    fn latest_date_uses_calendar_order() {
        let table = LandedTable::new(vec![
            LandedRecord::new(1, "2024-01-07"),
            LandedRecord::new(2, "2024-01-10"),
            LandedRecord::new(3, "2023-12-31"),
        ]);
        assert_eq!(
            table.latest_date().unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 10)
        );
        assert_eq!(LandedTable::default().latest_date().unwrap(), None);
    }

    #[test]
    fn unparseable_landed_date_is_a_validation_error() {
        let table = LandedTable::new(vec![LandedRecord::new(9, "10/01/2024")]);
        let err = table.latest_date().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("transaction 9"));
    }

    #[test]
    fn landed_record_serializes_type_under_canonical_name() {
        let mut record = LandedRecord::new(5, "2024-02-01");
        record.entry_type = Some("expense".into());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "expense");
        assert!(value.get("entry_type").is_none());
    }

    #[test]
    fn only_retryable_transport_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert!(SyncError::transport(io, RetryDisposition::Retryable).is_retryable());
        assert!(!SyncError::configuration("missing token").is_retryable());
        let err = SyncError::PaginationLimitExceeded {
            total: 600,
            page_count: 6,
            page_limit: 5,
        };
        assert_eq!(err.kind(), ErrorKind::PaginationLimitExceeded);
        assert!(!err.is_retryable());
    }
}
