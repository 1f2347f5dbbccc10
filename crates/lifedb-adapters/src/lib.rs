//! Buxfer API adapter: schema conformance, page transport and paginated fetch.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use lifedb_core::{LandedRecord, SyncError, LANDED_DATE_FORMAT};
use lifedb_storage::{HttpClientConfig, HttpFetcher, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};
use tracing::{debug, info, warn, Instrument};

pub const BUXFER_API_URL: &str = "https://www.buxfer.com/api";

/// Transactions per page. Fixed by the provider.
pub const PAGE_SIZE: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Int64,
    Float64,
    Utf8,
    Boolean,
    Utf8List,
    /// `{ id, name }` account reference.
    Account,
}

impl FieldType {
    /// Check `value` against this type, returning the normalized JSON to deserialize.
    /// Null is accepted for every type; required-ness is enforced by the record type.
    fn check(self, value: &JsonValue) -> Result<JsonValue, String> {
        if value.is_null() {
            return Ok(JsonValue::Null);
        }
        match self {
            FieldType::Int64 => value
                .as_i64()
                .map(JsonValue::from)
                .ok_or_else(|| format!("expected a 64-bit integer, got {value}")),
            FieldType::Float64 => value
                .as_f64()
                .and_then(Number::from_f64)
                .map(JsonValue::Number)
                .ok_or_else(|| format!("expected a number, got {value}")),
            FieldType::Utf8 => value
                .as_str()
                .map(JsonValue::from)
                .ok_or_else(|| format!("expected a string, got {value}")),
            FieldType::Boolean => value
                .as_bool()
                .map(JsonValue::from)
                .ok_or_else(|| format!("expected a boolean, got {value}")),
            FieldType::Utf8List => {
                let items = value
                    .as_array()
                    .ok_or_else(|| format!("expected a list of strings, got {value}"))?;
                items
                    .iter()
                    .map(|item| {
                        item.as_str()
                            .map(JsonValue::from)
                            .ok_or_else(|| format!("expected list items to be strings, got {item}"))
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(JsonValue::Array)
            }
            FieldType::Account => {
                let object = value
                    .as_object()
                    .ok_or_else(|| format!("expected an account object, got {value}"))?;
                let null = JsonValue::Null;
                let id = FieldType::Int64
                    .check(object.get("id").unwrap_or(&null))
                    .map_err(|reason| format!("account id: {reason}"))?;
                let name = FieldType::Utf8
                    .check(object.get("name").unwrap_or(&null))
                    .map_err(|reason| format!("account name: {reason}"))?;
                let mut account = JsonMap::new();
                account.insert("id".to_string(), id);
                account.insert("name".to_string(), name);
                Ok(JsonValue::Object(account))
            }
        }
    }
}

const REQUIRED_COLUMNS: [&str; 2] = ["id", "date"];

/// Type of each column a [`LandedRecord`] can hold, `None` for unknown names.
fn landed_column_type(canonical: &str) -> Option<FieldType> {
    use FieldType::*;
    Some(match canonical {
        "id" | "account_id" => Int64,
        "amount" | "expense_amount" => Float64,
        "description" | "date" | "type" | "transaction_type" | "account_name" | "tags"
        | "status" => Utf8,
        "is_future_dated" | "is_pending" => Boolean,
        "tag_names" => Utf8List,
        "from_account" | "to_account" => Account,
        _ => return None,
    })
}

/// One column of the intake schema: canonical name, upstream name and type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub canonical: String,
    pub source: String,
    pub field_type: FieldType,
}

impl FieldSpec {
    pub fn new(canonical: &str, source: &str, field_type: FieldType) -> Self {
        Self {
            canonical: canonical.to_string(),
            source: source.to_string(),
            field_type,
        }
    }
}

/// Declarative mapping from upstream payload keys to canonical landed columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeSchema {
    fields: Vec<FieldSpec>,
}

impl IntakeSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self, SyncError> {
        {
            let mut canonical = BTreeSet::new();
            let mut source = BTreeSet::new();
            for field in &fields {
                if !canonical.insert(field.canonical.as_str()) {
                    return Err(SyncError::configuration(format!(
                        "canonical field {:?} is declared more than once",
                        field.canonical
                    )));
                }
                if !source.insert(field.source.as_str()) {
                    return Err(SyncError::configuration(format!(
                        "source field {:?} is declared more than once",
                        field.source
                    )));
                }
                match landed_column_type(&field.canonical) {
                    None => {
                        return Err(SyncError::configuration(format!(
                            "canonical field {:?} is not a landed column",
                            field.canonical
                        )))
                    }
                    Some(expected) if expected != field.field_type => {
                        return Err(SyncError::configuration(format!(
                            "canonical field {:?} is declared as {:?} but the landed column is {:?}",
                            field.canonical, field.field_type, expected
                        )))
                    }
                    Some(_) => {}
                }
            }
            if let Some(required) = REQUIRED_COLUMNS
                .iter()
                .find(|name| !canonical.contains(*name))
            {
                return Err(SyncError::configuration(format!(
                    "intake schema must map the required landed column {required:?}"
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Intake schema for the Buxfer `/transactions` endpoint.
    pub fn buxfer_transactions() -> Self {
        use FieldType::*;
        Self {
            fields: vec![
                FieldSpec::new("id", "id", Int64),
                FieldSpec::new("description", "description", Utf8),
                FieldSpec::new("date", "date", Utf8),
                FieldSpec::new("type", "type", Utf8),
                FieldSpec::new("transaction_type", "transactionType", Utf8),
                FieldSpec::new("amount", "amount", Float64),
                FieldSpec::new("expense_amount", "expenseAmount", Float64),
                FieldSpec::new("account_id", "accountId", Int64),
                FieldSpec::new("account_name", "accountName", Utf8),
                FieldSpec::new("tags", "tags", Utf8),
                FieldSpec::new("tag_names", "tagNames", Utf8List),
                FieldSpec::new("status", "status", Utf8),
                FieldSpec::new("is_future_dated", "isFutureDated", Boolean),
                FieldSpec::new("is_pending", "isPending", Boolean),
                FieldSpec::new("from_account", "fromAccount", Account),
                FieldSpec::new("to_account", "toAccount", Account),
            ],
        }
    }

    /// Build a schema from a rename map (source -> canonical) and a type map
    /// keyed by canonical name. The two maps must cover exactly the same
    /// canonical names; any drift is rejected before a payload is touched.
    pub fn from_maps(
        field_map: &BTreeMap<String, String>,
        target_schema: &BTreeMap<String, FieldType>,
    ) -> Result<Self, SyncError> {
        let mapped: BTreeSet<&str> = field_map.values().map(String::as_str).collect();
        let declared: BTreeSet<&str> = target_schema.keys().map(String::as_str).collect();

        let missing_from_map: Vec<String> =
            declared.difference(&mapped).map(|s| s.to_string()).collect();
        let missing_from_schema: Vec<String> =
            mapped.difference(&declared).map(|s| s.to_string()).collect();
        if !missing_from_map.is_empty() || !missing_from_schema.is_empty() {
            return Err(SyncError::FieldMapMismatch {
                missing_from_map,
                missing_from_schema,
            });
        }
        if mapped.len() != field_map.len() {
            return Err(SyncError::configuration(
                "field map renames several source fields to the same canonical field",
            ));
        }

        let fields = field_map
            .iter()
            .map(|(source, canonical)| FieldSpec {
                canonical: canonical.clone(),
                source: source.clone(),
                field_type: target_schema[canonical],
            })
            .collect();
        Self::new(fields)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }
}

/// Conform a JSON array of upstream transactions into landed records.
/// Fails on the first record that does not match the schema.
pub fn conform(raw: &JsonValue, schema: &IntakeSchema) -> Result<Vec<LandedRecord>, SyncError> {
    let items = raw.as_array().ok_or_else(|| {
        SyncError::validation("expected transactions to be a JSON array")
    })?;
    items
        .iter()
        .enumerate()
        .map(|(index, item)| conform_record(index, item, schema))
        .collect()
}

/// Two-map form of [`conform`]; validates the maps before parsing.
pub fn conform_with_maps(
    raw: &JsonValue,
    field_map: &BTreeMap<String, String>,
    target_schema: &BTreeMap<String, FieldType>,
) -> Result<Vec<LandedRecord>, SyncError> {
    let schema = IntakeSchema::from_maps(field_map, target_schema)?;
    conform(raw, &schema)
}

fn conform_record(
    index: usize,
    item: &JsonValue,
    schema: &IntakeSchema,
) -> Result<LandedRecord, SyncError> {
    let object = item.as_object().ok_or_else(|| {
        SyncError::validation(format!("record {index}: expected a JSON object, got {item}"))
    })?;

    let null = JsonValue::Null;
    let mut canonical = JsonMap::with_capacity(schema.fields.len());
    for field in &schema.fields {
        let value = object.get(&field.source).unwrap_or(&null);
        let checked = field.field_type.check(value).map_err(|reason| {
            SyncError::validation(format!(
                "record {index}: field {:?} ({}) {reason}",
                field.source, field.canonical
            ))
        })?;
        canonical.insert(field.canonical.clone(), checked);
    }

    serde_json::from_value(JsonValue::Object(canonical))
        .map_err(|err| SyncError::validation(format!("record {index}: {err}")))
}

/// Parameters of a single upstream page request. `page: None` is the first page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub start_date: Option<NaiveDate>,
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionsPage {
    pub num_transactions: u64,
    /// Raw transaction objects, not yet conformed.
    pub transactions: JsonValue,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    response: EnvelopeBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeBody {
    num_transactions: TransactionCount,
    transactions: JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TransactionCount {
    Number(u64),
    Text(String),
}

pub fn parse_transactions_page(body: &[u8]) -> Result<TransactionsPage, SyncError> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|err| SyncError::validation(format!("malformed transactions response: {err}")))?;
    let num_transactions = match envelope.response.num_transactions {
        TransactionCount::Number(n) => n,
        TransactionCount::Text(text) => text.trim().parse().map_err(|_| {
            SyncError::validation(format!("numTransactions {text:?} is not a count"))
        })?,
    };
    Ok(TransactionsPage {
        num_transactions,
        transactions: envelope.response.transactions,
    })
}

/// Upstream seam: one call per page.
#[async_trait]
pub trait TransactionsApi: Send + Sync {
    async fn fetch_page(&self, query: &PageQuery) -> Result<TransactionsPage, SyncError>;
}

/// API credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiToken(String);

impl ApiToken {
    /// `None` for blank tokens.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            None
        } else {
            Some(Self(token))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiToken(***)")
    }
}

#[derive(Debug, Clone)]
pub struct BuxferApiConfig {
    pub base_url: String,
    pub api_token: Option<ApiToken>,
    pub http: HttpClientConfig,
}

impl Default for BuxferApiConfig {
    fn default() -> Self {
        Self {
            base_url: BUXFER_API_URL.to_string(),
            api_token: None,
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuxferClient {
    http: HttpFetcher,
    transactions_url: Url,
    token: ApiToken,
}

impl BuxferClient {
    /// Fails without touching the network when the credential is missing.
    pub fn new(config: BuxferApiConfig) -> Result<Self, SyncError> {
        let token = config.api_token.ok_or_else(|| {
            SyncError::configuration(
                "LIFEDB_BUXFER_API_TOKEN is required to connect to the Buxfer API",
            )
        })?;
        let base = config.base_url.trim_end_matches('/');
        let transactions_url = Url::parse(&format!("{base}/transactions")).map_err(|err| {
            SyncError::configuration(format!("invalid Buxfer API url {base:?}: {err}"))
        })?;
        let http = HttpFetcher::new(config.http)?;
        Ok(Self {
            http,
            transactions_url,
            token,
        })
    }

    pub fn page_url(&self, query: &PageQuery) -> Url {
        let mut url = self.transactions_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("token", self.token.expose());
            if let Some(start_date) = query.start_date {
                pairs.append_pair(
                    "startDate",
                    &start_date.format(LANDED_DATE_FORMAT).to_string(),
                );
            }
            if let Some(page) = query.page {
                pairs.append_pair("page", &page.to_string());
            }
        }
        url
    }
}

#[async_trait]
impl TransactionsApi for BuxferClient {
    async fn fetch_page(&self, query: &PageQuery) -> Result<TransactionsPage, SyncError> {
        let response = self.http.fetch_bytes(self.page_url(query)).await?;
        parse_transactions_page(&response.body)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub records: Vec<LandedRecord>,
    /// `numTransactions` reported by the first page.
    pub total_available: u64,
    /// Pages upstream has for the query.
    pub page_count: u32,
    pub pages_fetched: u32,
    /// False when pages were dropped because of the page limit.
    pub complete: bool,
}

pub fn page_count_for(total: u64) -> u32 {
    u32::try_from(total.div_ceil(PAGE_SIZE)).unwrap_or(u32::MAX)
}

/// Walks upstream pages in increasing order and conforms each one.
#[derive(Debug)]
pub struct PaginatedFetcher<A> {
    api: A,
    schema: IntakeSchema,
}

impl<A: TransactionsApi> PaginatedFetcher<A> {
    pub fn new(api: A) -> Self {
        Self::with_schema(api, IntakeSchema::buxfer_transactions())
    }

    pub fn with_schema(api: A, schema: IntakeSchema) -> Self {
        Self { api, schema }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Fetch every page for `start_date` (inclusive), bounded by `page_limit`.
    ///
    /// When upstream has more pages than `page_limit`, this fails with
    /// [`SyncError::PaginationLimitExceeded`] unless `allow_partial_data` is set,
    /// in which case only the first `page_limit` pages are returned and the
    /// outcome is marked incomplete.
    pub async fn fetch(
        &self,
        start_date: Option<NaiveDate>,
        page_limit: u32,
        allow_partial_data: bool,
    ) -> Result<FetchOutcome, SyncError> {
        if page_limit < 1 {
            return Err(SyncError::configuration(
                "page_limit must be a positive integer of at least 1",
            ));
        }

        let span = tracing::info_span!(
            "paginated_fetch",
            start_date = ?start_date,
            page_limit,
            allow_partial_data
        );
        async move {
            let (total, mut records) = self.fetch_conformed(start_date, None).await?;
            let page_count = page_count_for(total);

            let pages_to_fetch = if page_count > page_limit {
                if !allow_partial_data {
                    return Err(SyncError::PaginationLimitExceeded {
                        total,
                        page_count,
                        page_limit,
                    });
                }
                warn!(
                    total,
                    page_count, page_limit, "page limit reached; returning partial data"
                );
                page_limit
            } else {
                page_count
            };

            let mut pages_fetched = 1;
            for page in 2..=pages_to_fetch {
                let (_, page_records) = self.fetch_conformed(start_date, Some(page)).await?;
                records.extend(page_records);
                pages_fetched += 1;
            }

            info!(
                total,
                pages_fetched,
                records = records.len(),
                "fetched transactions"
            );
            Ok(FetchOutcome {
                records,
                total_available: total,
                page_count,
                pages_fetched,
                complete: pages_to_fetch == page_count,
            })
        }
        .instrument(span)
        .await
    }

    async fn fetch_conformed(
        &self,
        start_date: Option<NaiveDate>,
        page: Option<u32>,
    ) -> Result<(u64, Vec<LandedRecord>), SyncError> {
        let page_response = self.api.fetch_page(&PageQuery { start_date, page }).await?;
        let records = conform(&page_response.transactions, &self.schema)?;
        debug!(page = page.unwrap_or(1), records = records.len(), "page conformed");
        Ok((page_response.num_transactions, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifedb_core::{ErrorKind, RetryDisposition};
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeApi {
        total: u64,
        failing_page: Option<u32>,
        calls: Mutex<Vec<PageQuery>>,
    }

    impl FakeApi {
        fn with_total(total: u64) -> Self {
            Self {
                total,
                failing_page: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Requests for `page` fail with a retryable transport error.
        fn failing_on(total: u64, page: u32) -> Self {
            Self {
                failing_page: Some(page),
                ..Self::with_total(total)
            }
        }

        fn calls(&self) -> Vec<PageQuery> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransactionsApi for FakeApi {
        async fn fetch_page(&self, query: &PageQuery) -> Result<TransactionsPage, SyncError> {
            self.calls.lock().unwrap().push(query.clone());
            if self.failing_page == Some(query.page.unwrap_or(1)) {
                return Err(SyncError::transport(
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream timed out"),
                    RetryDisposition::Retryable,
                ));
            }
            let page = u64::from(query.page.unwrap_or(1));
            let first = (page - 1) * PAGE_SIZE + 1;
            let last = (page * PAGE_SIZE).min(self.total);
            let transactions = (first..=last)
                .map(|id| json!({ "id": id, "date": "2024-01-10", "expenseAmount": 1.5 }))
                .collect::<Vec<_>>();
            Ok(TransactionsPage {
                num_transactions: self.total,
                transactions: JsonValue::Array(transactions),
            })
        }
    }

    fn buxfer_item() -> JsonValue {
        json!({
            "id": 4242,
            "description": "Rent",
            "date": "2024-01-09",
            "type": "transfer",
            "transactionType": "transfer",
            "amount": 1200.0,
            "expenseAmount": 0,
            "accountId": 7,
            "accountName": "Checking",
            "tags": "home,rent",
            "tagNames": ["home", "rent"],
            "status": "cleared",
            "isFutureDated": false,
            "isPending": false,
            "fromAccount": { "id": 7, "name": "Checking" },
            "toAccount": { "id": 8, "name": "Landlord" },
            "extraUpstreamField": "ignored"
        })
    }

    #[test]
    fn buxfer_schema_is_a_bijection() {
        let schema = IntakeSchema::buxfer_transactions();
        assert_eq!(IntakeSchema::new(schema.fields().to_vec()).unwrap(), schema);
        assert_eq!(schema.fields().len(), 16);
    }

    #[test]
    fn conform_renames_and_types_buxfer_fields() {
        let records = conform(&json!([buxfer_item()]), &IntakeSchema::buxfer_transactions()).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, 4242);
        assert_eq!(record.transaction_type.as_deref(), Some("transfer"));
        assert_eq!(record.entry_type.as_deref(), Some("transfer"));
        assert_eq!(record.expense_amount, Some(0.0));
        assert_eq!(record.account_id, Some(7));
        assert_eq!(record.tag_names.as_deref(), Some(&["home".to_string(), "rent".to_string()][..]));
        assert_eq!(record.is_pending, Some(false));
        let to = record.to_account.as_ref().unwrap();
        assert_eq!((to.id, to.name.as_deref()), (Some(8), Some("Landlord")));
    }

    #[test]
    fn conform_treats_missing_optional_fields_as_null() {
        let records = conform(
            &json!([{ "id": 1, "date": "2024-01-01" }]),
            &IntakeSchema::buxfer_transactions(),
        )
        .unwrap();
        assert_eq!(records[0], LandedRecord::new(1, "2024-01-01"));
    }

    #[test]
    fn conform_rejects_type_mismatch_with_record_index() {
        let mut bad = buxfer_item();
        bad["isPending"] = json!("yes");
        let err = conform(&json!([buxfer_item(), bad]), &IntakeSchema::buxfer_transactions())
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
        let message = err.to_string();
        assert!(message.contains("record 1"), "{message}");
        assert!(message.contains("isPending"), "{message}");
    }

    #[test]
    fn conform_rejects_missing_id() {
        let err = conform(&json!([{ "date": "2024-01-01" }]), &IntakeSchema::buxfer_transactions())
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }

    #[test]
    fn conform_rejects_non_array_payload() {
        let err = conform(&json!({ "id": 1 }), &IntakeSchema::buxfer_transactions()).unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }

    #[test]
    fn field_map_mismatch_fails_before_parsing() {
        let field_map = BTreeMap::from([
            ("id".to_string(), "id".to_string()),
            ("date".to_string(), "date".to_string()),
        ]);
        let target_schema = BTreeMap::from([
            ("id".to_string(), FieldType::Int64),
            ("date".to_string(), FieldType::Utf8),
            ("status".to_string(), FieldType::Utf8),
        ]);

        // The payload is not even an array; the map check must win.
        let err = conform_with_maps(&json!("not a payload"), &field_map, &target_schema)
            .unwrap_err();
        match err {
            SyncError::FieldMapMismatch {
                missing_from_map,
                missing_from_schema,
            } => {
                assert_eq!(missing_from_map, vec!["status".to_string()]);
                assert!(missing_from_schema.is_empty());
            }
            other => panic!("expected FieldMapMismatch, got {other:?}"),
        }
    }

    #[test]
    fn field_map_renaming_two_sources_to_one_column_is_rejected() {
        let field_map = BTreeMap::from([
            ("id".to_string(), "id".to_string()),
            ("txnId".to_string(), "id".to_string()),
        ]);
        let target_schema = BTreeMap::from([("id".to_string(), FieldType::Int64)]);
        let err = IntakeSchema::from_maps(&field_map, &target_schema).unwrap_err();
        assert!(matches!(err, SyncError::Configuration { .. }));
    }

    #[test]
    fn unknown_canonical_column_is_rejected_before_parsing() {
        let field_map = BTreeMap::from([
            ("id".to_string(), "id".to_string()),
            ("date".to_string(), "date".to_string()),
            ("accountName".to_string(), "acct_name".to_string()),
        ]);
        let target_schema = BTreeMap::from([
            ("id".to_string(), FieldType::Int64),
            ("date".to_string(), FieldType::Utf8),
            ("acct_name".to_string(), FieldType::Utf8),
        ]);

        let err = conform_with_maps(
            &json!([{ "id": 1, "date": "2024-01-01", "accountName": "Everyday" }]),
            &field_map,
            &target_schema,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Configuration { .. }));
        assert!(err.to_string().contains("acct_name"), "{err}");
    }

    #[test]
    fn schema_type_conflicting_with_landed_column_is_rejected() {
        let err = IntakeSchema::new(vec![
            FieldSpec::new("id", "id", FieldType::Int64),
            FieldSpec::new("date", "date", FieldType::Utf8),
            FieldSpec::new("amount", "amount", FieldType::Utf8),
        ])
        .unwrap_err();
        assert!(matches!(err, SyncError::Configuration { .. }));
        assert!(err.to_string().contains("amount"), "{err}");
    }

    #[test]
    fn schema_without_required_columns_is_rejected() {
        let err = IntakeSchema::new(vec![
            FieldSpec::new("id", "id", FieldType::Int64),
            FieldSpec::new("status", "status", FieldType::Utf8),
        ])
        .unwrap_err();
        assert!(matches!(err, SyncError::Configuration { .. }));
        assert!(err.to_string().contains("date"), "{err}");
    }

    #[test]
    fn conform_with_matching_maps_renames_fields() {
        let field_map = BTreeMap::from([
            ("id".to_string(), "id".to_string()),
            ("date".to_string(), "date".to_string()),
            ("expenseAmount".to_string(), "expense_amount".to_string()),
        ]);
        let target_schema = BTreeMap::from([
            ("id".to_string(), FieldType::Int64),
            ("date".to_string(), FieldType::Utf8),
            ("expense_amount".to_string(), FieldType::Float64),
        ]);
        let records = conform_with_maps(
            &json!([{ "id": 3, "date": "2024-01-03", "expenseAmount": 12.25 }]),
            &field_map,
            &target_schema,
        )
        .unwrap();
        assert_eq!(records[0].expense_amount, Some(12.25));
    }

    #[test]
    fn envelope_accepts_string_counts() {
        let page = parse_transactions_page(
            br#"{"response":{"numTransactions":"250","transactions":[]}}"#,
        )
        .unwrap();
        assert_eq!(page.num_transactions, 250);
        assert!(parse_transactions_page(br#"{"error":{"message":"bad token"}}"#).is_err());
    }

    #[test]
    fn client_requires_token_before_any_request() {
        let err = BuxferClient::new(BuxferApiConfig::default()).unwrap_err();
        assert!(matches!(err, SyncError::Configuration { .. }));
        assert!(ApiToken::new("   ").is_none());
    }

    #[test]
    fn page_url_omits_page_for_first_request() {
        let client = BuxferClient::new(BuxferApiConfig {
            api_token: ApiToken::new("abc123"),
            ..Default::default()
        })
        .unwrap();

        let first = client.page_url(&PageQuery {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 7),
            page: None,
        });
        assert_eq!(
            first.as_str(),
            "https://www.buxfer.com/api/transactions?token=abc123&startDate=2024-01-07"
        );

        let third = client.page_url(&PageQuery {
            start_date: None,
            page: Some(3),
        });
        assert_eq!(
            third.as_str(),
            "https://www.buxfer.com/api/transactions?token=abc123&page=3"
        );
        assert!(!format!("{client:?}").contains("abc123"));
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(page_count_for(0), 0);
        assert_eq!(page_count_for(100), 1);
        assert_eq!(page_count_for(101), 2);
        assert_eq!(page_count_for(250), 3);
    }

    #[tokio::test]
    async fn fetch_concatenates_pages_in_order() {
        let fetcher = PaginatedFetcher::new(FakeApi::with_total(250));
        let outcome = fetcher.fetch(None, 5, false).await.unwrap();

        assert_eq!(outcome.records.len(), 250);
        assert!(outcome
            .records
            .iter()
            .map(|r| r.id)
            .eq(1..=250));
        assert_eq!(outcome.page_count, 3);
        assert_eq!(outcome.pages_fetched, 3);
        assert!(outcome.complete);

        let pages: Vec<_> = fetcher.api().calls().iter().map(|q| q.page).collect();
        assert_eq!(pages, vec![None, Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn fetch_over_limit_without_partial_data_fails() {
        let fetcher = PaginatedFetcher::new(FakeApi::with_total(600));
        let err = fetcher.fetch(None, 5, false).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::PaginationLimitExceeded {
                total: 600,
                page_count: 6,
                page_limit: 5
            }
        ));
        assert_eq!(fetcher.api().calls().len(), 1);
    }

    #[tokio::test]
    async fn fetch_over_limit_with_partial_data_clamps_pages() {
        let fetcher = PaginatedFetcher::new(FakeApi::with_total(600));
        let outcome = fetcher.fetch(None, 5, true).await.unwrap();
        assert_eq!(outcome.records.len(), 500);
        assert_eq!(outcome.records.last().map(|r| r.id), Some(500));
        assert_eq!(outcome.pages_fetched, 5);
        assert!(!outcome.complete);
        assert_eq!(fetcher.api().calls().len(), 5);
    }

    #[tokio::test]
    async fn transport_failure_mid_walk_propagates_and_discards_earlier_pages() {
        let fetcher = PaginatedFetcher::new(FakeApi::failing_on(250, 2));
        let err = fetcher.fetch(None, 5, true).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());
        let pages: Vec<_> = fetcher.api().calls().iter().map(|q| q.page).collect();
        assert_eq!(pages, vec![None, Some(2)]);
    }

    #[tokio::test]
    async fn zero_page_limit_is_rejected_before_any_call() {
        let fetcher = PaginatedFetcher::new(FakeApi::with_total(10));
        let err = fetcher.fetch(None, 0, true).await.unwrap_err();
        assert!(matches!(err, SyncError::Configuration { .. }));
        assert!(fetcher.api().calls().is_empty());
    }

    #[tokio::test]
    async fn start_date_is_sent_with_every_page() {
        let fetcher = PaginatedFetcher::new(FakeApi::with_total(150));
        let start = NaiveDate::from_ymd_opt(2024, 1, 7);
        fetcher.fetch(start, 2, false).await.unwrap();
        assert!(fetcher.api().calls().iter().all(|q| q.start_date == start));
    }

    #[tokio::test]
    async fn empty_upstream_returns_first_page_only() {
        let fetcher = PaginatedFetcher::new(FakeApi::with_total(0));
        let outcome = fetcher.fetch(None, 1, false).await.unwrap();
        assert!(outcome.records.is_empty());
        assert!(outcome.complete);
        assert_eq!(fetcher.api().calls().len(), 1);
    }
}
