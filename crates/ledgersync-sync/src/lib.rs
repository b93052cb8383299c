//! Sync pipeline: field mapping, existing-record index, upsert engine and run reporting.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ledgersync_adapters::{
    AxonautConfig, AxonautSource, FetchError, Fetched, FixtureSource, RecordSource,
};
use ledgersync_core::{
    invoice_fields, payment_fields, DestinationRecord, EntityKind, Properties, PropertyValue,
    RecordId, SourceInvoice, SourcePayment, SourceRecord,
};
use ledgersync_storage::{DocumentStore, NotionConfig, NotionStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required but not set")]
    Missing(&'static str),
    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Process-wide settings, read once at startup and passed by reference.
#[derive(Clone)]
pub struct SyncConfig {
    /// Empty when records are read from `axonaut_fixtures_dir`.
    pub axonaut_api_key: String,
    pub axonaut_api_base: String,
    pub axonaut_fixtures_dir: Option<PathBuf>,
    pub axonaut_page_size: usize,
    pub notion_api_key: String,
    pub notion_api_base: String,
    pub notion_version: String,
    pub invoices_collection_id: String,
    pub payments_collection_id: String,
    pub dry_run: bool,
    pub http_timeout_secs: u64,
    pub reports_dir: Option<PathBuf>,
    pub sync_cron: String,
    pub user_agent: String,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("axonaut_api_key", &"<redacted>")
            .field("axonaut_api_base", &self.axonaut_api_base)
            .field("axonaut_fixtures_dir", &self.axonaut_fixtures_dir)
            .field("axonaut_page_size", &self.axonaut_page_size)
            .field("notion_api_key", &"<redacted>")
            .field("notion_api_base", &self.notion_api_base)
            .field("notion_version", &self.notion_version)
            .field("invoices_collection_id", &self.invoices_collection_id)
            .field("payments_collection_id", &self.payments_collection_id)
            .field("dry_run", &self.dry_run)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("reports_dir", &self.reports_dir)
            .field("sync_cron", &self.sync_cron)
            .finish()
    }
}

impl SyncConfig {
    /// Reads the process environment. The binary loads `.env` before calling
    /// this, so values from it are already visible here.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let axonaut_fixtures_dir = get("AXONAUT_FIXTURES_DIR").map(PathBuf::from);
        let axonaut_api_key = match get("AXONAUT_API_KEY").or_else(|| get("AXONAUT_CABA_API_KEY")) {
            Some(key) => key,
            None if axonaut_fixtures_dir.is_some() => String::new(),
            None => return Err(ConfigError::Missing("AXONAUT_API_KEY")),
        };
        let notion_api_key = required("NOTION_API_KEY")?;
        let invoices_collection_id = required("NOTION_INVOICES_DB_ID")?;
        let payments_collection_id = required("NOTION_PAYMENTS_DB_ID")?;

        let axonaut_page_size: usize = parse_var(
            "AXONAUT_PAGE_SIZE",
            get("AXONAUT_PAGE_SIZE"),
            ledgersync_adapters::DEFAULT_PAGE_SIZE,
        )?;
        if axonaut_page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "AXONAUT_PAGE_SIZE",
                message: "must be greater than zero".to_string(),
            });
        }
        let http_timeout_secs: u64 = parse_var("HTTP_TIMEOUT_SECS", get("HTTP_TIMEOUT_SECS"), 30)?;
        if http_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "HTTP_TIMEOUT_SECS",
                message: "must be greater than zero".to_string(),
            });
        }
        let dry_run = match get("DRY_RUN") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "DRY_RUN",
                message: format!("expected true/false, got {raw:?}"),
            })?,
            None => false,
        };

        Ok(Self {
            axonaut_api_key,
            axonaut_api_base: get("AXONAUT_API_BASE")
                .unwrap_or_else(|| ledgersync_adapters::DEFAULT_AXONAUT_API_BASE.to_string()),
            axonaut_fixtures_dir,
            axonaut_page_size,
            notion_api_key,
            notion_api_base: get("NOTION_API_BASE")
                .unwrap_or_else(|| ledgersync_storage::DEFAULT_NOTION_API_BASE.to_string()),
            notion_version: get("NOTION_VERSION")
                .unwrap_or_else(|| ledgersync_storage::DEFAULT_NOTION_VERSION.to_string()),
            invoices_collection_id,
            payments_collection_id,
            dry_run,
            http_timeout_secs,
            reports_dir: get("REPORTS_DIR").map(PathBuf::from),
            sync_cron: get("SYNC_CRON").unwrap_or_else(|| "0 */30 * * * *".to_string()),
            user_agent: format!("ledgersync/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    pub fn collection_id(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Invoices => &self.invoices_collection_id,
            EntityKind::Payments => &self.payments_collection_id,
        }
    }
}

fn parse_var<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// A source record that knows its destination property layout.
pub trait MirroredRecord: SourceRecord + Send + Sync {
    fn to_properties(&self) -> Properties;
}

impl MirroredRecord for SourceInvoice {
    fn to_properties(&self) -> Properties {
        map_invoice(self)
    }
}

impl MirroredRecord for SourcePayment {
    fn to_properties(&self) -> Properties {
        map_payment(self)
    }
}

fn plain(value: &Option<String>) -> String {
    value.as_deref().map(str::trim).unwrap_or_default().to_string()
}

fn as_number(value: Option<i64>) -> Option<f64> {
    value.map(|v| v as f64)
}

/// Select option names cannot contain commas; blank names become a null select.
pub fn select_option(value: &Option<String>) -> Option<String> {
    let name = value
        .as_deref()?
        .replace(',', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

pub fn map_invoice(invoice: &SourceInvoice) -> Properties {
    use invoice_fields::*;

    let mut props = Properties::new();
    props.insert(NUMBER.into(), PropertyValue::Title(plain(&invoice.number)));
    props.insert(SOURCE_INVOICE_ID.into(), PropertyValue::Number(as_number(invoice.id)));
    props.insert(AMOUNT_INCL_TAX.into(), PropertyValue::Number(invoice.amount_ttc));
    props.insert(AMOUNT_EXCL_TAX.into(), PropertyValue::Number(invoice.amount_ht));
    props.insert(INVOICE_DATE.into(), PropertyValue::Date(invoice.date));
    props.insert(DUE_DATE.into(), PropertyValue::Date(invoice.due_date));
    props.insert(STATUS.into(), PropertyValue::Select(select_option(&invoice.status)));
    props.insert(
        CLIENT_REFERENCE.into(),
        PropertyValue::RichText(plain(&invoice.client_reference)),
    );
    props
}

pub fn map_payment(payment: &SourcePayment) -> Properties {
    use payment_fields::*;

    let mut props = Properties::new();
    props.insert(REFERENCE.into(), PropertyValue::Title(plain(&payment.reference)));
    props.insert(SOURCE_PAYMENT_ID.into(), PropertyValue::Number(as_number(payment.id)));
    props.insert(
        SOURCE_INVOICE_ID.into(),
        PropertyValue::Number(as_number(payment.invoice_id)),
    );
    props.insert(AMOUNT.into(), PropertyValue::Number(payment.amount));
    props.insert(PAYMENT_DATE.into(), PropertyValue::Date(payment.date));
    props.insert(METHOD.into(), PropertyValue::Select(select_option(&payment.nature)));
    props
}

#[derive(Debug, Error)]
#[error("querying existing {kind} in collection {collection_id} failed: {source}")]
pub struct IndexError {
    pub kind: EntityKind,
    pub collection_id: String,
    #[source]
    pub source: StoreError,
}

/// Snapshot of `natural_key -> database_id` for one destination collection.
#[derive(Debug, Clone)]
pub struct RecordIndex {
    kind: EntityKind,
    entries: HashMap<String, RecordId>,
}

impl RecordIndex {
    pub fn empty(kind: EntityKind) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    /// The first record seen for a key wins; later duplicates are reported and ignored.
    pub fn from_records(kind: EntityKind, records: Vec<DestinationRecord>) -> Self {
        let mut index = Self::empty(kind);
        for record in records {
            match index.entries.get(&record.natural_key) {
                Some(kept) => warn!(
                    entity = %kind,
                    natural_key = %record.natural_key,
                    kept = %kept,
                    ignored = %record.database_id,
                    "destination already holds duplicate records for this key"
                ),
                None => {
                    index.entries.insert(record.natural_key, record.database_id);
                }
            }
        }
        index
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn get(&self, natural_key: &str) -> Option<&RecordId> {
        self.entries.get(natural_key)
    }

    pub fn insert(&mut self, natural_key: impl Into<String>, record_id: RecordId) {
        self.entries.insert(natural_key.into(), record_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub async fn build_index(
    store: &dyn DocumentStore,
    kind: EntityKind,
    collection_id: &str,
) -> Result<RecordIndex, IndexError> {
    let records = store
        .query_records(collection_id, kind.title_property())
        .await
        .map_err(|source| IndexError {
            kind,
            collection_id: collection_id.to_string(),
            source,
        })?;
    Ok(RecordIndex::from_records(kind, records))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Create,
    Update,
}

impl fmt::Display for UpsertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpsertAction::Create => "create",
            UpsertAction::Update => "update",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub natural_key: String,
    pub action: UpsertAction,
    /// `None` only for dry-run creates.
    pub record_id: Option<RecordId>,
    pub dry_run: bool,
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("{kind} record has no natural key (source id {source_id:?})")]
    MissingNaturalKey {
        kind: EntityKind,
        source_id: Option<i64>,
    },
    #[error("{action} failed for {natural_key}: {source}")]
    Store {
        natural_key: String,
        action: UpsertAction,
        #[source]
        source: StoreError,
    },
}

/// Create-if-absent-else-update against one destination collection.
pub struct UpsertEngine<'a> {
    store: &'a dyn DocumentStore,
    collection_id: &'a str,
    dry_run: bool,
}

impl<'a> UpsertEngine<'a> {
    pub fn new(store: &'a dyn DocumentStore, collection_id: &'a str, dry_run: bool) -> Self {
        Self {
            store,
            collection_id,
            dry_run,
        }
    }

    /// Maps and upserts one source record. Failures stay inside the returned `Result`.
    pub async fn sync_record<R: MirroredRecord>(
        &self,
        index: &mut RecordIndex,
        record: &R,
    ) -> Result<UpsertOutcome, UpsertError> {
        let Some(natural_key) = record.natural_key() else {
            let err = UpsertError::MissingNaturalKey {
                kind: R::KIND,
                source_id: record.source_id(),
            };
            error!(entity = %R::KIND, source_id = ?record.source_id(), error = %err, "skipping record");
            return Err(err);
        };
        let properties = record.to_properties();
        let result = self.upsert(index, natural_key, &properties).await;
        match &result {
            Ok(outcome) => info!(
                entity = %R::KIND,
                natural_key,
                source_id = ?record.source_id(),
                action = %outcome.action,
                dry_run = outcome.dry_run,
                "record synced"
            ),
            Err(err) => error!(
                entity = %R::KIND,
                natural_key,
                source_id = ?record.source_id(),
                error = %err,
                "record sync failed"
            ),
        }
        result
    }

    pub async fn upsert(
        &self,
        index: &mut RecordIndex,
        natural_key: &str,
        properties: &Properties,
    ) -> Result<UpsertOutcome, UpsertError> {
        let existing = index.get(natural_key).cloned();
        let action = if existing.is_some() {
            UpsertAction::Update
        } else {
            UpsertAction::Create
        };

        if self.dry_run {
            info!(natural_key, %action, dry_run = true, "dry run: skipping destination write");
            if action == UpsertAction::Create {
                index.insert(natural_key, RecordId::new(format!("dry-run:{natural_key}")));
            }
            return Ok(UpsertOutcome {
                natural_key: natural_key.to_string(),
                action,
                record_id: existing,
                dry_run: true,
            });
        }

        let store_err = |source| UpsertError::Store {
            natural_key: natural_key.to_string(),
            action,
            source,
        };

        let record_id = match existing {
            Some(record_id) => {
                self.store
                    .update_record(&record_id, properties)
                    .await
                    .map_err(store_err)?;
                record_id
            }
            None => {
                let record_id = self
                    .store
                    .create_record(self.collection_id, properties)
                    .await
                    .map_err(store_err)?;
                index.insert(natural_key, record_id.clone());
                record_id
            }
        };

        Ok(UpsertOutcome {
            natural_key: natural_key.to_string(),
            action,
            record_id: Some(record_id),
            dry_run: false,
        })
    }
}

#[derive(Debug, Error)]
pub enum PassError {
    #[error("fetching source records failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub entity: EntityKind,
    pub status: PassStatus,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl PassReport {
    pub fn new(entity: EntityKind) -> Self {
        Self {
            entity,
            status: PassStatus::Completed,
            fetched: 0,
            created: 0,
            updated: 0,
            failed: 0,
            error: None,
        }
    }

    pub fn record(&mut self, result: &Result<UpsertOutcome, UpsertError>) {
        match result {
            Ok(outcome) => match outcome.action {
                UpsertAction::Create => self.created += 1,
                UpsertAction::Update => self.updated += 1,
            },
            Err(_) => self.failed += 1,
        }
    }

    pub fn fold<'r, I>(mut self, results: I) -> Self
    where
        I: IntoIterator<Item = &'r Result<UpsertOutcome, UpsertError>>,
    {
        for result in results {
            self.record(result);
        }
        self
    }

    /// Upstream items that could not be decoded count as fetched and failed.
    pub fn record_undecodable(&mut self, skipped: usize) {
        self.fetched += skipped;
        self.failed += skipped;
    }

    pub fn abort(&mut self, err: &PassError) {
        self.status = PassStatus::Aborted;
        self.error = Some(err.to_string());
    }

    pub fn is_aborted(&self) -> bool {
        self.status == PassStatus::Aborted
    }

    pub fn log_summary(&self) {
        match self.status {
            PassStatus::Completed => info!(
                entity = %self.entity,
                fetched = self.fetched,
                created = self.created,
                updated = self.updated,
                failed = self.failed,
                "pass completed"
            ),
            PassStatus::Aborted => error!(
                entity = %self.entity,
                fetched = self.fetched,
                created = self.created,
                updated = self.updated,
                failed = self.failed,
                error = self.error.as_deref().unwrap_or_default(),
                "pass aborted"
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub passes: Vec<PassReport>,
}

impl RunReport {
    pub fn pass(&self, entity: EntityKind) -> Option<&PassReport> {
        self.passes.iter().find(|p| p.entity == entity)
    }

    /// True when every pass aborted on a fetch or index failure.
    pub fn all_passes_aborted(&self) -> bool {
        !self.passes.is_empty() && self.passes.iter().all(PassReport::is_aborted)
    }

    pub fn total_failed(&self) -> usize {
        self.passes.iter().map(|p| p.failed).sum()
    }

    pub fn log_summary(&self) {
        let sum = |f: fn(&PassReport) -> usize| self.passes.iter().map(f).sum::<usize>();
        info!(
            run_id = %self.run_id,
            dry_run = self.dry_run,
            fetched = sum(|p| p.fetched),
            created = sum(|p| p.created),
            updated = sum(|p| p.updated),
            failed = sum(|p| p.failed),
            aborted_passes = self.passes.iter().filter(|p| p.is_aborted()).count(),
            elapsed_ms = (self.finished_at - self.started_at).num_milliseconds(),
            "sync run finished"
        );
    }
}

/// Writes `<reports_dir>/<run_id>/run_summary.json` and returns its path.
pub async fn write_report(reports_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let path = run_dir.join("run_summary.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn RecordSource>,
    store: Box<dyn DocumentStore>,
}

impl SyncPipeline {
    /// Builds the source and Notion clients described by `config`. The source
    /// reads fixture files instead of the API when `axonaut_fixtures_dir` is set.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let source: Box<dyn RecordSource> = match &config.axonaut_fixtures_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "reading source records from fixture files");
                Box::new(FixtureSource::new(dir.clone()))
            }
            None => Box::new(AxonautSource::new(AxonautConfig {
                base_url: config.axonaut_api_base.clone(),
                api_key: config.axonaut_api_key.clone(),
                page_size: config.axonaut_page_size,
                timeout,
                user_agent: Some(config.user_agent.clone()),
            })?),
        };
        let store = NotionStore::new(NotionConfig {
            base_url: config.notion_api_base.clone(),
            api_key: config.notion_api_key.clone(),
            notion_version: config.notion_version.clone(),
            timeout,
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self::with_clients(config, source, Box::new(store)))
    }

    pub fn with_clients(
        config: SyncConfig,
        source: Box<dyn RecordSource>,
        store: Box<dyn DocumentStore>,
    ) -> Self {
        Self {
            config,
            source,
            store,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs the invoice pass, then the payment pass. Never fails as a whole:
    /// pass-level failures are recorded in the returned report.
    pub async fn run_once(&self) -> RunReport {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);

        async {
            info!(
                source = self.source.source_id(),
                dry_run = self.config.dry_run,
                "starting sync run"
            );
            if self.config.dry_run {
                warn!("dry run enabled: no destination record will be created or updated");
            }

            let invoices = self.run_pass(self.source.fetch_invoices().await).await;
            let payments = self.run_pass(self.source.fetch_payments().await).await;

            let report = RunReport {
                run_id,
                started_at,
                finished_at: Utc::now(),
                dry_run: self.config.dry_run,
                passes: vec![invoices, payments],
            };
            report.log_summary();
            report
        }
        .instrument(span)
        .await
    }

    async fn run_pass<R: MirroredRecord>(
        &self,
        fetched: Result<Fetched<R>, FetchError>,
    ) -> PassReport {
        let kind = R::KIND;
        let span = info_span!("sync_pass", entity = %kind);

        async {
            let mut report = PassReport::new(kind);

            let records = match fetched {
                Ok(fetched) => {
                    report.record_undecodable(fetched.skipped);
                    fetched.records
                }
                Err(err) => {
                    report.abort(&PassError::from(err));
                    report.log_summary();
                    return report;
                }
            };
            report.fetched += records.len();
            info!(count = records.len(), undecodable = report.failed, "fetched source records");

            let collection_id = self.config.collection_id(kind);
            let mut index = match build_index(self.store.as_ref(), kind, collection_id).await {
                Ok(index) => index,
                Err(err) => {
                    report.abort(&PassError::from(err));
                    report.log_summary();
                    return report;
                }
            };
            info!(existing = index.len(), "built existing-record index");

            let engine = UpsertEngine::new(self.store.as_ref(), collection_id, self.config.dry_run);
            let mut results = Vec::with_capacity(records.len());
            for record in &records {
                results.push(engine.sync_record(&mut index, record).await);
            }

            let report = report.fold(&results);
            report.log_summary();
            report
        }
        .instrument(span)
        .await
    }

    /// Best-effort: a report that cannot be written is logged, not propagated.
    pub async fn persist_report(&self, report: &RunReport) -> Option<PathBuf> {
        let dir = self.config.reports_dir.as_deref()?;
        match write_report(dir, report).await {
            Ok(path) => {
                info!(path = %path.display(), "wrote run report");
                Some(path)
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to write run report");
                None
            }
        }
    }
}

/// One scheduled tick: runs and persists a sync unless `running` is already
/// held, in which case the tick is skipped and `None` is returned.
pub async fn run_guarded(pipeline: &SyncPipeline, running: &Mutex<()>) -> Option<RunReport> {
    let Ok(_guard) = running.try_lock() else {
        warn!("previous sync run still in progress; skipping scheduled tick");
        return None;
    };
    let report = pipeline.run_once().await;
    pipeline.persist_report(&report).await;
    Some(report)
}

/// Cron scheduler running `pipeline` on `config.sync_cron`. A tick that fires
/// while a run is still in progress is skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let running = Arc::new(Mutex::new(()));

    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let running = running.clone();
        Box::pin(async move {
            run_guarded(&pipeline, &running).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
