//! The write path: validates rows, routes them to a partition queue and
//! flushes queues when they fill up.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde_json::{Map, Value};

use crate::batch_key::{Action, BatchKey, COLUMN_SEPARATOR};
use crate::config::SenderConfig;
use crate::flusher::{FlushReason, Flusher};
use crate::metadata::{DataSourceMetadata, DataSourceSpec};
use crate::nats_connection::NatsIndexClient;
use crate::partition::{HashPartitioner, PartitionRouter, PartitionSource, checked_partition_count};
use crate::pending_cache::{DrainSummary, PendingCache};
use crate::registry::SenderRegistry;
use crate::scheduler::FlushScheduler;
use crate::writer::Transport;
use crate::{IndexSenderError, Result};

/// External collaborators a sender talks to.
#[derive(Clone)]
pub struct IndexBackend {
    pub metadata: Arc<dyn DataSourceMetadata>,
    pub partitions: Arc<dyn PartitionSource>,
    pub transport: Arc<dyn Transport>,
    pub router: Arc<dyn PartitionRouter>,
}

impl IndexBackend {
    /// Backend routing primary values with [`HashPartitioner`].
    pub fn new(
        metadata: Arc<dyn DataSourceMetadata>,
        partitions: Arc<dyn PartitionSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            metadata,
            partitions,
            transport,
            router: Arc::new(HashPartitioner),
        }
    }

    pub fn with_router(mut self, router: Arc<dyn PartitionRouter>) -> Self {
        self.router = router;
        self
    }
}

/// Point-in-time view of a sender's queues and delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub queues: usize,
    pub pending_rows: usize,
    pub batches_sent: u64,
    pub rows_sent: u64,
    pub failed_flushes: u64,
}

/// Batches add/update/delete rows per partition and sends them to the
/// index service.
///
/// All operations block. A write that fills its queue sends the whole queue
/// before returning, and a delivery failure is returned to that caller with
/// the rows still queued. A background thread flushes queues that have
/// waited longer than the configured staleness bound.
pub struct DataSender {
    data_source: String,
    config: SenderConfig,
    metadata: Arc<dyn DataSourceMetadata>,
    partitions: Arc<dyn PartitionSource>,
    router: Arc<dyn PartitionRouter>,
    cache: Arc<PendingCache>,
    flusher: Arc<Flusher>,
    scheduler: Mutex<Option<FlushScheduler>>,
    closed: AtomicBool,
    // Writers hold it shared from the open check until their row is queued.
    write_gate: RwLock<()>,
}

impl DataSender {
    pub fn new(
        data_source: impl Into<String>,
        config: SenderConfig,
        backend: IndexBackend,
    ) -> Result<Self> {
        config.validate()?;
        let data_source = data_source.into();
        if data_source.is_empty() {
            return Err(IndexSenderError::Configuration(
                "data source can not be empty".to_string(),
            ));
        }

        let cache = Arc::new(PendingCache::new());
        let flusher = Arc::new(Flusher::new(data_source.clone(), backend.transport));
        let scheduler = FlushScheduler::start(cache.clone(), flusher.clone(), &config)?;

        tracing::info!(
            data_source = %data_source,
            add_threshold = config.add_threshold,
            update_threshold = config.update_threshold,
            "data sender started"
        );

        Ok(Self {
            data_source,
            config,
            metadata: backend.metadata,
            partitions: backend.partitions,
            router: backend.router,
            cache,
            flusher,
            scheduler: Mutex::new(Some(scheduler)),
            closed: AtomicBool::new(false),
            write_gate: RwLock::new(()),
        })
    }

    pub fn builder() -> SenderBuilder {
        SenderBuilder::default()
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Add a single row whose values are joined with the data source
    /// delimiter, e.g. `1001|Nicolas|male|18`.
    ///
    /// Values must follow the column order of the data source.
    pub fn add_row(&self, row: &str) -> Result<()> {
        let _open = self.open_for_write()?;
        if row.is_empty() {
            return Err(IndexSenderError::NullInput("row can not be null"));
        }
        let spec = self.spec()?;
        let values: Vec<&str> = row.split(spec.delimiter()).collect();
        check_value_count(&spec, values.len())?;

        let partition = self.route(values[spec.primary_column_index()])?;
        self.enqueue(BatchKey::add(partition), row.to_string())
    }

    /// Add a single row given as already split values, e.g.
    /// `["1003", "Ming", "male", 22]`. `null` values are sent empty.
    pub fn add_values(&self, values: &[Value]) -> Result<()> {
        let _open = self.open_for_write()?;
        if values.is_empty() {
            return Err(IndexSenderError::NullInput("column values can not be null"));
        }
        let spec = self.spec()?;
        check_value_count(&spec, values.len())?;

        let primary = &values[spec.primary_column_index()];
        if primary.is_null() {
            return Err(IndexSenderError::NullInput("primary value can not be null"));
        }
        let partition = self.route(&field_text(primary))?;
        self.enqueue(BatchKey::add(partition), join_values(values, spec.delimiter()))
    }

    /// Update an existing row, e.g. `{"id": "1001", "age": 20}`.
    ///
    /// Columns are sorted by name, so the same column set always lands in
    /// the same queue whatever order the map was built in.
    pub fn update(&self, row: &Map<String, Value>) -> Result<()> {
        let _open = self.open_for_write()?;
        if row.is_empty() {
            return Err(IndexSenderError::NullInput("row can not be null"));
        }
        let spec = self.spec()?;
        let primary_column = spec.primary_column_name();
        let primary = row.get(primary_column).ok_or_else(|| {
            IndexSenderError::Validation(format!(
                "row must contain primary column: {}",
                primary_column
            ))
        })?;
        if primary.is_null() {
            return Err(IndexSenderError::NullInput("primary value can not be null"));
        }
        check_known_columns(&spec, row.keys().map(String::as_str))?;

        let sorted: BTreeMap<&str, &Value> = row.iter().map(|(k, v)| (k.as_str(), v)).collect();
        let columns = sorted.keys().copied().collect::<Vec<_>>().join(COLUMN_SEPARATOR);
        let values = sorted
            .values()
            .map(|v| field_text(v))
            .collect::<Vec<_>>()
            .join(spec.delimiter());

        let partition = self.route(&field_text(primary))?;
        self.enqueue(BatchKey::update(columns, partition), values)
    }

    /// Update an existing row given as parallel column and value lists.
    ///
    /// Unlike [`DataSender::update`] the columns are kept in the order
    /// given; `["id", "age"]` and `["age", "id"]` are different queues.
    pub fn update_columns<S: AsRef<str>>(&self, columns: &[S], values: &[Value]) -> Result<()> {
        let _open = self.open_for_write()?;
        if columns.is_empty() {
            return Err(IndexSenderError::NullInput("columns can not be null"));
        }
        if values.is_empty() {
            return Err(IndexSenderError::NullInput("values can not be null"));
        }
        if columns.len() != values.len() {
            return Err(IndexSenderError::Validation(format!(
                "columns and values size not matched: {} columns, {} values",
                columns.len(),
                values.len()
            )));
        }
        let spec = self.spec()?;
        let primary_column = spec.primary_column_name();
        let primary_pos = columns
            .iter()
            .position(|c| c.as_ref() == primary_column)
            .ok_or_else(|| {
                IndexSenderError::Validation(format!(
                    "columns must contain primary column: {}",
                    primary_column
                ))
            })?;
        let primary = &values[primary_pos];
        if primary.is_null() {
            return Err(IndexSenderError::NullInput("primary value can not be null"));
        }
        check_known_columns(&spec, columns.iter().map(|c| c.as_ref()))?;

        let signature = columns
            .iter()
            .map(|c| c.as_ref())
            .collect::<Vec<_>>()
            .join(COLUMN_SEPARATOR);
        let partition = self.route(&field_text(primary))?;
        self.enqueue(
            BatchKey::update(signature, partition),
            join_values(values, spec.delimiter()),
        )
    }

    /// Delete the row with the given primary value.
    pub fn delete(&self, primary_value: &str) -> Result<()> {
        let _open = self.open_for_write()?;
        if primary_value.is_empty() {
            return Err(IndexSenderError::NullInput("primary value can not be null"));
        }
        let partition = self.route(primary_value)?;
        self.enqueue(BatchKey::delete(partition), primary_value.to_string())
    }

    /// Delete several rows, queued in the order given.
    ///
    /// Stops at the first failing value; earlier values stay queued.
    pub fn delete_all<S: AsRef<str>>(&self, primary_values: &[S]) -> Result<()> {
        if primary_values.is_empty() {
            return Err(IndexSenderError::NullInput("primary values can not be null"));
        }
        for primary_value in primary_values {
            self.delete(primary_value.as_ref())?;
        }
        Ok(())
    }

    /// Send every pending queue now.
    ///
    /// Every queue is attempted; the first delivery error is returned after
    /// the others were tried. Failed queues keep their rows.
    pub fn flush(&self) -> Result<DrainSummary> {
        self.ensure_open()?;
        let drained = self.cache.drain(&self.flusher, FlushReason::Manual);
        match drained.first_error {
            Some(e) => Err(e),
            None => Ok(drained.summary),
        }
    }

    /// Send everything still pending, then stop the flush thread.
    ///
    /// Waits for writes already in progress to queue their row, so every
    /// write that returned `Ok` is part of the drain. Delivery failures are
    /// logged, not returned. Calling `close` again does nothing; writes after
    /// `close` fail with [`IndexSenderError::Closed`].
    pub fn close(&self) -> DrainSummary {
        {
            let _gate = self.write_gate.write();
            if self.closed.swap(true, Ordering::SeqCst) {
                return DrainSummary::default();
            }
        }

        let drained = self.cache.drain(&self.flusher, FlushReason::Shutdown);
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }

        tracing::info!(
            data_source = %self.data_source,
            flushed = drained.summary.flushed,
            failed = drained.summary.failed,
            "data sender closed"
        );
        drained.summary
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SenderStats {
        let counters = self.flusher.counters();
        SenderStats {
            queues: self.cache.len(),
            pending_rows: self.cache.pending_rows(),
            batches_sent: counters.batches_sent.load(Ordering::Relaxed),
            rows_sent: counters.rows_sent.load(Ordering::Relaxed),
            failed_flushes: counters.failed_flushes.load(Ordering::Relaxed),
        }
    }

    /// Rows currently queued under `key`.
    pub fn pending(&self, key: &BatchKey) -> Vec<String> {
        self.cache.pending(key)
    }

    /// `true` while the background flush thread is alive.
    pub(crate) fn scheduler_running(&self) -> bool {
        self.scheduler
            .lock()
            .as_ref()
            .is_some_and(FlushScheduler::is_running)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(IndexSenderError::Closed);
        }
        Ok(())
    }

    fn open_for_write(&self) -> Result<RwLockReadGuard<'_, ()>> {
        let gate = self.write_gate.read();
        self.ensure_open()?;
        Ok(gate)
    }

    fn spec(&self) -> Result<DataSourceSpec> {
        self.metadata.spec().map_err(|e| as_configuration("metadata lookup", e))
    }

    fn route(&self, primary_value: &str) -> Result<u32> {
        let count = checked_partition_count(self.partitions.as_ref())
            .map_err(|e| as_configuration("partition lookup", e))?;
        Ok(self.router.partition(primary_value, count))
    }

    fn threshold(&self, action: Action) -> usize {
        match action {
            Action::Update => self.config.update_threshold,
            Action::Add | Action::Delete => self.config.add_threshold,
        }
    }

    fn enqueue(&self, key: BatchKey, payload: String) -> Result<()> {
        let threshold = self.threshold(key.action());
        self.cache.append(&key, payload, threshold, &self.flusher)?;
        Ok(())
    }
}

impl Drop for DataSender {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
    }
}

fn as_configuration(what: &str, e: IndexSenderError) -> IndexSenderError {
    match e {
        IndexSenderError::Configuration(_) => e,
        other => IndexSenderError::Configuration(format!("{} failed: {}", what, other)),
    }
}

fn check_value_count(spec: &DataSourceSpec, actual: usize) -> Result<()> {
    let expected = spec.columns().len();
    if actual < expected {
        return Err(IndexSenderError::Validation(format!(
            "Column values size not matched, expected: {}, but actually: {}",
            expected, actual
        )));
    }
    Ok(())
}

fn check_known_columns<'a>(
    spec: &DataSourceSpec,
    columns: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    for column in columns {
        if !spec.columns().iter().any(|c| c == column) {
            return Err(IndexSenderError::Validation(format!(
                "unknown column {} for data source",
                column
            )));
        }
    }
    Ok(())
}

/// Text form of one value: strings as-is, `null` as empty, everything else
/// as its JSON text.
pub(crate) fn field_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn join_values(values: &[Value], delimiter: &str) -> String {
    values.iter().map(field_text).collect::<Vec<_>>().join(delimiter)
}

/// Builds a [`DataSender`] for one server and data source.
#[derive(Debug, Default, Clone)]
pub struct SenderBuilder {
    server: Option<String>,
    data_source: Option<String>,
    add_threshold: Option<usize>,
    update_threshold: Option<usize>,
    flush_period: Option<Duration>,
    max_staleness: Option<Duration>,
}

impl SenderBuilder {
    /// Address of the index service, e.g. `nats://localhost:4222/uindex`
    pub fn to_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn of_data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = Some(data_source.into());
        self
    }

    /// Batch size for add and delete queues, 100 unless set
    pub fn add_threshold(mut self, threshold: usize) -> Self {
        self.add_threshold = Some(threshold);
        self
    }

    /// Batch size for update queues, required
    pub fn update_threshold(mut self, threshold: usize) -> Self {
        self.update_threshold = Some(threshold);
        self
    }

    pub fn flush_period(mut self, period: Duration) -> Self {
        self.flush_period = Some(period);
        self
    }

    pub fn max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = Some(max_staleness);
        self
    }

    /// Effective configuration of the sender to build.
    pub fn config(&self) -> Result<SenderConfig> {
        let update_threshold = self.update_threshold.ok_or_else(|| {
            IndexSenderError::Configuration("update threshold must be set".to_string())
        })?;
        let mut config = SenderConfig::builder().update_threshold(update_threshold).build();
        if let Some(add_threshold) = self.add_threshold {
            config.add_threshold = add_threshold;
        }
        if let Some(period) = self.flush_period {
            config.flush_period = period;
        }
        if let Some(max_staleness) = self.max_staleness {
            config.max_staleness = max_staleness;
        }
        config.validate()?;
        Ok(config)
    }

    /// The shared NATS-backed sender for this server and data source,
    /// connecting on first use.
    pub fn build(self, registry: &SenderRegistry) -> Result<Arc<DataSender>> {
        let server = self
            .server
            .clone()
            .ok_or_else(|| IndexSenderError::Configuration("server can not be null".to_string()))?;
        let data_source = self.data_source()?;
        let config = self.config()?;

        registry.get_or_try_insert_with(&server, &data_source, || {
            let client = NatsIndexClient::connect(&server, &data_source)?;
            DataSender::new(data_source.clone(), config, client.backend())
        })
    }

    /// An unshared sender over caller-supplied collaborators.
    pub fn build_with(self, backend: IndexBackend) -> Result<DataSender> {
        let data_source = self.data_source()?;
        DataSender::new(data_source, self.config()?, backend)
    }

    fn data_source(&self) -> Result<String> {
        self.data_source.clone().ok_or_else(|| {
            IndexSenderError::Configuration("data source can not be null".to_string())
        })
    }
}
