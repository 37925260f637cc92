//! NATS-backed index service client.
//!
//! The sender is blocking, so the client owns a small tokio runtime and
//! drives every request to completion on it. It must not be used, or
//! dropped, from inside another tokio runtime.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_nats::{Client, ConnectOptions};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::runtime::Runtime;
use url::Url;

use crate::batch_key::Action;
use crate::config::IndexUrl;
use crate::metadata::{DataSourceMetadata, DataSourceSpec, SpecMessage};
use crate::partition::PartitionSource;
use crate::record::BatchRecord;
use crate::sender::IndexBackend;
use crate::writer::Transport;
use crate::{IndexSenderError, Result};

/// Timeout of a single request to the index service.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a fetched partition count is reused before asking again.
pub const PARTITION_COUNT_REFRESH: Duration = Duration::from_secs(1);

pub async fn connect(nats_url: &str, request_timeout: Duration) -> Result<Client> {
    let nc = ConnectOptions::new()
        .request_timeout(Some(request_timeout))
        .connect(nats_url)
        .await
        .map_err(|e| IndexSenderError::Nats(Box::new(e)))?;
    Ok(nc)
}

/// Subject layout of one data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    base: String,
}

impl Subjects {
    pub fn new(prefix: Option<&str>, data_source: &str) -> Self {
        let base = match prefix {
            Some(prefix) => format!("{}.{}", prefix, data_source),
            None => data_source.to_string(),
        };
        Self { base }
    }

    pub fn spec(&self) -> String {
        format!("{}.spec", self.base)
    }

    pub fn partitions(&self) -> String {
        format!("{}.partitions", self.base)
    }

    pub fn batch(&self, action: Action, partition: u32) -> String {
        format!("{}.{}.{}", self.base, action, partition)
    }
}

/// Reply of the index service to a batch.
#[derive(Debug, Deserialize)]
struct Ack {
    accepted: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Last partition count and when it was fetched.
///
/// Failed fetches are not cached. The lock is held during a fetch so
/// concurrent writers wait for one request.
#[derive(Debug)]
struct PartitionCountCache {
    refresh: Duration,
    cached: Mutex<Option<(u32, Instant)>>,
}

impl PartitionCountCache {
    fn new(refresh: Duration) -> Self {
        Self {
            refresh,
            cached: Mutex::new(None),
        }
    }

    fn get_or_fetch(&self, now: Instant, fetch: impl FnOnce() -> Result<u32>) -> Result<u32> {
        let mut cached = self.cached.lock();
        if let Some((count, fetched_at)) = *cached {
            if now.saturating_duration_since(fetched_at) < self.refresh {
                return Ok(count);
            }
        }
        let count = fetch()?;
        if matches!(*cached, Some((previous, _)) if previous != count) {
            tracing::info!(partitions = count, "partition count changed");
        }
        *cached = Some((count, now));
        Ok(count)
    }
}

/// Parse a server address, defaulting the scheme to `nats://`.
pub fn parse_server(server: &str) -> Result<Url> {
    let server = server.trim();
    if server.contains("://") {
        Ok(Url::parse(server)?)
    } else {
        Ok(Url::parse(&format!("nats://{}", server))?)
    }
}

/// Metadata, partition count and batch delivery over NATS request/reply.
pub struct NatsIndexClient {
    runtime: Runtime,
    client: Client,
    subjects: Subjects,
    spec: OnceLock<DataSourceSpec>,
    partitions: PartitionCountCache,
}

impl NatsIndexClient {
    pub fn connect(server: &str, data_source: &str) -> Result<Arc<Self>> {
        Self::connect_with_timeout(server, data_source, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn connect_with_timeout(
        server: &str,
        data_source: &str,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let url = parse_server(server)?;
        let servers = url.index_servers();
        let subjects = Subjects::new(url.subject_prefix().as_deref(), data_source);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("index-sender-nats")
            .enable_all()
            .build()?;
        let client = runtime.block_on(connect(&servers, request_timeout))?;
        tracing::info!(servers = %servers, data_source, "connected to index service");

        Ok(Arc::new(Self {
            runtime,
            client,
            subjects,
            spec: OnceLock::new(),
            partitions: PartitionCountCache::new(PARTITION_COUNT_REFRESH),
        }))
    }

    /// All three collaborators of a sender, backed by this client.
    pub fn backend(self: &Arc<Self>) -> IndexBackend {
        IndexBackend::new(self.clone(), self.clone(), self.clone())
    }

    fn request(&self, subject: String, payload: Vec<u8>) -> Result<Vec<u8>> {
        let message = self
            .runtime
            .block_on(self.client.request(subject, payload.into()))
            .map_err(|e| IndexSenderError::Nats(Box::new(e)))?;
        Ok(message.payload.to_vec())
    }
}

impl DataSourceMetadata for NatsIndexClient {
    fn spec(&self) -> Result<DataSourceSpec> {
        if let Some(spec) = self.spec.get() {
            return Ok(spec.clone());
        }
        let reply = self.request(self.subjects.spec(), Vec::new())?;
        let message: SpecMessage = serde_json::from_slice(&reply)?;
        let spec = DataSourceSpec::try_from(message)?;
        tracing::debug!(columns = ?spec.columns(), "loaded data source spec");
        // A concurrent load may have won; both hold the same layout.
        let _ = self.spec.set(spec.clone());
        Ok(spec)
    }
}

impl PartitionSource for NatsIndexClient {
    fn partition_count(&self) -> Result<u32> {
        self.partitions.get_or_fetch(Instant::now(), || {
            let reply = self.request(self.subjects.partitions(), Vec::new())?;
            parse_partition_count(&reply)
        })
    }
}

fn parse_partition_count(reply: &[u8]) -> Result<u32> {
    let text = String::from_utf8_lossy(reply);
    text.trim().parse::<u32>().map_err(|e| {
        IndexSenderError::Configuration(format!("invalid partition count {:?}: {}", text, e))
    })
}

impl Transport for NatsIndexClient {
    fn send(&self, record: &BatchRecord) -> Result<()> {
        let payload = serde_json::to_vec(record)?;
        let reply = self.request(self.subjects.batch(record.action, record.partition), payload)?;
        let ack: Ack = serde_json::from_slice(&reply)?;
        if ack.accepted {
            Ok(())
        } else {
            Err(IndexSenderError::Transport(
                ack.error.unwrap_or_else(|| "batch rejected by index service".to_string()),
            ))
        }
    }
}
