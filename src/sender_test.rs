use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Map, Value, json};

use crate::batch_key::{Action, BatchKey};
use crate::metadata::{DataSourceMetadata, DataSourceSpec};
use crate::partition::{FixedPartitions, PartitionRouter, PartitionSource};
use crate::sender::{DataSender, IndexBackend};
use crate::writer::MemoryTransport;
use crate::{IndexSenderError, Result};

/// Routes known primary values to fixed partitions, everything else to 0.
struct MapRouter(HashMap<&'static str, u32>);

impl PartitionRouter for MapRouter {
    fn partition(&self, primary_value: &str, _partition_count: u32) -> u32 {
        self.0.get(primary_value).copied().unwrap_or(0)
    }
}

struct FailingMetadata;

impl DataSourceMetadata for FailingMetadata {
    fn spec(&self) -> Result<DataSourceSpec> {
        Err(IndexSenderError::Transport("metadata service unreachable".into()))
    }
}

/// Partition count that can change between writes.
struct MovingPartitions(AtomicU32);

impl PartitionSource for MovingPartitions {
    fn partition_count(&self) -> Result<u32> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

fn users_spec() -> DataSourceSpec {
    DataSourceSpec::new(
        "|",
        vec!["id".into(), "name".into(), "gender".into(), "age".into()],
        "id",
    )
    .unwrap()
}

fn router() -> Arc<MapRouter> {
    Arc::new(MapRouter(HashMap::from([("1001", 2), ("1002", 0), ("1003", 2)])))
}

fn backend(transport: Arc<MemoryTransport>) -> IndexBackend {
    IndexBackend::new(Arc::new(users_spec()), Arc::new(FixedPartitions(4)), transport)
        .with_router(router())
}

fn sender_with(transport: Arc<MemoryTransport>, add: usize, update: usize) -> DataSender {
    DataSender::builder()
        .of_data_source("users")
        .add_threshold(add)
        .update_threshold(update)
        .max_staleness(Duration::from_secs(3600))
        .build_with(backend(transport))
        .unwrap()
}

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[test]
fn test_adds_group_by_partition_below_threshold() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 3, 10);

    sender.add_row("1001|Nicolas|male|18").unwrap();
    sender.add_row("1002|Ada|female|30").unwrap();
    sender
        .add_values(&[json!("1003"), json!("Ming"), json!("male"), json!(22)])
        .unwrap();

    assert_eq!(transport.batch_count(), 0);
    assert_eq!(
        sender.pending(&BatchKey::add(2)),
        vec!["1001|Nicolas|male|18", "1003|Ming|male|22"]
    );
    assert_eq!(sender.pending(&BatchKey::add(0)), vec!["1002|Ada|female|30"]);
}

#[test]
fn test_add_threshold_flushes_queue() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 2, 10);

    sender.add_row("1001|Nicolas|male|18").unwrap();
    sender.add_row("1003|Ming|male|22").unwrap();

    let sent = transport.sent_for(Action::Add, 2);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data_source, "users");
    assert_eq!(sent[0].payloads, vec!["1001|Nicolas|male|18", "1003|Ming|male|22"]);
    assert!(sender.pending(&BatchKey::add(2)).is_empty());
}

#[test]
fn test_update_maps_share_sorted_signature() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 3, 10);

    sender.update(&object(json!({"id": "1001", "age": 20}))).unwrap();
    sender.update(&object(json!({"age": 25, "id": "1001"}))).unwrap();

    let key = BatchKey::update("age,id", 2);
    assert_eq!(sender.pending(&key), vec!["20|1001", "25|1001"]);
    assert_eq!(sender.stats().queues, 1);
}

#[test]
fn test_update_columns_keep_given_order() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 3, 10);

    sender.update_columns(&["id", "age"], &[json!("1001"), json!(20)]).unwrap();
    sender.update_columns(&["age", "id"], &[json!(21), json!("1001")]).unwrap();

    assert_eq!(sender.pending(&BatchKey::update("id,age", 2)), vec!["1001|20"]);
    assert_eq!(sender.pending(&BatchKey::update("age,id", 2)), vec!["21|1001"]);
}

#[test]
fn test_update_threshold_applies_to_update_queues() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 100, 2);

    sender.update(&object(json!({"id": "1002", "name": "Ada"}))).unwrap();
    sender.update(&object(json!({"id": "1002", "name": "Ada L."}))).unwrap();

    let sent = transport.sent_for(Action::Update, 0);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].columns, Some(vec!["id".to_string(), "name".to_string()]));
    assert_eq!(sent[0].payloads, vec!["1002|Ada", "1002|Ada L."]);
}

#[test]
fn test_delete_all_keeps_order() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = DataSender::builder()
        .of_data_source("users")
        .update_threshold(10)
        .build_with(
            IndexBackend::new(Arc::new(users_spec()), Arc::new(FixedPartitions(4)), transport)
                .with_router(Arc::new(MapRouter(HashMap::from([("1001", 1), ("1002", 1)])))),
        )
        .unwrap();

    sender.delete_all(&["1001", "1002"]).unwrap();
    assert_eq!(sender.pending(&BatchKey::delete(1)), vec!["1001", "1002"]);
}

#[test]
fn test_invalid_input_is_rejected() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 3, 10);

    let err = sender.add_row("1001|Nicolas").unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("expected: 4, but actually: 2"));

    assert!(matches!(sender.add_row(""), Err(IndexSenderError::NullInput(_))));
    assert!(matches!(sender.add_values(&[]), Err(IndexSenderError::NullInput(_))));
    assert!(matches!(
        sender.add_values(&[Value::Null, json!("a"), json!("b"), json!(1)]),
        Err(IndexSenderError::NullInput(_))
    ));
    assert!(matches!(
        sender.update(&object(json!({"age": 20}))),
        Err(IndexSenderError::Validation(_))
    ));
    assert!(matches!(
        sender.update(&object(json!({"id": "1001", "height": 180}))),
        Err(IndexSenderError::Validation(_))
    ));
    assert!(matches!(
        sender.update_columns(&["id", "age"], &[json!("1001")]),
        Err(IndexSenderError::Validation(_))
    ));
    assert!(matches!(sender.delete(""), Err(IndexSenderError::NullInput(_))));
    assert!(matches!(
        sender.delete_all::<&str>(&[]),
        Err(IndexSenderError::NullInput(_))
    ));

    assert_eq!(sender.stats().pending_rows, 0);
}

#[test]
fn test_null_values_are_sent_empty() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 3, 10);

    sender
        .add_values(&[json!("1002"), Value::Null, json!("female"), json!(30)])
        .unwrap();
    assert_eq!(sender.pending(&BatchKey::add(0)), vec!["1002||female|30"]);
}

#[test]
fn test_metadata_failure_is_configuration_error() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = DataSender::builder()
        .of_data_source("users")
        .update_threshold(10)
        .build_with(IndexBackend::new(
            Arc::new(FailingMetadata),
            Arc::new(FixedPartitions(4)),
            transport,
        ))
        .unwrap();

    let err = sender.add_row("1001|Nicolas|male|18").unwrap_err();
    assert!(matches!(err, IndexSenderError::Configuration(_)));
    assert!(err.to_string().contains("metadata service unreachable"));
}

#[test]
fn test_zero_partitions_is_configuration_error() {
    let transport = Arc::new(MemoryTransport::new());
    let partitions = Arc::new(MovingPartitions(AtomicU32::new(0)));
    let sender = DataSender::builder()
        .of_data_source("users")
        .update_threshold(10)
        .build_with(IndexBackend::new(
            Arc::new(users_spec()),
            partitions.clone(),
            transport,
        ))
        .unwrap();

    assert!(matches!(
        sender.delete("1001"),
        Err(IndexSenderError::Configuration(_))
    ));

    // Picked up on the next write
    partitions.0.store(1, Ordering::SeqCst);
    sender.delete("1001").unwrap();
    assert_eq!(sender.pending(&BatchKey::delete(0)), vec!["1001"]);
}

#[test]
fn test_transport_failure_reaches_writer_and_keeps_rows() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 2, 10);
    transport.fail_next(1);

    sender.delete("1001").unwrap();
    let err = sender.delete("1003").unwrap_err();
    assert!(err.is_transport());
    assert_eq!(sender.pending(&BatchKey::delete(2)), vec!["1001", "1003"]);

    // Next write retries with the whole queue
    sender.delete("1003").unwrap();
    let sent = transport.sent_for(Action::Delete, 2);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payloads, vec!["1001", "1003", "1003"]);

    let stats = sender.stats();
    assert_eq!(stats.failed_flushes, 1);
    assert_eq!(stats.batches_sent, 1);
    assert_eq!(stats.rows_sent, 3);
}

#[test]
fn test_manual_flush_sends_every_queue() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 100, 100);

    sender.add_row("1001|Nicolas|male|18").unwrap();
    sender.add_row("1002|Ada|female|30").unwrap();
    sender.delete("1003").unwrap();

    let summary = sender.flush().unwrap();
    assert_eq!(summary.flushed, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(transport.row_count(), 3);
    assert_eq!(sender.stats().pending_rows, 0);

    // Nothing left to send
    assert_eq!(sender.flush().unwrap().flushed, 0);
}

#[test]
fn test_manual_flush_reports_first_error() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 100, 100);

    sender.add_row("1001|Nicolas|male|18").unwrap();
    sender.add_row("1002|Ada|female|30").unwrap();
    transport.fail_next(1);

    assert!(sender.flush().unwrap_err().is_transport());
    assert_eq!(transport.batch_count(), 1);
    assert_eq!(sender.stats().pending_rows, 1);
}

#[test]
fn test_close_drains_each_key_once() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 100, 100);

    sender.add_row("1001|Nicolas|male|18").unwrap();
    sender.add_row("1003|Ming|male|22").unwrap();
    sender.add_row("1002|Ada|female|30").unwrap();
    sender.update(&object(json!({"id": "1001", "age": 20}))).unwrap();
    sender.delete("1002").unwrap();
    assert!(sender.scheduler_running());

    let summary = sender.close();
    assert_eq!(summary.flushed, 4);
    assert_eq!(summary.failed, 0);
    assert!(sender.is_closed());
    assert!(!sender.scheduler_running());

    assert_eq!(transport.batch_count(), 4);
    assert_eq!(transport.row_count(), 5);
    assert_eq!(transport.sent_for(Action::Add, 2)[0].payloads.len(), 2);

    // Idempotent
    assert_eq!(sender.close().flushed, 0);
    assert_eq!(transport.batch_count(), 4);
}

#[test]
fn test_writes_after_close_fail() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 100, 100);
    sender.close();

    assert!(matches!(
        sender.add_row("1001|Nicolas|male|18"),
        Err(IndexSenderError::Closed)
    ));
    assert!(matches!(sender.delete("1001"), Err(IndexSenderError::Closed)));
    assert!(matches!(sender.flush(), Err(IndexSenderError::Closed)));
    assert_eq!(transport.batch_count(), 0);
}

#[test]
fn test_close_racing_writers_loses_no_accepted_row() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = Arc::new(sender_with(transport.clone(), 5, 5));

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let sender = sender.clone();
            std::thread::spawn(move || {
                let mut accepted = 0;
                for i in 0..10_000 {
                    match sender.delete(&format!("{}-{}", t, i)) {
                        Ok(()) => accepted += 1,
                        Err(IndexSenderError::Closed) => break,
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
                accepted
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(5));
    sender.close();
    let accepted: usize = writers.into_iter().map(|w| w.join().unwrap()).sum();

    assert_eq!(transport.row_count(), accepted);
    assert_eq!(sender.stats().pending_rows, 0);
}

#[test]
fn test_close_logs_failed_queue_and_continues() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = sender_with(transport.clone(), 100, 100);

    sender.add_row("1001|Nicolas|male|18").unwrap();
    sender.add_row("1002|Ada|female|30").unwrap();
    transport.fail_next(1);

    let summary = sender.close();
    assert_eq!(summary.flushed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(transport.batch_count(), 1);
}

#[test]
fn test_drop_sends_pending_rows() {
    let transport = Arc::new(MemoryTransport::new());
    {
        let sender = sender_with(transport.clone(), 100, 100);
        sender.delete("1001").unwrap();
    }
    assert_eq!(transport.row_count(), 1);
}

#[test]
fn test_stale_queue_flushed_in_background() {
    let transport = Arc::new(MemoryTransport::new());
    let sender = DataSender::builder()
        .of_data_source("users")
        .update_threshold(10)
        .flush_period(Duration::from_millis(20))
        .max_staleness(Duration::ZERO)
        .build_with(backend(transport.clone()))
        .unwrap();

    sender.delete("1002").unwrap();

    // Initial delay is one second
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while transport.batch_count() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(transport.sent_for(Action::Delete, 0)[0].payloads, vec!["1002"]);
}

#[test]
fn test_builder_requires_update_threshold_and_data_source() {
    let transport = Arc::new(MemoryTransport::new());
    let err = DataSender::builder()
        .of_data_source("users")
        .build_with(backend(transport.clone()))
        .err()
        .unwrap();
    assert!(matches!(err, IndexSenderError::Configuration(_)));

    let err = DataSender::builder()
        .update_threshold(10)
        .build_with(backend(transport.clone()))
        .err()
        .unwrap();
    assert!(matches!(err, IndexSenderError::Configuration(_)));

    let err = DataSender::builder()
        .of_data_source("users")
        .update_threshold(0)
        .build_with(backend(transport))
        .err()
        .unwrap();
    assert!(matches!(err, IndexSenderError::Configuration(_)));
}
