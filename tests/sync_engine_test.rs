mod common;

use tempfile::TempDir;

use std::time::Duration;

use common::{open_context, open_context_with, test_options, Call, ScriptedGateway};
use compost_sync::gateway::RemoteError;
use compost_sync::media;
use compost_sync::models::{
    MediaItem, MediaKind, MediaPayload, Reading, SyncTask, TaskStatus,
};
use compost_sync::sync::{DrainOutcome, SyncPolicy};
use compost_sync::systems;
use compost_sync::AppContext;

fn stored_reading(context: &AppContext, id: &str, system_id: &str) -> Reading {
    let mut reading = Reading::new(
        id.to_string(),
        system_id.to_string(),
        "2025-04-01".to_string(),
        "08:00".to_string(),
        systems::system_by_id(system_id).unwrap().probe_labels(),
    );
    reading.set_probe(0, Some(131.0));
    context.store.put(reading.clone()).unwrap();
    reading
}

fn stored_photo(context: &AppContext, id: &str, reading_id: &str) -> MediaItem {
    let item = MediaItem {
        id: id.to_string(),
        reading_id: reading_id.to_string(),
        kind: MediaKind::Photo,
        mime_type: "image/jpeg".to_string(),
        payload: MediaPayload::Inline {
            data_uri: media::to_data_uri("image/jpeg", b"jpeg bytes"),
        },
        thumbnail: None,
        remote: None,
        filename: format!("2025-04-01_pivot-1_photo_{}.jpg", id),
        synced: false,
        created_at: chrono::Utc::now(),
    };
    context.store.put(item.clone()).unwrap();
    item
}

fn completed(outcome: DrainOutcome) -> compost_sync::DrainReport {
    match outcome {
        DrainOutcome::Completed(report) => report,
        DrainOutcome::Skipped => panic!("expected a completed pass"),
    }
}

#[tokio::test]
async fn test_media_is_uploaded_before_the_entry_row() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    let context = open_context(&dir, gateway.clone());

    stored_reading(&context, "r1", "pivot-1");
    stored_photo(&context, "m1", "r1");
    // entry queued first, media second
    context.engine.enqueue_reading("r1").unwrap();
    context.engine.enqueue_media("m1").unwrap();

    let report = completed(context.engine.drain().await);
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, 0);

    let calls = gateway.calls();
    assert_eq!(calls.len(), 3);
    assert!(matches!(&calls[0], Call::Upload { size, .. } if *size == b"jpeg bytes".len()));
    assert!(matches!(&calls[1], Call::MakePublic { .. }));
    match &calls[2] {
        Call::Append { system_id, row } => {
            assert_eq!(system_id, "pivot-1");
            assert_eq!(
                row.media_links,
                vec!["https://drive.example/view/2025-04-01_pivot-1_photo_m1.jpg".to_string()]
            );
            assert_eq!(row.probes.len(), 9);
            assert_eq!(row.probes[0], Some(131.0));
        }
        other => panic!("expected an append, got {:?}", other),
    }

    let media = context.store.get_media("m1").unwrap().unwrap();
    assert!(media.synced);
    assert_eq!(
        media.remote.map(|r| r.file_id),
        Some("file-2025-04-01_pivot-1_photo_m1.jpg".to_string())
    );
    assert!(context.store.get_reading("r1").unwrap().unwrap().synced);
    assert_eq!(context.engine.pending_count().unwrap(), 0);
    assert!(context.store.all_tasks().unwrap().is_empty());
}

#[tokio::test]
async fn test_same_kind_tasks_keep_arrival_order() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    let context = open_context(&dir, gateway.clone());

    for id in ["r3", "r1", "r2"] {
        let mut reading = stored_reading(&context, id, "batch-1");
        reading.general_notes = id.to_string();
        context.store.put(reading).unwrap();
        context.engine.enqueue_reading(id).unwrap();
    }
    assert_eq!(completed(context.engine.drain().await).synced, 3);

    let order: Vec<String> = gateway
        .appends()
        .into_iter()
        .map(|row| row.general_notes)
        .collect();
    assert_eq!(order, vec!["r3", "r1", "r2"]);
    assert!(context.store.all_tasks().unwrap().is_empty());
}

#[tokio::test]
async fn test_five_failures_park_the_task() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    gateway.fail_with(Some(RemoteError::Status {
        status: 503,
        body: "sheet unavailable".to_string(),
    }));
    let context = open_context(&dir, gateway.clone());

    stored_reading(&context, "r1", "pivot-2");
    let task = context.engine.enqueue_reading("r1").unwrap();

    for attempt in 1..=4u32 {
        let report = completed(context.engine.drain().await);
        assert_eq!(report.failed, 1);
        assert!(!report.failures[0].permanent);
        let stored: SyncTask = context.store.get(task.id.clone()).unwrap().unwrap();
        assert_eq!(stored.retry_count, attempt);
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.last_attempt.is_some());
        assert!(stored.last_error.unwrap().contains("sheet unavailable"));
        assert_eq!(context.engine.pending_count().unwrap(), 1);
    }

    let fifth = completed(context.engine.drain().await);
    assert_eq!(fifth.failed, 1);
    assert!(fifth.failures[0].permanent);

    let parked: SyncTask = context.store.get(task.id.clone()).unwrap().unwrap();
    assert_eq!(parked.retry_count, 5);
    assert_eq!(parked.status, TaskStatus::FailedPermanently);
    assert_eq!(context.engine.pending_count().unwrap(), 0);

    // parked tasks are not attempted again
    let after = completed(context.engine.drain().await);
    assert_eq!(after.synced + after.failed, 0);
    assert_eq!(gateway.appends().len(), 5);
    assert!(!context.store.get_reading("r1").unwrap().unwrap().synced);
}

#[tokio::test]
async fn test_concurrent_drain_is_skipped() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    let context = open_context(&dir, gateway.clone());

    stored_reading(&context, "r1", "pivot-1");
    context.engine.enqueue_reading("r1").unwrap();

    let mut draining = context.engine.subscribe_draining();
    let (first, second) = tokio::join!(context.engine.drain(), context.engine.drain());

    assert_eq!(completed(first).synced, 1);
    assert_eq!(second, DrainOutcome::Skipped);
    assert_eq!(gateway.appends().len(), 1);
    assert!(!context.engine.is_draining());
    assert!(!*draining.borrow_and_update());
}

#[tokio::test]
async fn test_missing_reading_resolves_silently() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    let context = open_context(&dir, gateway.clone());

    context.engine.enqueue_reading("deleted-reading").unwrap();
    let report = completed(context.engine.drain().await);

    assert_eq!(report.synced, 0);
    assert_eq!(report.failed, 0);
    assert!(context.store.all_tasks().unwrap().is_empty());
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn test_missing_media_counts_as_failure() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    let context = open_context(&dir, gateway.clone());

    let task = context.engine.enqueue_media("deleted-media").unwrap();
    let report = completed(context.engine.drain().await);

    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].reason, "media item deleted-media not found");
    let stored: SyncTask = context.store.get(task.id).unwrap().unwrap();
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.status, TaskStatus::Pending);
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn test_too_large_upload_fails_permanently_at_once() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    gateway.push_outcome(Err(RemoteError::PayloadTooLarge {
        size: 10,
        limit: 4,
    }));
    let context = open_context(&dir, gateway.clone());

    stored_reading(&context, "r1", "pivot-1");
    stored_photo(&context, "m1", "r1");
    let task = context.engine.enqueue_media("m1").unwrap();

    let report = completed(context.engine.drain().await);
    assert_eq!(report.failed, 1);
    assert!(report.failures[0].permanent);

    let stored: SyncTask = context.store.get(task.id).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::FailedPermanently);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(context.engine.pending_count().unwrap(), 0);
    assert!(!context.store.get_media("m1").unwrap().unwrap().synced);
}

#[tokio::test]
async fn test_configuration_error_keeps_retry_budget() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    gateway.push_outcome(Err(RemoteError::Configuration(
        "missing spreadsheet id".to_string(),
    )));
    let context = open_context(&dir, gateway.clone());

    stored_reading(&context, "r1", "cylinder-3");
    let task = context.engine.enqueue_reading("r1").unwrap();

    let first = completed(context.engine.drain().await);
    assert_eq!(first.failed, 1);
    let stored: SyncTask = context.store.get(task.id.clone()).unwrap().unwrap();
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.status, TaskStatus::Pending);

    // cylinders send five probe cells
    let second = completed(context.engine.drain().await);
    assert_eq!(second.synced, 1);
    assert_eq!(gateway.appends()[1].probes.len(), 5);
}

#[tokio::test]
async fn test_discard_removes_parked_tasks_too() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    gateway.push_outcome(Err(RemoteError::Validation("bad row".to_string())));
    let context = open_context(&dir, gateway.clone());

    stored_reading(&context, "r1", "pivot-1");
    context.engine.enqueue_reading("r1").unwrap();
    context.engine.drain().await;
    context.engine.enqueue_reading("r1").unwrap();

    assert_eq!(context.engine.pending_count().unwrap(), 1);
    assert_eq!(context.store.all_tasks().unwrap().len(), 2);
    assert_eq!(context.engine.discard_all().unwrap(), 2);
    assert!(context.store.all_tasks().unwrap().is_empty());
}

#[tokio::test]
async fn test_interrupted_tasks_return_to_queue_on_open() {
    let dir = TempDir::new().unwrap();
    let context = open_context(&dir, ScriptedGateway::new());

    stored_reading(&context, "r1", "pivot-1");
    let mut task = context.engine.enqueue_reading("r1").unwrap();
    task.status = TaskStatus::InProgress;
    task.retry_count = 3;
    context.store.put(task.clone()).unwrap();
    assert_eq!(context.store.pending_tasks().unwrap().len(), 0);
    context.shutdown().unwrap();

    let gateway = ScriptedGateway::new();
    let reopened = open_context(&dir, gateway.clone());
    let pending = reopened.store.pending_tasks().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, task.id);
    assert_eq!(pending[0].retry_count, 3);

    assert_eq!(completed(reopened.engine.drain().await).synced, 1);
}

#[tokio::test]
async fn test_rows_are_keyed_by_system_id() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    let context = open_context(&dir, gateway.clone());

    stored_reading(&context, "r1", "cylinder-1");
    stored_reading(&context, "r2", "batch-1");
    context.engine.enqueue_reading("r1").unwrap();
    context.engine.enqueue_reading("r2").unwrap();
    assert_eq!(completed(context.engine.drain().await).synced, 2);

    let sent: Vec<(String, usize)> = gateway
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Append { system_id, row } => Some((system_id, row.probes.len())),
            _ => None,
        })
        .collect();
    assert_eq!(
        sent,
        vec![("cylinder-1".to_string(), 5), ("batch-1".to_string(), 9)]
    );
}

#[tokio::test]
async fn test_hanging_gateway_times_out_and_counts_an_attempt() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    gateway.hang_for(Some(Duration::from_secs(2)));
    let mut options = test_options(&dir);
    options.policy = SyncPolicy {
        gateway_timeout: Some(Duration::from_millis(50)),
        ..SyncPolicy::default()
    };
    let context = open_context_with(options, gateway.clone());

    stored_reading(&context, "r1", "pivot-1");
    let task = context.engine.enqueue_reading("r1").unwrap();

    let report = completed(context.engine.drain().await);
    assert_eq!(report.synced, 0);
    assert_eq!(report.failed, 1);
    assert!(!report.failures[0].permanent);
    assert!(report.failures[0].reason.contains("timed out"));

    let stored: SyncTask = context.store.get(task.id).unwrap().unwrap();
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.status, TaskStatus::Pending);
    assert!(!context.store.get_reading("r1").unwrap().unwrap().synced);
}

#[tokio::test]
async fn test_failed_share_retries_without_second_upload() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    gateway.push_share_outcome(Err(RemoteError::Transport("drive hiccup".to_string())));
    let context = open_context(&dir, gateway.clone());

    stored_reading(&context, "r1", "pivot-1");
    stored_photo(&context, "m1", "r1");
    let task = context.engine.enqueue_media("m1").unwrap();

    let first = completed(context.engine.drain().await);
    assert_eq!(first.failed, 1);
    let media = context.store.get_media("m1").unwrap().unwrap();
    assert!(!media.synced);
    assert_eq!(
        media.remote.as_ref().map(|r| r.file_id.as_str()),
        Some("file-2025-04-01_pivot-1_photo_m1.jpg")
    );
    let stored: SyncTask = context.store.get(task.id).unwrap().unwrap();
    assert_eq!(stored.retry_count, 1);

    let second = completed(context.engine.drain().await);
    assert_eq!(second.synced, 1);
    assert!(context.store.get_media("m1").unwrap().unwrap().synced);

    let calls = gateway.calls();
    let uploads = calls
        .iter()
        .filter(|call| matches!(call, Call::Upload { .. }))
        .count();
    let shares = calls
        .iter()
        .filter(|call| matches!(call, Call::MakePublic { .. }))
        .count();
    assert_eq!(uploads, 1);
    assert_eq!(shares, 2);
}

#[tokio::test]
async fn test_edit_during_delivery_stays_unsynced() {
    let dir = TempDir::new().unwrap();
    let gateway = ScriptedGateway::new();
    let context = open_context(&dir, gateway.clone());

    stored_reading(&context, "r1", "pivot-1");
    context.engine.enqueue_reading("r1").unwrap();

    let store = context.store.clone();
    gateway.on_append(move |_row| {
        let mut edited = store.get_reading("r1").unwrap().unwrap();
        edited.general_notes = "added after the row left".to_string();
        edited.updated_at = chrono::Utc::now() + chrono::Duration::seconds(1);
        store.put(edited).unwrap();
    });

    let report = completed(context.engine.drain().await);
    assert_eq!(report.synced, 1);

    let stored = context.store.get_reading("r1").unwrap().unwrap();
    assert!(!stored.synced);
    assert_eq!(stored.general_notes, "added after the row left");
    assert_eq!(gateway.appends()[0].general_notes, "");
}
