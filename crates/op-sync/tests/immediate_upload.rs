mod common;

use common::{
	local_op, seed_pending, server_op, Harness, MockApiProvider, MockFileProvider, MockGate,
	MockProcessor, MockQueue, MockSnapshot, OTHER_CLIENT,
};

use sp_op_log::{OpLogConfig, OpLogStore, OpType};
use sp_op_sync::{
	capture::{OperationWriter, PersistentAction, WriteOutcome},
	compaction::CompactionService,
	immediate_upload::{ImmediateUploadHandle, ImmediateUploadService},
	orchestrator::RemoteOpsApplier,
	provider::SyncProvider,
	upload::UploadService,
	Notice,
};

use std::{
	sync::{atomic::Ordering, Arc},
	time::Duration,
};

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::{task::JoinHandle, time::sleep};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

struct Setup {
	harness: Harness,
	gate: Arc<MockGate>,
	processor: Arc<MockProcessor>,
	handle: ImmediateUploadHandle,
	task: JoinHandle<()>,
}

/// One synced operation so the client counts as initialized, plus `pending`
/// waiting for upload
async fn setup(provider: SyncProvider, pending: usize) -> Setup {
	let harness = Harness::new(OpLogConfig::default());
	seed_pending(harness.store.as_ref(), pending + 1).await;
	harness.store.mark_synced(&[1]).await.unwrap();

	let gate = Arc::new(MockGate::default());
	let processor = Arc::new(MockProcessor::default());
	let upload = Arc::new(UploadService::new(Arc::clone(&harness.ctx)));
	let applier = Arc::new(RemoteOpsApplier::new(
		Arc::clone(&harness.ctx),
		processor.clone(),
	));

	let (handle, task) = ImmediateUploadService::new(
		Arc::clone(&harness.ctx),
		provider,
		upload,
		applier,
		gate.clone(),
	)
	.spawn();

	Setup {
		harness,
		gate,
		processor,
		handle,
		task,
	}
}

async fn shutdown(handle: ImmediateUploadHandle, task: JoinHandle<()>) {
	handle.stop().await;
	task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_triggers_uploads_once() {
	let api = Arc::new(MockApiProvider::default());
	let Setup {
		harness,
		handle,
		task,
		..
	} = setup(SyncProvider::Api(api.clone()), 2).await;

	for _ in 0..5 {
		handle.trigger();
	}
	sleep(Duration::from_secs(5)).await;

	assert_eq!(api.upload_calls(), 1);
	assert_eq!(api.uploads.lock().unwrap()[0].len(), 2);
	assert!(harness.store.get_unsynced().await.unwrap().is_empty());
	assert_eq!(api.stored_seq(), 2);
	assert_eq!(harness.notifier.notices(), vec![Notice::InSync]);

	shutdown(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_each_trigger_restarts_the_window() {
	let api = Arc::new(MockApiProvider::default());
	let Setup { handle, task, .. } = setup(SyncProvider::Api(api.clone()), 1).await;

	handle.trigger();
	sleep(Duration::from_millis(1_000)).await;
	handle.trigger();
	sleep(Duration::from_millis(1_500)).await;
	assert_eq!(api.upload_calls(), 0);

	sleep(Duration::from_millis(1_000)).await;
	assert_eq!(api.upload_calls(), 1);

	shutdown(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_later_writes_get_their_own_upload() {
	let api = Arc::new(MockApiProvider::default());
	let Setup {
		harness,
		handle,
		task,
		..
	} = setup(SyncProvider::Api(api.clone()), 1).await;

	handle.trigger();
	sleep(Duration::from_secs(3)).await;

	seed_pending(harness.store.as_ref(), 1).await;
	handle.trigger();
	sleep(Duration::from_secs(3)).await;

	assert_eq!(api.upload_calls(), 2);
	assert!(harness.store.get_unsynced().await.unwrap().is_empty());

	shutdown(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_offline_skips_upload() {
	let api = Arc::new(MockApiProvider::default());
	let Setup {
		harness,
		gate,
		handle,
		task,
		..
	} = setup(SyncProvider::Api(api.clone()), 1).await;
	gate.online.store(false, Ordering::SeqCst);

	handle.trigger();
	sleep(Duration::from_secs(3)).await;

	assert_eq!(api.upload_calls(), 0);
	assert_eq!(harness.store.get_unsynced().await.unwrap().len(), 1);

	shutdown(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_file_providers_wait_for_full_sync() {
	let files = Arc::new(MockFileProvider::default());
	let Setup {
		harness,
		handle,
		task,
		..
	} = setup(SyncProvider::File(files.clone()), 1).await;

	handle.trigger();
	sleep(Duration::from_secs(3)).await;

	assert!(files.uploads.lock().unwrap().is_empty());
	assert_eq!(harness.store.get_unsynced().await.unwrap().len(), 1);

	shutdown(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_fresh_client_waits_for_full_sync() {
	let harness = Harness::new(OpLogConfig::default());

	let api = Arc::new(MockApiProvider::default());
	let remote = local_op(OTHER_CLIENT, "r1", 5_000);
	api.upload_extras
		.lock()
		.unwrap()
		.push_back((vec![server_op(1, &remote)], false, 1));
	let processor = Arc::new(MockProcessor::default());

	let (handle, task) = ImmediateUploadService::new(
		Arc::clone(&harness.ctx),
		SyncProvider::Api(api.clone()),
		Arc::new(UploadService::new(Arc::clone(&harness.ctx))),
		Arc::new(RemoteOpsApplier::new(
			Arc::clone(&harness.ctx),
			processor.clone(),
		)),
		Arc::new(MockGate::default()),
	)
	.spawn();

	handle.trigger();
	sleep(Duration::from_secs(3)).await;

	assert_eq!(api.upload_calls(), 0);
	assert!(processor.processed_ids().is_empty());
	assert_eq!(api.stored_seq(), 0);

	shutdown(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_never_synced_client_uploads_local_history() {
	let harness = Harness::new(OpLogConfig::default());
	let pending = seed_pending(harness.store.as_ref(), 2).await;

	let api = Arc::new(MockApiProvider::default());
	let (handle, task) = ImmediateUploadService::new(
		Arc::clone(&harness.ctx),
		SyncProvider::Api(api.clone()),
		Arc::new(UploadService::new(Arc::clone(&harness.ctx))),
		Arc::new(RemoteOpsApplier::new(
			Arc::clone(&harness.ctx),
			Arc::new(MockProcessor::default()),
		)),
		Arc::new(MockGate::default()),
	)
	.spawn();

	handle.trigger();
	sleep(Duration::from_secs(3)).await;

	assert_eq!(
		api.uploaded_ids(),
		pending.iter().map(|op| op.id).collect::<Vec<_>>()
	);

	shutdown(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_compacted_client_keeps_uploading() {
	let api = Arc::new(MockApiProvider::default());
	let Setup {
		harness,
		handle,
		task,
		..
	} = setup(SyncProvider::Api(api.clone()), 0).await;

	// Every synced entry ages out, only the snapshot is left
	harness.time.advance(8 * DAY_MS);
	let report = CompactionService::new(
		Arc::clone(&harness.ctx),
		Arc::new(MockSnapshot::default()),
	)
	.compact()
	.await
	.unwrap();
	assert_eq!(report.deleted, 1);
	assert!(!harness.store.has_synced_ops().await.unwrap());

	let pending = seed_pending(harness.store.as_ref(), 1).await;
	handle.trigger();
	sleep(Duration::from_secs(3)).await;

	assert_eq!(api.uploaded_ids(), vec![pending[0].id]);
	assert_eq!(harness.notifier.notices(), vec![Notice::InSync]);

	shutdown(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_piggybacked_ops_are_applied() {
	let api = Arc::new(MockApiProvider::default());
	let remote = local_op(OTHER_CLIENT, "r1", 5_000);
	api.upload_extras
		.lock()
		.unwrap()
		.push_back((vec![server_op(9, &remote)], false, 9));

	let Setup {
		harness,
		processor,
		handle,
		task,
		..
	} = setup(SyncProvider::Api(api.clone()), 1).await;

	handle.trigger();
	sleep(Duration::from_secs(3)).await;

	assert_eq!(processor.processed_ids(), vec![remote.id]);
	let recorded = harness.store.get_op_by_id(remote.id).await.unwrap().unwrap();
	assert!(recorded.synced_at.is_some());
	assert_eq!(api.stored_seq(), 9);
	// More may be coming from others, so not reported as in sync
	assert!(harness.notifier.notices().is_empty());

	shutdown(handle, task).await;
}

#[tokio::test(start_paused = true)]
async fn test_local_write_triggers_upload() {
	let api = Arc::new(MockApiProvider::default());
	let Setup {
		harness,
		gate,
		handle,
		task,
		..
	} = setup(SyncProvider::Api(api.clone()), 0).await;

	let writer = OperationWriter::new(
		Arc::clone(&harness.ctx),
		Arc::new(MockQueue::default()),
		gate,
		Arc::new(CompactionService::new(
			Arc::clone(&harness.ctx),
			Arc::new(MockSnapshot::default()),
		)),
	);
	writer.attach_immediate_upload(handle.clone());

	let outcome = writer
		.write_operation(PersistentAction {
			action_type: "[Task] Add".into(),
			entity_type: "TASK".into(),
			entity_id: Some("t1".into()),
			entity_ids: None,
			op_type: OpType::Create,
			payload: json!({ "task": { "id": "t1", "title": "Write tests" } }),
			is_remote: false,
		})
		.await;
	let WriteOutcome::Persisted { op_id, .. } = outcome else {
		panic!("operation was not persisted");
	};

	sleep(Duration::from_secs(3)).await;

	assert_eq!(api.uploaded_ids(), vec![op_id]);
	assert_eq!(harness.notifier.notices(), vec![Notice::InSync]);

	shutdown(handle, task).await;
}
