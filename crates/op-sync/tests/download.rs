mod common;

use common::{local_op, server_op, Harness, MockApiProvider, MockFileProvider, OTHER_CLIENT};

use sp_op_log::{ClientId, OpLogConfig, OpLogStore, OpSource, Operation, VectorClock};
use sp_op_sync::{
	download::{DownloadOptions, DownloadService},
	encryption::PayloadCipher,
	manifest::{encode_ops_file, ops_file_path, OperationLogManifest, MANIFEST_PATH},
	provider::{DownloadOpsResponse, PrivateConfig, SyncOperation, SyncProvider},
	Notice,
};

use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

const NOW: i64 = 1_700_000_000_000;

fn remote_ops(count: usize) -> Vec<Operation> {
	(0..count)
		.map(|idx| local_op(OTHER_CLIENT, &format!("r{idx}"), NOW - 1_000 + idx as i64))
		.collect()
}

/// A page holding `ops` at consecutive server sequences starting at `first_seq`
fn page(ops: &[Operation], first_seq: u64, has_more: bool, latest_seq: u64) -> DownloadOpsResponse {
	DownloadOpsResponse {
		ops: ops
			.iter()
			.zip(first_seq..)
			.map(|(op, seq)| server_op(seq, op))
			.collect(),
		has_more,
		latest_seq,
		gap_detected: false,
		server_time: Some(NOW),
		snapshot_vector_clock: None,
	}
}

fn gap(latest_seq: u64) -> DownloadOpsResponse {
	DownloadOpsResponse {
		gap_detected: true,
		..page(&[], 0, false, latest_seq)
	}
}

fn encrypted_page(ops: &[Operation], password: &str) -> DownloadOpsResponse {
	let mut response = page(ops, 1, false, ops.len() as u64);
	let mut wire = response
		.ops
		.iter()
		.map(|server_op| server_op.op.clone())
		.collect::<Vec<_>>();
	PayloadCipher::new(password).encrypt_ops(&mut wire).unwrap();
	for (server_op, encrypted) in response.ops.iter_mut().zip(wire) {
		server_op.op = encrypted;
	}
	response
}

fn api_setup(config: OpLogConfig) -> (Harness, Arc<MockApiProvider>, SyncProvider, DownloadService) {
	let harness = Harness::new(config);
	let api = Arc::new(MockApiProvider::default());
	let provider = SyncProvider::Api(api.clone());
	let download = DownloadService::new(Arc::clone(&harness.ctx));
	(harness, api, provider, download)
}

fn ids(ops: &[Operation]) -> Vec<uuid::Uuid> {
	ops.iter().map(|op| op.id).collect()
}

#[tokio::test]
async fn test_downloads_every_page() {
	let (harness, api, provider, download) = api_setup(OpLogConfig::default());
	let ops = remote_ops(3);
	api.push_page(page(&ops[..2], 1, true, 3));
	api.push_page(page(&ops[2..], 3, false, 3));

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert!(result.success);
	assert_eq!(ids(&result.new_ops), ids(&ops));
	assert_eq!(result.latest_server_seq, Some(3));
	assert!(!result.needs_full_state_upload);
	assert_eq!(*api.download_requests.lock().unwrap(), vec![0, 2]);

	// Recording the operations and the position is up to the caller
	assert_eq!(harness.store.count().await.unwrap(), 0);
	assert_eq!(api.stored_seq(), 0);
}

#[tokio::test]
async fn test_resumes_from_stored_seq_and_skips_known_ops() {
	let (harness, api, provider, download) = api_setup(OpLogConfig::default());
	*api.last_server_seq.lock().unwrap() = 10;
	let ops = remote_ops(2);
	harness.store.append(&ops[0], OpSource::Remote).await.unwrap();
	api.push_page(page(&ops, 11, false, 12));

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert_eq!(*api.download_requests.lock().unwrap(), vec![10]);
	assert_eq!(ids(&result.new_ops), vec![ops[1].id]);
	assert_eq!(result.latest_server_seq, Some(12));
}

#[tokio::test]
async fn test_gap_restarts_once_and_asks_for_full_state() {
	let (harness, api, provider, download) = api_setup(OpLogConfig::default());
	*api.last_server_seq.lock().unwrap() = 42;
	api.push_page(gap(0));
	api.push_page(gap(0));
	api.push_page(page(&remote_ops(1), 1, false, 1));

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert_eq!(*api.download_requests.lock().unwrap(), vec![42, 0]);
	assert!(result.success);
	assert!(result.new_ops.is_empty());
	assert!(result.needs_full_state_upload);
	assert_eq!(result.latest_server_seq, Some(0));
	assert!(harness.notifier.notices().is_empty());
}

#[tokio::test]
async fn test_gap_discards_ops_collected_before_reset() {
	let (_harness, api, provider, download) = api_setup(OpLogConfig::default());
	*api.last_server_seq.lock().unwrap() = 20;
	let stale = remote_ops(2);
	let all = remote_ops(3);
	api.push_page(page(&stale, 21, true, 30));
	api.push_page(gap(3));
	api.push_page(page(&all, 1, false, 3));

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert_eq!(*api.download_requests.lock().unwrap(), vec![20, 22, 0]);
	assert_eq!(ids(&result.new_ops), ids(&all));
	assert_eq!(result.latest_server_seq, Some(3));
}

#[tokio::test]
async fn test_gap_on_populated_server_downloads_everything() {
	let (_harness, api, provider, download) = api_setup(OpLogConfig::default());
	*api.last_server_seq.lock().unwrap() = 42;
	let ops = remote_ops(2);
	api.push_page(gap(2));
	api.push_page(page(&ops, 1, false, 2));

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert_eq!(*api.download_requests.lock().unwrap(), vec![42, 0]);
	assert_eq!(ids(&result.new_ops), ids(&ops));
	assert!(!result.needs_full_state_upload);
	assert_eq!(result.latest_server_seq, Some(2));
}

#[tokio::test]
async fn test_stops_at_memory_cap() {
	let (harness, api, provider, download) = api_setup(OpLogConfig {
		max_download_ops_in_memory: 2,
		..OpLogConfig::default()
	});
	let ops = remote_ops(3);
	api.push_page(page(&ops, 1, true, 10));

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert!(!result.success);
	assert_eq!(ids(&result.new_ops), ids(&ops[..2]));
	// Only the part that was read is covered
	assert_eq!(result.latest_server_seq, Some(2));
	assert_eq!(
		harness.notifier.notices(),
		vec![Notice::TooManyOpsToDownload { limit: 2 }]
	);
}

#[tokio::test]
async fn test_stops_after_iteration_limit() {
	let (_harness, api, provider, download) = api_setup(OpLogConfig {
		max_download_iterations: 2,
		..OpLogConfig::default()
	});
	let ops = remote_ops(3);
	for (idx, op) in ops.iter().enumerate() {
		api.push_page(page(std::slice::from_ref(op), idx as u64 + 1, true, 100));
	}

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert!(!result.success);
	assert_eq!(api.download_requests.lock().unwrap().len(), 2);
	assert_eq!(result.new_ops.len(), 2);
	assert_eq!(result.latest_server_seq, Some(2));
}

#[tokio::test]
async fn test_encrypted_ops_without_password() {
	let (harness, api, provider, download) = api_setup(OpLogConfig::default());
	let ops = remote_ops(1);
	api.push_page(encrypted_page(&ops, "secret"));

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert!(!result.success);
	assert!(result.new_ops.is_empty());
	assert_eq!(result.latest_server_seq, None);
	assert_eq!(
		harness.notifier.notices(),
		vec![Notice::EncryptionPasswordRequired]
	);
}

#[tokio::test]
async fn test_encrypted_ops_are_decrypted() {
	let (_harness, api, provider, download) = api_setup(OpLogConfig::default());
	*api.private_config.lock().unwrap() = Some(PrivateConfig {
		encryption_enabled: true,
		encrypt_key: Some("secret".into()),
	});
	let ops = remote_ops(2);
	api.push_page(encrypted_page(&ops, "secret"));

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert!(result.success);
	assert_eq!(result.new_ops, ops);
}

#[tokio::test(start_paused = true)]
async fn test_clock_drift_is_reported_once() {
	let (harness, api, provider, download) = api_setup(OpLogConfig::default());
	let ops = remote_ops(2);
	for (idx, op) in ops.iter().enumerate() {
		api.push_page(DownloadOpsResponse {
			server_time: Some(NOW - 10 * 60 * 1000),
			..page(std::slice::from_ref(op), idx as u64 + 1, false, idx as u64 + 1)
		});
	}

	download.download_remote_ops(&provider).await.unwrap();
	download.download_remote_ops(&provider).await.unwrap();

	assert_eq!(
		harness.notifier.notices(),
		vec![Notice::ClockDrift { minutes: 10 }]
	);
}

#[tokio::test]
async fn test_old_ops_without_server_time_are_not_drift() {
	let (harness, api, provider, download) = api_setup(OpLogConfig::default());
	let old = local_op(OTHER_CLIENT, "r0", NOW - 12 * 60 * 60 * 1000);
	api.push_page(DownloadOpsResponse {
		server_time: None,
		..page(std::slice::from_ref(&old), 1, false, 1)
	});

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert_eq!(ids(&result.new_ops), vec![old.id]);
	assert!(harness.notifier.notices().is_empty());
}

#[tokio::test]
async fn test_forced_download_collects_every_clock() {
	let (harness, api, provider, download) = api_setup(OpLogConfig::default());
	*api.last_server_seq.lock().unwrap() = 7;
	let ops = remote_ops(2);
	harness.store.append(&ops[0], OpSource::Remote).await.unwrap();

	let snapshot_clock = VectorClock::new()
		.increment(&ClientId::from("client-c"))
		.increment(&ClientId::from("client-c"));
	api.push_page(DownloadOpsResponse {
		snapshot_vector_clock: Some(snapshot_clock.clone()),
		..page(&ops, 1, false, 2)
	});

	let result = download
		.download_remote_ops_with(
			&provider,
			DownloadOptions {
				force_from_seq0: true,
			},
		)
		.await
		.unwrap();

	assert_eq!(*api.download_requests.lock().unwrap(), vec![0]);
	// Known operations still contribute their clocks
	assert_eq!(ids(&result.new_ops), vec![ops[1].id]);
	assert_eq!(
		result.all_op_clocks,
		vec![ops[0].vector_clock.clone(), ops[1].vector_clock.clone()]
	);
	assert_eq!(result.snapshot_vector_clock, Some(snapshot_clock));
	assert_eq!(result.latest_server_seq, Some(2));
}

#[tokio::test]
async fn test_regular_download_skips_clock_collection() {
	let (_harness, api, provider, download) = api_setup(OpLogConfig::default());
	api.push_page(page(&remote_ops(2), 1, false, 2));

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert!(result.all_op_clocks.is_empty());
	assert_eq!(result.snapshot_vector_clock, None);
}

#[tokio::test]
async fn test_small_drift_is_ignored() {
	let (harness, api, provider, download) = api_setup(OpLogConfig::default());
	api.push_page(DownloadOpsResponse {
		server_time: Some(NOW + 60 * 1000),
		..page(&remote_ops(1), 1, false, 1)
	});

	download.download_remote_ops(&provider).await.unwrap();
	assert!(harness.notifier.notices().is_empty());
}

fn file_setup(config: OpLogConfig) -> (Harness, Arc<MockFileProvider>, SyncProvider, DownloadService) {
	let harness = Harness::new(config);
	let files = Arc::new(MockFileProvider::default());
	let provider = SyncProvider::File(files.clone());
	let download = DownloadService::new(Arc::clone(&harness.ctx));
	(harness, files, provider, download)
}

/// Stores `ops` as one operation file and returns its path
fn put_ops_file(files: &MockFileProvider, ops: &[Operation]) -> String {
	let path = ops_file_path(&ops[0].client_id, ops[0].timestamp);
	let wire = ops
		.iter()
		.map(|op| SyncOperation::try_from(op).unwrap())
		.collect::<Vec<_>>();
	files.put(&path, encode_ops_file(&wire).unwrap());
	path
}

fn put_manifest(files: &MockFileProvider, paths: &[String]) {
	let mut manifest = OperationLogManifest::default();
	for path in paths {
		manifest.insert(path.clone());
	}
	files.put(MANIFEST_PATH, serde_json::to_string(&manifest).unwrap());
}

#[tokio::test]
async fn test_reads_files_listed_in_manifest() {
	let (_harness, files, provider, download) = file_setup(OpLogConfig::default());
	let ops = remote_ops(3);
	let first = put_ops_file(&files, &ops[..2]);
	let second = put_ops_file(&files, &ops[2..]);
	put_manifest(&files, &[first, second]);

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert!(result.success);
	assert_eq!(result.latest_server_seq, None);
	assert_eq!(ids(&result.new_ops), ids(&ops));
}

#[tokio::test]
async fn test_missing_manifest_is_rebuilt_from_listing() {
	let (_harness, files, provider, download) = file_setup(OpLogConfig::default());
	let ops = remote_ops(1);
	let path = put_ops_file(&files, &ops);
	files.put("ops/notes.txt", String::new());

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert_eq!(ids(&result.new_ops), ids(&ops));
	let manifest: OperationLogManifest =
		serde_json::from_str(&files.file(MANIFEST_PATH).unwrap()).unwrap();
	assert_eq!(manifest.operation_files, vec![path]);
}

#[tokio::test]
async fn test_empty_remote_is_a_success() {
	let (_harness, _files, provider, download) = file_setup(OpLogConfig::default());

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert!(result.success);
	assert!(result.new_ops.is_empty());
}

#[tokio::test]
async fn test_ops_covered_by_local_clock_are_skipped() {
	let (harness, files, provider, download) = file_setup(OpLogConfig::default());
	let ops = remote_ops(2);

	// Everything up to the first remote change was folded into a snapshot
	let mut clock = VectorClock::new();
	clock = clock.increment(&ClientId::from(OTHER_CLIENT));
	harness.store.set_vector_clock(&clock).await.unwrap();

	let mut newer = ops[1].clone();
	newer.vector_clock = clock.increment(&ClientId::from(OTHER_CLIENT));
	let path = put_ops_file(&files, &[ops[0].clone(), newer.clone()]);
	put_manifest(&files, &[path]);

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert_eq!(ids(&result.new_ops), vec![newer.id]);
}

#[tokio::test(start_paused = true)]
async fn test_flaky_file_is_retried() {
	let (harness, files, provider, download) = file_setup(OpLogConfig::default());
	let ops = remote_ops(1);
	let path = put_ops_file(&files, &ops);
	put_manifest(&files, &[path.clone()]);
	files.download_failures.lock().unwrap().insert(path.clone(), 2);

	let started = tokio::time::Instant::now();
	let result = download.download_remote_ops(&provider).await.unwrap();

	assert!(result.success);
	assert_eq!(files.attempts(&path), 3);
	// 1s, then 2s
	assert!(started.elapsed() >= Duration::from_secs(3));
	assert_eq!(ids(&result.new_ops), ids(&ops));
	assert!(harness.notifier.notices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_files_are_reported() {
	let (harness, files, provider, download) = file_setup(OpLogConfig::default());
	let ops = remote_ops(2);
	let flaky = put_ops_file(&files, &ops[..1]);
	let good = put_ops_file(&files, &ops[1..]);
	let missing = "ops/ops_client-c_1.json".to_string();
	put_manifest(&files, &[flaky.clone(), good, missing.clone()]);
	files
		.download_failures
		.lock()
		.unwrap()
		.insert(flaky.clone(), usize::MAX);

	let result = download.download_remote_ops(&provider).await.unwrap();

	assert!(!result.success);
	assert_eq!(result.failed_file_count, 2);
	assert_eq!(ids(&result.new_ops), vec![ops[1].id]);
	assert_eq!(files.attempts(&flaky), 4);
	// Missing files are not retried
	assert_eq!(files.attempts(&missing), 1);
	assert_eq!(
		harness.notifier.notices(),
		vec![Notice::IncompleteSync { failed_files: 2 }]
	);
}
