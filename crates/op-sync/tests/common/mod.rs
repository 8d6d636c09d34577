#![allow(dead_code, clippy::unwrap_used)]

use sp_op_log::{
	store::EntryFilter, ClientId, EntityChange, FakeTimeSource, MemoryOpLogStore,
	MultiEntityPayload, OpLogConfig, OpLogStore, OpSource, OpType, Operation, OperationLogEntry,
	OperationPayload, StateCache, StoreError, VectorClock, CURRENT_SCHEMA_VERSION,
};
use sp_op_sync::{
	domain::{
		CaptureQueue, DomainError, LegacyMetaBridge, PartialApplyError, RemoteOpsProcessor,
		StateSnapshotSource, SyncGate,
	},
	provider::{
		DownloadOpsResponse, DownloadedFile, FileSyncProvider, OpUploadResult,
		OperationSyncProvider, PrivateConfig, ServerOperation, SnapshotUpload,
		SnapshotUploadResponse, SyncOperation, UploadOpsResponse,
	},
	Notice, Notifier, ProviderError, SyncContext,
};

use std::{
	collections::{HashMap, HashSet, VecDeque},
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc, Mutex,
	},
};

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

pub const CLIENT: &str = "client-a";
pub const OTHER_CLIENT: &str = "client-b";

#[derive(Default)]
pub struct RecordingNotifier {
	notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
	pub fn notices(&self) -> Vec<Notice> {
		self.notices.lock().unwrap().clone()
	}

	pub fn count(&self, notice: &Notice) -> usize {
		self.notices().iter().filter(|n| *n == notice).count()
	}
}

impl Notifier for RecordingNotifier {
	fn notify(&self, notice: Notice) {
		self.notices.lock().unwrap().push(notice);
	}
}

pub struct MockLegacy {
	pub client_id: ClientId,
	pub loads: AtomicUsize,
	pub increments: AtomicUsize,
}

impl Default for MockLegacy {
	fn default() -> Self {
		Self {
			client_id: ClientId::from(CLIENT),
			loads: AtomicUsize::new(0),
			increments: AtomicUsize::new(0),
		}
	}
}

#[async_trait]
impl LegacyMetaBridge for MockLegacy {
	async fn load_client_id(&self) -> Result<ClientId, DomainError> {
		self.loads.fetch_add(1, Ordering::SeqCst);
		Ok(self.client_id.clone())
	}

	async fn increment_vector_clock_for_local_change(
		&self,
		_client_id: &ClientId,
	) -> Result<(), DomainError> {
		self.increments.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

#[derive(Default)]
pub struct MockQueue {
	queued: Mutex<HashMap<String, Vec<EntityChange>>>,
}

impl MockQueue {
	pub fn enqueue(&self, key: String, changes: Vec<EntityChange>) {
		self.queued.lock().unwrap().insert(key, changes);
	}
}

#[async_trait]
impl CaptureQueue for MockQueue {
	async fn dequeue(&self, correlation_key: &str) -> Vec<EntityChange> {
		self.queued
			.lock()
			.unwrap()
			.remove(correlation_key)
			.unwrap_or_default()
	}
}

/// Applies operations in order and stops at the first id in `failing`
#[derive(Default)]
pub struct MockProcessor {
	pub processed: Mutex<Vec<Operation>>,
	pub failing: Mutex<HashSet<Uuid>>,
}

impl MockProcessor {
	pub fn processed_ids(&self) -> Vec<Uuid> {
		self.processed.lock().unwrap().iter().map(|op| op.id).collect()
	}

	pub fn fail_on(&self, id: Uuid) {
		self.failing.lock().unwrap().insert(id);
	}

	pub fn heal(&self) {
		self.failing.lock().unwrap().clear();
	}
}

#[async_trait]
impl RemoteOpsProcessor for MockProcessor {
	async fn process_remote_ops(&self, ops: &[Operation]) -> Result<(), PartialApplyError> {
		let failing = self.failing.lock().unwrap().clone();
		let mut processed = self.processed.lock().unwrap();
		for (applied, op) in ops.iter().enumerate() {
			if failing.contains(&op.id) {
				return Err(PartialApplyError {
					applied,
					source: DomainError(format!("cannot apply {}", op.id)),
				});
			}
			processed.push(op.clone());
		}
		Ok(())
	}
}

pub struct MockGate {
	pub online: AtomicBool,
	pub applying_remote: AtomicBool,
}

impl Default for MockGate {
	fn default() -> Self {
		Self {
			online: AtomicBool::new(true),
			applying_remote: AtomicBool::new(false),
		}
	}
}

impl SyncGate for MockGate {
	fn is_online(&self) -> bool {
		self.online.load(Ordering::SeqCst)
	}

	fn is_applying_remote_ops(&self) -> bool {
		self.applying_remote.load(Ordering::SeqCst)
	}
}

pub struct MockSnapshot {
	pub state: Mutex<Result<Value, DomainError>>,
}

impl Default for MockSnapshot {
	fn default() -> Self {
		Self {
			state: Mutex::new(Ok(json!({ "task": { "ids": ["t1"], "entities": {} } }))),
		}
	}
}

impl MockSnapshot {
	pub fn fail(&self) {
		*self.state.lock().unwrap() = Err(DomainError("state unavailable".into()));
	}
}

#[async_trait]
impl StateSnapshotSource for MockSnapshot {
	async fn get_all_sync_model_data(&self) -> Result<Value, DomainError> {
		self.state.lock().unwrap().clone()
	}
}

/// Memory store whose local appends fail with a full disk a given number of
/// times
pub struct QuotaFailingStore {
	pub inner: MemoryOpLogStore,
	pub failures_left: AtomicUsize,
	pub append_attempts: AtomicUsize,
}

impl QuotaFailingStore {
	pub fn new(inner: MemoryOpLogStore, failures: usize) -> Self {
		Self {
			inner,
			failures_left: AtomicUsize::new(failures),
			append_attempts: AtomicUsize::new(0),
		}
	}
}

#[async_trait]
impl OpLogStore for QuotaFailingStore {
	async fn append(&self, op: &Operation, source: OpSource) -> Result<u64, StoreError> {
		self.inner.append(op, source).await
	}

	async fn append_with_vector_clock_update(&self, op: &Operation) -> Result<u64, StoreError> {
		self.append_attempts.fetch_add(1, Ordering::SeqCst);
		if self
			.failures_left
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
			.is_ok()
		{
			return Err(StoreError::QuotaExceeded("database or disk is full".into()));
		}
		self.inner.append_with_vector_clock_update(op).await
	}

	async fn append_batch(&self, ops: &[Operation], source: OpSource) -> Result<Vec<u64>, StoreError> {
		self.inner.append_batch(ops, source).await
	}

	async fn append_pending_remote(&self, ops: &[Operation]) -> Result<Vec<u64>, StoreError> {
		self.inner.append_pending_remote(ops).await
	}

	async fn mark_applied(&self, seqs: &[u64]) -> Result<(), StoreError> {
		self.inner.mark_applied(seqs).await
	}

	async fn mark_failed(&self, op_ids: &[Uuid], max_retries: Option<u32>) -> Result<(), StoreError> {
		self.inner.mark_failed(op_ids, max_retries).await
	}

	async fn get_pending_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StoreError> {
		self.inner.get_pending_remote_ops().await
	}

	async fn get_failed_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StoreError> {
		self.inner.get_failed_remote_ops().await
	}

	async fn get_unsynced(&self) -> Result<Vec<OperationLogEntry>, StoreError> {
		self.inner.get_unsynced().await
	}

	async fn mark_synced(&self, seqs: &[u64]) -> Result<(), StoreError> {
		self.inner.mark_synced(seqs).await
	}

	async fn mark_rejected(&self, op_ids: &[Uuid]) -> Result<(), StoreError> {
		self.inner.mark_rejected(op_ids).await
	}

	async fn get_applied_op_ids(&self) -> Result<HashSet<Uuid>, StoreError> {
		self.inner.get_applied_op_ids().await
	}

	async fn get_op_by_id(&self, id: Uuid) -> Result<Option<OperationLogEntry>, StoreError> {
		self.inner.get_op_by_id(id).await
	}

	async fn get_last_seq(&self) -> Result<u64, StoreError> {
		self.inner.get_last_seq().await
	}

	async fn count(&self) -> Result<u64, StoreError> {
		self.inner.count().await
	}

	async fn has_synced_ops(&self) -> Result<bool, StoreError> {
		self.inner.has_synced_ops().await
	}

	async fn get_vector_clock(&self) -> Result<VectorClock, StoreError> {
		self.inner.get_vector_clock().await
	}

	async fn set_vector_clock(&self, clock: &VectorClock) -> Result<(), StoreError> {
		self.inner.set_vector_clock(clock).await
	}

	async fn merge_remote_op_clocks(&self, ops: &[Operation]) -> Result<(), StoreError> {
		self.inner.merge_remote_op_clocks(ops).await
	}

	async fn save_state_cache(&self, cache: &StateCache) -> Result<(), StoreError> {
		self.inner.save_state_cache(cache).await
	}

	async fn load_state_cache(&self) -> Result<Option<StateCache>, StoreError> {
		self.inner.load_state_cache().await
	}

	async fn get_compaction_counter(&self) -> Result<u64, StoreError> {
		self.inner.get_compaction_counter().await
	}

	async fn increment_compaction_counter(&self) -> Result<u64, StoreError> {
		self.inner.increment_compaction_counter().await
	}

	async fn reset_compaction_counter(&self) -> Result<(), StoreError> {
		self.inner.reset_compaction_counter().await
	}

	async fn delete_ops_where(&self, filter: &EntryFilter) -> Result<u64, StoreError> {
		self.inner.delete_ops_where(filter).await
	}
}

/// In-memory operation server
#[derive(Default)]
pub struct MockApiProvider {
	pub last_server_seq: Mutex<u64>,
	pub uploads: Mutex<Vec<Vec<SyncOperation>>>,
	pub upload_seqs: Mutex<Vec<Option<u64>>>,
	pub snapshots: Mutex<Vec<SnapshotUpload>>,
	/// Rejection message per op id
	pub reject: Mutex<HashMap<Uuid, String>>,
	pub snapshot_response: Mutex<Option<SnapshotUploadResponse>>,
	/// Handed out with the next upload responses, one entry per call
	pub upload_extras: Mutex<VecDeque<(Vec<ServerOperation>, bool, u64)>>,
	pub download_pages: Mutex<VecDeque<DownloadOpsResponse>>,
	pub download_requests: Mutex<Vec<u64>>,
	pub private_config: Mutex<Option<PrivateConfig>>,
	pub fail_uploads: AtomicBool,
	pub next_server_seq: Mutex<u64>,
}

impl MockApiProvider {
	pub fn uploaded_ids(&self) -> Vec<Uuid> {
		self.uploads
			.lock()
			.unwrap()
			.iter()
			.flatten()
			.map(|op| op.id)
			.collect()
	}

	pub fn upload_calls(&self) -> usize {
		self.uploads.lock().unwrap().len()
	}

	pub fn push_page(&self, page: DownloadOpsResponse) {
		self.download_pages.lock().unwrap().push_back(page);
	}

	pub fn stored_seq(&self) -> u64 {
		*self.last_server_seq.lock().unwrap()
	}
}

#[async_trait]
impl OperationSyncProvider for MockApiProvider {
	async fn is_ready(&self) -> bool {
		true
	}

	async fn get_last_server_seq(&self) -> Result<u64, ProviderError> {
		Ok(*self.last_server_seq.lock().unwrap())
	}

	async fn set_last_server_seq(&self, seq: u64) -> Result<(), ProviderError> {
		*self.last_server_seq.lock().unwrap() = seq;
		Ok(())
	}

	async fn upload_ops(
		&self,
		ops: &[SyncOperation],
		_client_id: &ClientId,
		last_known_server_seq: Option<u64>,
	) -> Result<UploadOpsResponse, ProviderError> {
		if self.fail_uploads.load(Ordering::SeqCst) {
			return Err(ProviderError::Network("connection reset".into()));
		}

		self.uploads.lock().unwrap().push(ops.to_vec());
		self.upload_seqs.lock().unwrap().push(last_known_server_seq);

		let reject = self.reject.lock().unwrap().clone();
		let mut next_seq = self.next_server_seq.lock().unwrap();
		let results = ops
			.iter()
			.map(|op| match reject.get(&op.id) {
				Some(error) => OpUploadResult {
					op_id: op.id,
					accepted: false,
					server_seq: None,
					error: Some(error.clone()),
				},
				None => {
					*next_seq += 1;
					OpUploadResult {
						op_id: op.id,
						accepted: true,
						server_seq: Some(*next_seq),
						error: None,
					}
				}
			})
			.collect();

		let (new_ops, has_more_piggyback, latest_seq) = self
			.upload_extras
			.lock()
			.unwrap()
			.pop_front()
			.unwrap_or((Vec::new(), false, *next_seq));

		Ok(UploadOpsResponse {
			results,
			latest_seq,
			new_ops: (!new_ops.is_empty()).then_some(new_ops),
			has_more_piggyback,
		})
	}

	async fn download_ops(
		&self,
		since_seq: u64,
		_exclude_client: Option<&ClientId>,
		_limit: usize,
	) -> Result<DownloadOpsResponse, ProviderError> {
		self.download_requests.lock().unwrap().push(since_seq);
		Ok(self
			.download_pages
			.lock()
			.unwrap()
			.pop_front()
			.unwrap_or_default())
	}

	async fn upload_snapshot(
		&self,
		snapshot: SnapshotUpload,
	) -> Result<SnapshotUploadResponse, ProviderError> {
		self.snapshots.lock().unwrap().push(snapshot);
		Ok(self
			.snapshot_response
			.lock()
			.unwrap()
			.clone()
			.unwrap_or(SnapshotUploadResponse {
				accepted: true,
				server_seq: Some(1),
				error: None,
			}))
	}

	async fn load_private_config(&self) -> Result<Option<PrivateConfig>, ProviderError> {
		Ok(self.private_config.lock().unwrap().clone())
	}
}

/// Folder-like remote storage
#[derive(Default)]
pub struct MockFileProvider {
	pub files: Mutex<HashMap<String, String>>,
	/// Failures left per path before downloads succeed
	pub download_failures: Mutex<HashMap<String, usize>>,
	pub download_attempts: Mutex<HashMap<String, usize>>,
	pub uploads: Mutex<Vec<String>>,
	pub removed: Mutex<Vec<String>>,
}

impl MockFileProvider {
	pub fn file(&self, path: &str) -> Option<String> {
		self.files.lock().unwrap().get(path).cloned()
	}

	pub fn put(&self, path: &str, content: String) {
		self.files.lock().unwrap().insert(path.to_string(), content);
	}

	pub fn attempts(&self, path: &str) -> usize {
		self.download_attempts
			.lock()
			.unwrap()
			.get(path)
			.copied()
			.unwrap_or_default()
	}
}

#[async_trait]
impl FileSyncProvider for MockFileProvider {
	async fn is_ready(&self) -> bool {
		true
	}

	async fn upload_file(
		&self,
		path: &str,
		content: &str,
		_expected_rev: Option<&str>,
	) -> Result<String, ProviderError> {
		self.uploads.lock().unwrap().push(path.to_string());
		self.put(path, content.to_string());
		Ok(Uuid::now_v7().to_string())
	}

	async fn download_file(&self, path: &str) -> Result<DownloadedFile, ProviderError> {
		*self
			.download_attempts
			.lock()
			.unwrap()
			.entry(path.to_string())
			.or_default() += 1;

		if let Some(left) = self.download_failures.lock().unwrap().get_mut(path) {
			if *left > 0 {
				*left -= 1;
				return Err(ProviderError::Network("flaky".into()));
			}
		}

		self.file(path)
			.map(|data| DownloadedFile { data, rev: None })
			.ok_or_else(|| ProviderError::NotFound(path.to_string()))
	}

	async fn remove_file(&self, path: &str) -> Result<(), ProviderError> {
		self.removed.lock().unwrap().push(path.to_string());
		self.files
			.lock()
			.unwrap()
			.remove(path)
			.map(|_| ())
			.ok_or_else(|| ProviderError::NotFound(path.to_string()))
	}

	async fn list_files(&self, dir: &str) -> Result<Vec<String>, ProviderError> {
		Ok(self
			.files
			.lock()
			.unwrap()
			.keys()
			.filter(|path| path.starts_with(dir))
			.cloned()
			.collect())
	}
}

pub struct Harness {
	pub store: Arc<dyn OpLogStore>,
	pub notifier: Arc<RecordingNotifier>,
	pub legacy: Arc<MockLegacy>,
	pub time: FakeTimeSource,
	pub ctx: Arc<SyncContext>,
}

impl Harness {
	pub fn new(config: OpLogConfig) -> Self {
		let time = FakeTimeSource::new(1_700_000_000_000);
		let store: Arc<dyn OpLogStore> =
			Arc::new(MemoryOpLogStore::with_time_source(Arc::new(time.clone())));
		Self::with_store(config, store, time)
	}

	pub fn with_store(config: OpLogConfig, store: Arc<dyn OpLogStore>, time: FakeTimeSource) -> Self {
		let notifier = Arc::new(RecordingNotifier::default());
		let legacy = Arc::new(MockLegacy::default());
		let ctx = Arc::new(
			SyncContext::new(
				Arc::clone(&store),
				config,
				legacy.clone(),
				notifier.clone(),
			)
			.with_time_source(Arc::new(time.clone())),
		);

		Self {
			store,
			notifier,
			legacy,
			time,
			ctx,
		}
	}
}

pub fn local_op(client: &str, entity_id: &str, timestamp: i64) -> Operation {
	op_with_type(client, entity_id, timestamp, OpType::Update)
}

pub fn op_with_type(client: &str, entity_id: &str, timestamp: i64, op_type: OpType) -> Operation {
	let client = ClientId::from(client);
	let payload = if op_type.is_full_state() {
		OperationPayload::FullState(json!({ "task": { "ids": [entity_id] } }))
	} else {
		OperationPayload::MultiEntity(MultiEntityPayload {
			action_payload: json!({ "id": entity_id }),
			entity_changes: Vec::new(),
		})
	};

	Operation {
		id: Uuid::now_v7(),
		vector_clock: VectorClock::new().increment(&client),
		client_id: client,
		action_type: "[Task] Update".into(),
		op_type,
		entity_type: "TASK".into(),
		entity_id: Some(entity_id.into()),
		entity_ids: None,
		payload,
		timestamp,
		schema_version: CURRENT_SCHEMA_VERSION,
	}
}

pub fn server_op(seq: u64, op: &Operation) -> ServerOperation {
	ServerOperation {
		server_seq: seq,
		received_at: op.timestamp,
		op: SyncOperation::try_from(op).unwrap(),
	}
}

/// Appends `count` pending local operations
pub async fn seed_pending(store: &dyn OpLogStore, count: usize) -> Vec<Operation> {
	let mut ops = Vec::with_capacity(count);
	for idx in 0..count {
		let op = local_op(CLIENT, &format!("t{idx}"), 1_000 + idx as i64);
		store.append(&op, OpSource::Local).await.unwrap();
		ops.push(op);
	}
	ops
}
