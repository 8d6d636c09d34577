//! SQLite-backed operation log
//!
//! Entries are kept in an `AUTOINCREMENT` table so `seq` values are never
//! reused, even after compaction removes the tail of the log. The operation
//! itself is stored as JSON; only the fields we filter on get columns.

use super::{EntryFilter, OpLogStore, StoreError};
use crate::{
	operation::{ApplicationStatus, OpSource, Operation, OperationLogEntry, StateCache},
	time::{SystemTimeSource, TimeSource},
	vector_clock::VectorClock,
};

use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use sea_orm::{
	ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, QueryResult,
	Statement, TransactionTrait, Value,
};
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: [&str; 6] = [
	r#"
	CREATE TABLE IF NOT EXISTS operations (
		seq INTEGER PRIMARY KEY AUTOINCREMENT,
		op_id TEXT NOT NULL UNIQUE,
		op TEXT NOT NULL,
		applied_at INTEGER NOT NULL,
		source TEXT NOT NULL,
		synced_at INTEGER,
		rejected_at INTEGER,
		application_status TEXT,
		retry_count INTEGER NOT NULL DEFAULT 0
	)
	"#,
	r#"
	CREATE INDEX IF NOT EXISTS idx_operations_pending
	ON operations(synced_at, rejected_at)
	"#,
	r#"
	CREATE INDEX IF NOT EXISTS idx_operations_application
	ON operations(source, application_status)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS state_cache (
		id TEXT PRIMARY KEY,
		cache TEXT NOT NULL
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS vector_clock (
		id TEXT PRIMARY KEY,
		clock TEXT NOT NULL,
		last_update INTEGER NOT NULL
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS op_log_meta (
		key TEXT PRIMARY KEY,
		value INTEGER NOT NULL
	)
	"#,
];

const ENTRY_COLUMNS: &str =
	"seq, op, applied_at, source, synced_at, rejected_at, application_status, retry_count";
const SINGLETON_ID: &str = "current";
const COMPACTION_COUNTER_KEY: &str = "compaction_counter";

fn stmt(sql: &str, values: Vec<Value>) -> Statement {
	Statement::from_sql_and_values(DbBackend::Sqlite, sql, values)
}

/// SQLite reports a full disk or an exhausted page budget as `SQLITE_FULL`
fn map_db_err(e: DbErr) -> StoreError {
	let message = e.to_string();
	if message.contains("database or disk is full") || message.contains("SQLITE_FULL") {
		StoreError::QuotaExceeded(message)
	} else {
		StoreError::Database(e)
	}
}

#[allow(clippy::cast_possible_wrap)]
const fn to_db(value: u64) -> i64 {
	value as i64
}

#[allow(clippy::cast_sign_loss)]
const fn from_db(value: i64) -> u64 {
	value as u64
}

fn entry_from_row(row: &QueryResult) -> Result<OperationLogEntry, StoreError> {
	let seq = from_db(row.try_get::<i64>("", "seq")?);
	let op = serde_json::from_str::<Operation>(&row.try_get::<String>("", "op")?)?;
	let source = OpSource::try_from(row.try_get::<String>("", "source")?.as_str())
		.map_err(|reason| StoreError::Corrupted { seq, reason })?;
	let application_status = row
		.try_get::<Option<String>>("", "application_status")?
		.map(|raw| ApplicationStatus::try_from(raw.as_str()))
		.transpose()
		.map_err(|reason| StoreError::Corrupted { seq, reason })?;
	let retry_count = u32::try_from(row.try_get::<i64>("", "retry_count")?).map_err(|e| {
		StoreError::Corrupted {
			seq,
			reason: e.to_string(),
		}
	})?;

	Ok(OperationLogEntry {
		seq,
		op,
		applied_at: row.try_get("", "applied_at")?,
		source,
		synced_at: row.try_get("", "synced_at")?,
		rejected_at: row.try_get("", "rejected_at")?,
		application_status,
		retry_count,
	})
}

async fn insert_entry<C: ConnectionTrait>(
	conn: &C,
	op: &Operation,
	source: OpSource,
	now: i64,
) -> Result<Option<u64>, StoreError> {
	let status = (source == OpSource::Remote).then_some(ApplicationStatus::Applied);
	insert_entry_with_status(conn, op, source, status, now).await
}

async fn insert_entry_with_status<C: ConnectionTrait>(
	conn: &C,
	op: &Operation,
	source: OpSource,
	status: Option<ApplicationStatus>,
	now: i64,
) -> Result<Option<u64>, StoreError> {
	let synced_at = (source == OpSource::Remote).then_some(now);
	let result = conn
		.execute(stmt(
			r#"
			INSERT OR IGNORE INTO operations
				(op_id, op, applied_at, source, synced_at, application_status)
			VALUES (?, ?, ?, ?, ?, ?)
			"#,
			vec![
				op.id.to_string().into(),
				serde_json::to_string(op)?.into(),
				now.into(),
				source.as_str().into(),
				synced_at.into(),
				status.map(ApplicationStatus::as_str).into(),
			],
		))
		.await
		.map_err(map_db_err)?;

	Ok((result.rows_affected() > 0).then(|| result.last_insert_id()))
}

async fn seq_of<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<u64, StoreError> {
	let row = conn
		.query_one(stmt(
			"SELECT seq FROM operations WHERE op_id = ?",
			vec![id.to_string().into()],
		))
		.await
		.map_err(map_db_err)?;

	Ok(match row {
		Some(row) => from_db(row.try_get("", "seq")?),
		None => 0,
	})
}

async fn read_clock<C: ConnectionTrait>(conn: &C) -> Result<VectorClock, StoreError> {
	let row = conn
		.query_one(stmt(
			"SELECT clock FROM vector_clock WHERE id = ?",
			vec![SINGLETON_ID.into()],
		))
		.await
		.map_err(map_db_err)?;

	match row {
		Some(row) => Ok(serde_json::from_str(&row.try_get::<String>("", "clock")?)?),
		None => Ok(VectorClock::new()),
	}
}

async fn write_clock<C: ConnectionTrait>(
	conn: &C,
	clock: &VectorClock,
	now: i64,
) -> Result<(), StoreError> {
	conn.execute(stmt(
		r#"
		INSERT INTO vector_clock (id, clock, last_update) VALUES (?, ?, ?)
		ON CONFLICT(id) DO UPDATE SET clock = excluded.clock, last_update = excluded.last_update
		"#,
		vec![
			SINGLETON_ID.into(),
			serde_json::to_string(clock)?.into(),
			now.into(),
		],
	))
	.await
	.map_err(map_db_err)?;

	Ok(())
}

pub struct SqliteOpLogStore {
	conn: DatabaseConnection,
	time: Arc<dyn TimeSource>,
}

impl SqliteOpLogStore {
	/// Opens (creating when missing) the log database at `path`
	pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
		Self::open_with_time_source(path, Arc::new(SystemTimeSource)).await
	}

	pub async fn open_with_time_source(
		path: impl AsRef<Path>,
		time: Arc<dyn TimeSource>,
	) -> Result<Self, StoreError> {
		let path = path.as_ref();
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}

		let mut opt = ConnectOptions::new(format!("sqlite://{}?mode=rwc", path.display()));
		// A single connection keeps writers from tripping over SQLITE_BUSY
		opt.max_connections(1)
			.min_connections(1)
			.connect_timeout(Duration::from_secs(8))
			.sqlx_logging(false);

		let conn = Database::connect(opt).await.map_err(map_db_err)?;
		let store = Self { conn, time };
		store.init_schema().await?;

		info!(path = %path.display(), "Opened operation log;");

		Ok(store)
	}

	async fn init_schema(&self) -> Result<(), StoreError> {
		for sql in SCHEMA {
			self.conn
				.execute(Statement::from_string(DbBackend::Sqlite, sql.to_string()))
				.await
				.map_err(map_db_err)?;
		}
		Ok(())
	}
}

#[async_trait]
impl OpLogStore for SqliteOpLogStore {
	async fn append(&self, op: &Operation, source: OpSource) -> Result<u64, StoreError> {
		match insert_entry(&self.conn, op, source, self.time.now_ms()).await? {
			Some(seq) => Ok(seq),
			None => seq_of(&self.conn, op.id).await,
		}
	}

	async fn append_with_vector_clock_update(&self, op: &Operation) -> Result<u64, StoreError> {
		let now = self.time.now_ms();
		let txn = self.conn.begin().await.map_err(map_db_err)?;

		let seq = match insert_entry(&txn, op, OpSource::Local, now).await? {
			Some(seq) => seq,
			None => seq_of(&txn, op.id).await?,
		};
		write_clock(&txn, &op.vector_clock, now).await?;

		txn.commit().await.map_err(map_db_err)?;

		Ok(seq)
	}

	async fn append_batch(
		&self,
		ops: &[Operation],
		source: OpSource,
	) -> Result<Vec<u64>, StoreError> {
		let now = self.time.now_ms();
		let txn = self.conn.begin().await.map_err(map_db_err)?;

		let mut seqs = Vec::with_capacity(ops.len());
		for op in ops {
			if let Some(seq) = insert_entry(&txn, op, source, now).await? {
				seqs.push(seq);
			}
		}

		txn.commit().await.map_err(map_db_err)?;
		debug!(appended = seqs.len(), skipped = ops.len() - seqs.len(), "Appended batch;");

		Ok(seqs)
	}

	async fn append_pending_remote(&self, ops: &[Operation]) -> Result<Vec<u64>, StoreError> {
		let now = self.time.now_ms();
		let txn = self.conn.begin().await.map_err(map_db_err)?;

		let mut seqs = Vec::with_capacity(ops.len());
		for op in ops {
			if let Some(seq) = insert_entry_with_status(
				&txn,
				op,
				OpSource::Remote,
				Some(ApplicationStatus::Pending),
				now,
			)
			.await?
			{
				seqs.push(seq);
			}
		}

		txn.commit().await.map_err(map_db_err)?;
		Ok(seqs)
	}

	async fn mark_applied(&self, seqs: &[u64]) -> Result<(), StoreError> {
		let txn = self.conn.begin().await.map_err(map_db_err)?;
		for seq in seqs {
			txn.execute(stmt(
				r#"
				UPDATE operations SET application_status = 'applied'
				WHERE seq = ? AND application_status IN ('pending', 'failed')
				"#,
				vec![to_db(*seq).into()],
			))
			.await
			.map_err(map_db_err)?;
		}
		txn.commit().await.map_err(map_db_err)
	}

	async fn mark_failed(
		&self,
		op_ids: &[Uuid],
		max_retries: Option<u32>,
	) -> Result<(), StoreError> {
		let now = self.time.now_ms();
		let txn = self.conn.begin().await.map_err(map_db_err)?;
		for id in op_ids {
			let Some(row) = txn
				.query_one(stmt(
					"SELECT retry_count FROM operations WHERE op_id = ?",
					vec![id.to_string().into()],
				))
				.await
				.map_err(map_db_err)?
			else {
				continue;
			};

			let attempts = row.try_get::<i64>("", "retry_count")? + 1;
			let update = if max_retries.is_some_and(|max| attempts >= i64::from(max)) {
				stmt(
					r#"
					UPDATE operations
					SET rejected_at = COALESCE(rejected_at, ?), application_status = NULL
					WHERE op_id = ?
					"#,
					vec![now.into(), id.to_string().into()],
				)
			} else {
				stmt(
					r#"
					UPDATE operations SET application_status = 'failed', retry_count = ?
					WHERE op_id = ?
					"#,
					vec![attempts.into(), id.to_string().into()],
				)
			};
			txn.execute(update).await.map_err(map_db_err)?;
		}
		txn.commit().await.map_err(map_db_err)
	}

	async fn get_pending_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StoreError> {
		self.conn
			.query_all(Statement::from_string(
				DbBackend::Sqlite,
				format!(
					"SELECT {ENTRY_COLUMNS} FROM operations \
					WHERE source = 'remote' AND application_status = 'pending' ORDER BY seq"
				),
			))
			.await
			.map_err(map_db_err)?
			.iter()
			.map(entry_from_row)
			.collect()
	}

	async fn get_failed_remote_ops(&self) -> Result<Vec<OperationLogEntry>, StoreError> {
		self.conn
			.query_all(Statement::from_string(
				DbBackend::Sqlite,
				format!(
					"SELECT {ENTRY_COLUMNS} FROM operations \
					WHERE source = 'remote' AND application_status = 'failed' \
					AND rejected_at IS NULL ORDER BY seq"
				),
			))
			.await
			.map_err(map_db_err)?
			.iter()
			.map(entry_from_row)
			.collect()
	}

	async fn get_unsynced(&self) -> Result<Vec<OperationLogEntry>, StoreError> {
		self.conn
			.query_all(Statement::from_string(
				DbBackend::Sqlite,
				format!(
					"SELECT {ENTRY_COLUMNS} FROM operations \
					WHERE synced_at IS NULL AND rejected_at IS NULL ORDER BY seq"
				),
			))
			.await
			.map_err(map_db_err)?
			.iter()
			.map(entry_from_row)
			.collect()
	}

	async fn mark_synced(&self, seqs: &[u64]) -> Result<(), StoreError> {
		let now = self.time.now_ms();
		let txn = self.conn.begin().await.map_err(map_db_err)?;
		for seq in seqs {
			txn.execute(stmt(
				"UPDATE operations SET synced_at = ? WHERE seq = ? AND synced_at IS NULL",
				vec![now.into(), to_db(*seq).into()],
			))
			.await
			.map_err(map_db_err)?;
		}
		txn.commit().await.map_err(map_db_err)
	}

	async fn mark_rejected(&self, op_ids: &[Uuid]) -> Result<(), StoreError> {
		let now = self.time.now_ms();
		let txn = self.conn.begin().await.map_err(map_db_err)?;
		for id in op_ids {
			txn.execute(stmt(
				"UPDATE operations SET rejected_at = COALESCE(rejected_at, ?), \
				application_status = CASE WHEN application_status = 'applied' \
				THEN application_status END WHERE op_id = ?",
				vec![now.into(), id.to_string().into()],
			))
			.await
			.map_err(map_db_err)?;
		}
		txn.commit().await.map_err(map_db_err)
	}

	async fn get_applied_op_ids(&self) -> Result<HashSet<Uuid>, StoreError> {
		self.conn
			.query_all(Statement::from_string(
				DbBackend::Sqlite,
				"SELECT seq, op_id FROM operations".to_string(),
			))
			.await
			.map_err(map_db_err)?
			.iter()
			.map(|row| {
				let raw = row.try_get::<String>("", "op_id")?;
				Uuid::parse_str(&raw).map_err(|e| StoreError::Corrupted {
					seq: row.try_get::<i64>("", "seq").map_or(0, from_db),
					reason: e.to_string(),
				})
			})
			.collect()
	}

	async fn get_op_by_id(&self, id: Uuid) -> Result<Option<OperationLogEntry>, StoreError> {
		self.conn
			.query_one(stmt(
				&format!("SELECT {ENTRY_COLUMNS} FROM operations WHERE op_id = ?"),
				vec![id.to_string().into()],
			))
			.await
			.map_err(map_db_err)?
			.as_ref()
			.map(entry_from_row)
			.transpose()
	}

	async fn get_last_seq(&self) -> Result<u64, StoreError> {
		// sqlite_sequence survives deletions, MAX(seq) does not
		let row = self
			.conn
			.query_one(Statement::from_string(
				DbBackend::Sqlite,
				"SELECT seq FROM sqlite_sequence WHERE name = 'operations'".to_string(),
			))
			.await
			.map_err(map_db_err)?;

		Ok(match row {
			Some(row) => from_db(row.try_get("", "seq")?),
			None => 0,
		})
	}

	async fn count(&self) -> Result<u64, StoreError> {
		let row = self
			.conn
			.query_one(Statement::from_string(
				DbBackend::Sqlite,
				"SELECT COUNT(*) AS total FROM operations".to_string(),
			))
			.await
			.map_err(map_db_err)?;

		Ok(match row {
			Some(row) => from_db(row.try_get("", "total")?),
			None => 0,
		})
	}

	async fn has_synced_ops(&self) -> Result<bool, StoreError> {
		Ok(self
			.conn
			.query_one(Statement::from_string(
				DbBackend::Sqlite,
				"SELECT seq FROM operations WHERE synced_at IS NOT NULL LIMIT 1".to_string(),
			))
			.await
			.map_err(map_db_err)?
			.is_some())
	}

	async fn get_vector_clock(&self) -> Result<VectorClock, StoreError> {
		read_clock(&self.conn).await
	}

	async fn set_vector_clock(&self, clock: &VectorClock) -> Result<(), StoreError> {
		write_clock(&self.conn, clock, self.time.now_ms()).await
	}

	async fn merge_remote_op_clocks(&self, ops: &[Operation]) -> Result<(), StoreError> {
		if ops.is_empty() {
			return Ok(());
		}

		let txn = self.conn.begin().await.map_err(map_db_err)?;
		let merged = ops
			.iter()
			.fold(read_clock(&txn).await?, |clock, op| {
				clock.merge(&op.vector_clock)
			});
		write_clock(&txn, &merged, self.time.now_ms()).await?;
		txn.commit().await.map_err(map_db_err)
	}

	async fn save_state_cache(&self, cache: &StateCache) -> Result<(), StoreError> {
		self.conn
			.execute(stmt(
				r#"
				INSERT INTO state_cache (id, cache) VALUES (?, ?)
				ON CONFLICT(id) DO UPDATE SET cache = excluded.cache
				"#,
				vec![SINGLETON_ID.into(), serde_json::to_string(cache)?.into()],
			))
			.await
			.map_err(map_db_err)?;
		Ok(())
	}

	async fn load_state_cache(&self) -> Result<Option<StateCache>, StoreError> {
		let row = self
			.conn
			.query_one(stmt(
				"SELECT cache FROM state_cache WHERE id = ?",
				vec![SINGLETON_ID.into()],
			))
			.await
			.map_err(map_db_err)?;

		match row {
			Some(row) => Ok(Some(serde_json::from_str(
				&row.try_get::<String>("", "cache")?,
			)?)),
			None => Ok(None),
		}
	}

	async fn get_compaction_counter(&self) -> Result<u64, StoreError> {
		let row = self
			.conn
			.query_one(stmt(
				"SELECT value FROM op_log_meta WHERE key = ?",
				vec![COMPACTION_COUNTER_KEY.into()],
			))
			.await
			.map_err(map_db_err)?;

		Ok(match row {
			Some(row) => from_db(row.try_get("", "value")?),
			None => 0,
		})
	}

	async fn increment_compaction_counter(&self) -> Result<u64, StoreError> {
		let row = self
			.conn
			.query_one(stmt(
				r#"
				INSERT INTO op_log_meta (key, value) VALUES (?, 1)
				ON CONFLICT(key) DO UPDATE SET value = value + 1
				RETURNING value
				"#,
				vec![COMPACTION_COUNTER_KEY.into()],
			))
			.await
			.map_err(map_db_err)?;

		Ok(match row {
			Some(row) => from_db(row.try_get("", "value")?),
			None => 0,
		})
	}

	async fn reset_compaction_counter(&self) -> Result<(), StoreError> {
		self.conn
			.execute(stmt(
				r#"
				INSERT INTO op_log_meta (key, value) VALUES (?, 0)
				ON CONFLICT(key) DO UPDATE SET value = 0
				"#,
				vec![COMPACTION_COUNTER_KEY.into()],
			))
			.await
			.map_err(map_db_err)?;
		Ok(())
	}

	async fn delete_ops_where(&self, filter: &EntryFilter) -> Result<u64, StoreError> {
		let mut sql = String::from("DELETE FROM operations WHERE 1 = 1");
		let mut values = Vec::<Value>::new();

		if filter.synced_only {
			sql.push_str(" AND synced_at IS NOT NULL");
		}
		if let Some(cutoff) = filter.applied_before {
			sql.push_str(" AND applied_at < ?");
			values.push(cutoff.into());
		}
		if let Some(max_seq) = filter.max_seq {
			sql.push_str(" AND seq <= ?");
			values.push(to_db(max_seq).into());
		}

		Ok(self
			.conn
			.execute(stmt(&sql, values))
			.await
			.map_err(map_db_err)?
			.rows_affected())
	}
}
