use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use sp_op_log::{OpLogConfig, OpLogStore, SqliteOpLogStore};
use sp_op_sync::logging::init_tracing;
use tracing::debug;

/// Inspect the operation log of a client
#[derive(Parser, Debug)]
#[command(name = "sp-op-log-cli", version, about)]
struct Cli {
	/// Path to the operation log database
	#[arg(long, env = "SP_OP_LOG_DB")]
	db: PathBuf,

	/// TOML file overriding the default tunables
	#[arg(long)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Log position, pending operations and compaction progress
	Stats,
	/// Operations not yet accepted by the server
	Unsynced,
	/// Current vector clock
	Clock,
	/// Metadata of the last state snapshot
	Cache,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let _guard = init_tracing(None)?;
	let cli = Cli::parse();

	if !cli.db.exists() {
		bail!("no operation log at {}", cli.db.display());
	}

	let config = match &cli.config {
		Some(path) => OpLogConfig::load(path)
			.await
			.with_context(|| format!("loading config from {}", path.display()))?,
		None => OpLogConfig::default(),
	};

	let store = SqliteOpLogStore::open(&cli.db)
		.await
		.with_context(|| format!("opening {}", cli.db.display()))?;
	debug!(db = %cli.db.display(), "Opened operation log;");

	let output = match cli.command {
		Command::Stats => {
			let counter = store.get_compaction_counter().await?;
			json!({
				"lastSeq": store.get_last_seq().await?,
				"entries": store.count().await?,
				"unsynced": store.get_unsynced().await?.len(),
				"pendingRemote": store.get_pending_remote_ops().await?.len(),
				"failedRemote": store.get_failed_remote_ops().await?.len(),
				"hasSyncedOps": store.has_synced_ops().await?,
				"compactionCounter": counter,
				"compactionThreshold": config.compaction_threshold,
				"compactionDue": counter >= config.compaction_threshold,
			})
		}
		Command::Unsynced => {
			let entries = store.get_unsynced().await?;
			serde_json::Value::Array(
				entries
					.iter()
					.map(|entry| {
						json!({
							"seq": entry.seq,
							"id": entry.op.id,
							"actionType": entry.op.action_type,
							"opType": entry.op.op_type,
							"entityType": entry.op.entity_type,
							"entityIds": entry.op.touched_entity_ids(),
							"appliedAt": entry.applied_at,
						})
					})
					.collect(),
			)
		}
		Command::Clock => serde_json::to_value(store.get_vector_clock().await?)?,
		Command::Cache => match store.load_state_cache().await? {
			Some(cache) => json!({
				"lastAppliedOpSeq": cache.last_applied_op_seq,
				"compactedAt": cache.compacted_at,
				"schemaVersion": cache.schema_version,
				"vectorClock": cache.vector_clock,
				"entities": cache.snapshot_entity_keys.len(),
			}),
			None => serde_json::Value::Null,
		},
	};

	println!("{}", serde_json::to_string_pretty(&output)?);

	Ok(())
}
