use std::path::Path;

use tracing_appender::{
	non_blocking::WorkerGuard,
	rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "sp_op_log=info,sp_op_sync=info";
const LOG_FILE_NAME: &str = "op-sync.log";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
	#[error("failed to create log directory: {0}")]
	CreateDir(#[from] std::io::Error),
	#[error("failed to initialize tracing: {0}")]
	Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Installs the global subscriber: console output, plus a daily rotated file
/// in `log_dir` when given.
///
/// The returned guard flushes the file writer on drop and has to be kept
/// alive for as long as logs should be written.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>, LoggingError> {
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

	let console = fmt::layer().with_target(true).with_writer(std::io::stderr);

	let Some(log_dir) = log_dir else {
		tracing_subscriber::registry()
			.with(env_filter)
			.with(console)
			.try_init()?;
		return Ok(None);
	};

	std::fs::create_dir_all(log_dir)?;
	let (file_writer, guard) = tracing_appender::non_blocking(RollingFileAppender::new(
		Rotation::DAILY,
		log_dir,
		LOG_FILE_NAME,
	));

	tracing_subscriber::registry()
		.with(env_filter)
		.with(console)
		.with(
			fmt::layer()
				.with_target(true)
				.with_thread_ids(true)
				.with_ansi(false)
				.with_writer(file_writer),
		)
		.try_init()?;

	Ok(Some(guard))
}
