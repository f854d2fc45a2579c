use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Install the global subscriber.
///
/// `RUST_LOG` controls the level (default `warn`). With `log_file` set, logs
/// also go to a daily rolling file; keep the returned guard alive until exit
/// so buffered lines are flushed.
pub fn init(log_file: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
  let stderr = fmt::layer().with_writer(std::io::stderr);

  if !log_file {
    tracing_subscriber::registry()
      .with(filter)
      .with(stderr)
      .try_init()
      .map_err(|e| Error::Config(format!("Failed to install logger: {}", e)))?;
    return Ok(None);
  }

  let appender = tracing_appender::rolling::daily(log_dir()?, "restocache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::registry()
    .with(filter)
    .with(stderr)
    .with(fmt::layer().with_ansi(false).with_writer(writer))
    .try_init()
    .map_err(|e| Error::Config(format!("Failed to install logger: {}", e)))?;
  Ok(Some(guard))
}

fn log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;
  Ok(data_dir.join("restocache").join("logs"))
}
