use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Events emitted under this target land in the JSON audit log. Status
/// transitions of sessions, campaigns and automations all go through it.
pub const AUDIT_TARGET: &str = "audit";

/// One JSON line in the audit log: the id operators will grep for, the
/// transition that happened, and free-form detail.
pub fn audit(entity: &str, event: &str, detail: &str) {
    tracing::event!(
        target: AUDIT_TARGET,
        tracing::Level::INFO,
        entity,
        event,
        detail,
    );
}

/// Install the process-wide subscriber:
///
/// - a console layer for `info!`/`error!` during development,
/// - a daily-rolling plain text log under `root`,
/// - a daily-rolling newline-delimited JSON file that only receives
///   events with target [`AUDIT_TARGET`].
pub fn init_tracing(
    root: PathBuf,
    log_file: String,
    audit_file: String,
    log_level: String,
) -> Result<()> {
    let env_filter = EnvFilter::new(&log_level);

    let log_path = root.join(&log_file);
    let txt_dir = log_path
        .parent()
        .context("log file path has no parent directory")?;
    let txt_name = log_path
        .file_name()
        .context("log file path has no file name")?;
    let txt_appender = RollingFileAppender::new(Rotation::DAILY, txt_dir, txt_name);
    let txt_layer = fmt::Layer::default()
        .with_writer(txt_appender)
        .with_ansi(false);

    let audit_path = root.join(&audit_file);
    let json_dir = audit_path
        .parent()
        .context("audit file path has no parent directory")?;
    let json_name = audit_path
        .file_name()
        .context("audit file path has no file name")?;
    let json_appender = RollingFileAppender::new(Rotation::DAILY, json_dir, json_name);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{AUDIT_TARGET}=info")));

    let console_layer = fmt::layer().with_thread_names(true);

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_is_once_per_process() {
        let dir = tempdir().unwrap();
        let first = init_tracing(
            dir.path().to_path_buf(),
            "engine.log".into(),
            "audit.log".into(),
            "info".into(),
        );
        assert!(first.is_ok());

        audit("campaign-123", "running", "dispatch started");

        let second = init_tracing(
            dir.path().to_path_buf(),
            "engine.log".into(),
            "audit.log".into(),
            "info".into(),
        );
        assert!(second.is_err());
    }
}
