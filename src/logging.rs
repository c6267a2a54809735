use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::util::{ensure_directory, local_compact_string};

const RUN_LOG_PREFIX: &str = "reembed_risk_";

/// `<dir>/reembed_risk_<YYYYMMDD>_<HHMMSS>.log`. Two runs within the same
/// second share a name and the later one wins.
pub fn run_log_path(dir: &Path, started: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "{RUN_LOG_PREFIX}{}.log",
        local_compact_string(started)
    ))
}

/// An open, truncated run log ready to be handed to [`init`].
pub struct RunLog {
    pub path: PathBuf,
    pub(crate) file: File,
}

pub fn open_run_log(dir: &Path, started: DateTime<Local>) -> Result<RunLog> {
    ensure_directory(dir)?;
    let path = run_log_path(dir, started);
    let file = File::create(&path)
        .with_context(|| format!("failed to create run log: {}", path.display()))?;
    Ok(RunLog { path, file })
}

/// Installs the global subscriber: stdout always, plus the run log when given.
pub fn init(run_log: Option<RunLog>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer().with_target(false).with_writer(std::io::stdout);
    let file_layer = run_log.map(|log| file_layer(log.file));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
}

pub(crate) type FileLayer<S> = fmt::Layer<S, fmt::format::DefaultFields, fmt::format::Format, Mutex<File>>;

pub(crate) fn file_layer<S>(file: File) -> FileLayer<S> {
    fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::TimeZone;
    use tracing::info;

    use super::*;

    #[test]
    fn run_log_path_uses_compact_local_timestamp() {
        let started = Local.with_ymd_and_hms(2025, 3, 9, 18, 5, 1).unwrap();
        let path = run_log_path(Path::new("logs"), started);
        assert_eq!(path, PathBuf::from("logs/reembed_risk_20250309_180501.log"));
    }

    #[test]
    fn open_run_log_creates_missing_directory_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("nested").join("logs");
        let started = Local.with_ymd_and_hms(2025, 3, 9, 18, 5, 1).unwrap();

        let first = open_run_log(&log_dir, started).unwrap();
        fs::write(&first.path, "stale contents").unwrap();
        drop(first);

        let second = open_run_log(&log_dir, started).unwrap();
        assert_eq!(fs::read_to_string(&second.path).unwrap(), "");
    }

    #[test]
    fn file_layer_writes_plain_lines() {
        let dir = tempfile::tempdir().unwrap();
        let started = Local.with_ymd_and_hms(2025, 3, 9, 18, 5, 1).unwrap();
        let log = open_run_log(dir.path(), started).unwrap();
        let path = log.path.clone();

        let subscriber = tracing_subscriber::registry().with(file_layer(log.file));
        tracing::subscriber::with_default(subscriber, || {
            info!(run_id = "r1", "re-embedding run starting");
            info!(run_id = "r1", "re-embedding run completed");
        });

        let contents = fs::read_to_string(path).unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("re-embedding run starting"));
        assert!(lines[1].contains("re-embedding run completed"));
        assert!(!contents.contains('\u{1b}'));
    }
}
