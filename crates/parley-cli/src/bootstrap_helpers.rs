use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub(crate) const MONITOR_SNAPSHOT_FILE_NAME: &str = "monitor-snapshot.json";
pub(crate) const INTERVIEW_RECORDS_FILE_NAME: &str = "interview-records.json";
pub(crate) const OUTBOUND_LOG_FILE_NAME: &str = "outbound-messages.json";

/// Installs the compact subscriber on stderr so stdout carries only the run summary.
pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

pub(crate) fn ensure_state_dir(state_dir: &Path) -> Result<()> {
    if state_dir.is_file() {
        bail!("state dir {} is a file", state_dir.display());
    }
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))
}

pub(crate) fn state_file(state_dir: &Path, file_name: &str) -> PathBuf {
    state_dir.join(file_name)
}

#[cfg(test)]
mod tests {
    use super::{ensure_state_dir, state_file, MONITOR_SNAPSHOT_FILE_NAME};

    #[test]
    fn functional_ensure_state_dir_creates_nested_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let nested = temp.path().join("a/b/state");
        ensure_state_dir(&nested).expect("create");
        assert!(nested.is_dir());
        assert_eq!(
            state_file(&nested, MONITOR_SNAPSHOT_FILE_NAME),
            nested.join("monitor-snapshot.json")
        );
    }

    #[test]
    fn regression_ensure_state_dir_rejects_existing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("state");
        std::fs::write(&file, "x").expect("write");
        let error = ensure_state_dir(&file).expect_err("file must be rejected");
        assert!(error.to_string().contains("is a file"));
    }
}
