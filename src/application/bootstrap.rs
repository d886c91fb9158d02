use crate::infrastructure::config::{ensure_default_configs, load_engine_config, load_remote_config};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};

pub const DATABASE_FILE: &str = "tasktimer.sqlite";

#[derive(Debug, Clone)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub database_path: PathBuf,
}

/// Creates `config/`, `state/` and `logs/` under `workspace_root`, writes
/// default configs and makes sure the schema exists. Safe to run repeatedly.
pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join(DATABASE_FILE);

    for dir in [&config_dir, &state_dir, &logs_dir] {
        fs::create_dir_all(dir)?;
    }

    ensure_default_configs(&config_dir)?;
    load_engine_config(&config_dir)?;
    load_remote_config(&config_dir)?;
    initialize_database(&database_path)?;
    tracing::debug!(root = %workspace_root.display(), "workspace ready");

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        config_dir,
        logs_dir,
        database_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    struct TempWorkspace {
        path: PathBuf,
    }

    impl TempWorkspace {
        fn new() -> Self {
            let sequence = NEXT_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "tasktimer-bootstrap-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            Self { path }
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn creates_layout_and_is_idempotent() {
        let workspace = TempWorkspace::new();

        let first = bootstrap_workspace(&workspace.path).expect("bootstrap");
        assert!(first.config_dir.join("engine.json").is_file());
        assert!(first.config_dir.join("remote.json").is_file());
        assert!(first.logs_dir.is_dir());
        assert!(first.database_path.is_file());

        let second = bootstrap_workspace(&workspace.path).expect("second bootstrap");
        assert_eq!(second.database_path, first.database_path);
    }

    #[test]
    fn rejects_config_with_unknown_schema() {
        let workspace = TempWorkspace::new();
        let config_dir = workspace.path.join("config");
        fs::create_dir_all(&config_dir).expect("config dir");
        fs::write(config_dir.join("engine.json"), r#"{"schema": 7}"#).expect("write config");

        let error = bootstrap_workspace(&workspace.path).expect_err("schema mismatch");
        assert!(matches!(error, InfraError::InvalidConfig(_)));
    }
}
