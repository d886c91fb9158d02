use crate::domain::models::{system_clock, NowProvider};
use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const ACTIVITY_LOG_FILE: &str = "timer-actions.log";

pub struct ActivityLog {
    path: PathBuf,
    log_guard: Mutex<()>,
    now_provider: NowProvider,
}

impl ActivityLog {
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            path: logs_dir.join(ACTIVITY_LOG_FILE),
            log_guard: Mutex::new(()),
            now_provider: system_clock(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, action: &str, message: &str) {
        tracing::info!(action, message);
        self.append("info", action, message);
    }

    pub fn warn(&self, action: &str, message: &str) {
        tracing::warn!(action, message);
        self.append("warn", action, message);
    }

    pub fn error(&self, action: &str, message: &str) {
        tracing::error!(action, message);
        self.append("error", action, message);
    }

    /// Logs `error` against `action` and hands it back for propagation.
    pub fn action_error<E: Display>(&self, action: &str, error: E) -> E {
        self.error(action, &error.to_string());
        error
    }

    fn append(&self, level: &str, action: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let payload = serde_json::json!({
            "timestamp": (self.now_provider)().to_rfc3339(),
            "level": level,
            "action": action,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(file, "{payload}");
        }
    }
}
