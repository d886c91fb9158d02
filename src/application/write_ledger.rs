use crate::domain::models::{system_clock, NowProvider};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerFailure {
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub pending: Vec<String>,
    pub errors: BTreeMap<String, TimerFailure>,
}

#[derive(Debug, Default)]
struct LedgerState {
    pending: BTreeSet<String>,
    errors: BTreeMap<String, TimerFailure>,
}

pub struct WriteLedger {
    state: Mutex<LedgerState>,
    now_provider: NowProvider,
}

impl Default for WriteLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            now_provider: system_clock(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::lock_poisoned("write ledger", error))
    }

    pub fn apply_optimistic(&self, timer_id: &str) -> Result<(), InfraError> {
        self.lock()?.pending.insert(timer_id.to_string());
        Ok(())
    }

    /// Clears both the pending mark and any earlier failure.
    pub fn confirm(&self, timer_id: &str) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state.pending.remove(timer_id);
        state.errors.remove(timer_id);
        Ok(())
    }

    pub fn reject(&self, timer_id: &str, message: &str, retryable: bool) -> Result<(), InfraError> {
        let occurred_at = (self.now_provider)();
        let mut state = self.lock()?;
        state.pending.remove(timer_id);
        state.errors.insert(
            timer_id.to_string(),
            TimerFailure {
                message: message.to_string(),
                occurred_at,
                retryable,
            },
        );
        Ok(())
    }

    pub fn clear(&self, timer_id: &str) -> Result<(), InfraError> {
        self.confirm(timer_id)
    }

    pub fn is_pending(&self, timer_id: &str) -> Result<bool, InfraError> {
        Ok(self.lock()?.pending.contains(timer_id))
    }

    pub fn error_for(&self, timer_id: &str) -> Result<Option<TimerFailure>, InfraError> {
        Ok(self.lock()?.errors.get(timer_id).cloned())
    }

    pub fn clear_errors(&self) -> Result<usize, InfraError> {
        let mut state = self.lock()?;
        let cleared = state.errors.len();
        state.errors.clear();
        Ok(cleared)
    }

    pub fn snapshot(&self) -> Result<LedgerSnapshot, InfraError> {
        let state = self.lock()?;
        Ok(LedgerSnapshot {
            pending: state.pending.iter().cloned().collect(),
            errors: state.errors.clone(),
        })
    }
}
