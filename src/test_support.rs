use crate::domain::models::NowProvider;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::timer_state_repository::{
    InMemoryTimerStateRepository, PersistedTimerTable, TimerStateRepository,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub fn fixed_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .expect("valid datetime")
        .with_timezone(&Utc)
}

/// Clock that only moves when a test advances it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(fixed_time("2026-02-16T09:00:00Z"))
    }
}

impl ManualClock {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }

    pub fn advance_seconds(&self, seconds: i64) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += Duration::seconds(seconds);
    }

    pub fn provider(&self) -> NowProvider {
        let now = Arc::clone(&self.now);
        Arc::new(move || *now.lock().expect("clock lock poisoned"))
    }
}

/// In-memory repository whose saves can be switched to fail.
#[derive(Default)]
pub struct FlakyRepository {
    inner: InMemoryTimerStateRepository,
    failing: AtomicBool,
}

impl FlakyRepository {
    pub fn fail_saves(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl TimerStateRepository for FlakyRepository {
    fn load(&self, owner_id: &str) -> Result<Option<PersistedTimerTable>, InfraError> {
        self.inner.load(owner_id)
    }

    fn save(&self, owner_id: &str, table: &PersistedTimerTable) -> Result<(), InfraError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(InfraError::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(owner_id, table)
    }
}
