use crate::domain::models::{LocalTimerState, TimerInterval, TimerStatus};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const PERSISTED_SCHEMA: u8 = 1;

/// On-disk shape of the active-timer table. Timestamps are RFC 3339 strings and
/// the initialized-task set is an explicit sorted list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTimerTable {
    pub schema: u8,
    pub timers: Vec<PersistedTimer>,
    pub initialized_tasks: Vec<String>,
}

impl Default for PersistedTimerTable {
    fn default() -> Self {
        Self {
            schema: PERSISTED_SCHEMA,
            timers: Vec::new(),
            initialized_tasks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTimer {
    pub timer_id: String,
    pub task_id: String,
    pub user_id: String,
    pub status: String,
    pub started_at: Option<String>,
    pub paused_at: Option<String>,
    pub accumulated_seconds: i64,
    pub intervals: Vec<PersistedInterval>,
    pub last_sync_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedInterval {
    pub start: String,
    pub end: String,
    pub duration_seconds: i64,
}

impl PersistedTimer {
    pub fn from_state(state: &LocalTimerState) -> Self {
        Self {
            timer_id: state.timer_id.clone(),
            task_id: state.task_id.clone(),
            user_id: state.user_id.clone(),
            status: state.status.as_str().to_string(),
            started_at: state.started_at.map(|value| value.to_rfc3339()),
            paused_at: state.paused_at.map(|value| value.to_rfc3339()),
            accumulated_seconds: state.accumulated_seconds,
            intervals: state
                .intervals
                .iter()
                .map(|interval| PersistedInterval {
                    start: interval.start.to_rfc3339(),
                    end: interval.end.to_rfc3339(),
                    duration_seconds: interval.duration_seconds,
                })
                .collect(),
            last_sync_time: state.last_sync_time.map(|value| value.to_rfc3339()),
        }
    }

    pub fn to_state(&self) -> Result<LocalTimerState, InfraError> {
        let status = TimerStatus::parse(&self.status).ok_or_else(|| {
            InfraError::CorruptState(format!(
                "invalid persisted status '{}' for timer {}",
                self.status, self.timer_id
            ))
        })?;
        let intervals = self
            .intervals
            .iter()
            .map(|interval| {
                Ok(TimerInterval {
                    start: parse_timestamp(&interval.start, "interval.start")?,
                    end: parse_timestamp(&interval.end, "interval.end")?,
                    duration_seconds: interval.duration_seconds,
                })
            })
            .collect::<Result<Vec<_>, InfraError>>()?;

        Ok(LocalTimerState {
            timer_id: self.timer_id.clone(),
            task_id: self.task_id.clone(),
            user_id: self.user_id.clone(),
            status,
            started_at: parse_optional_timestamp(self.started_at.as_deref(), "started_at")?,
            paused_at: parse_optional_timestamp(self.paused_at.as_deref(), "paused_at")?,
            accumulated_seconds: self.accumulated_seconds,
            intervals,
            last_sync_time: parse_optional_timestamp(
                self.last_sync_time.as_deref(),
                "last_sync_time",
            )?,
        })
    }
}

fn parse_timestamp(raw: &str, field_name: &str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| {
            InfraError::CorruptState(format!("invalid persisted {field_name} '{raw}': {error}"))
        })
}

fn parse_optional_timestamp(
    raw: Option<&str>,
    field_name: &str,
) -> Result<Option<DateTime<Utc>>, InfraError> {
    raw.map(|value| parse_timestamp(value, field_name)).transpose()
}

pub trait TimerStateRepository: Send + Sync {
    fn load(&self, owner_id: &str) -> Result<Option<PersistedTimerTable>, InfraError>;
    fn save(&self, owner_id: &str, table: &PersistedTimerTable) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteTimerStateRepository {
    db_path: PathBuf,
}

impl SqliteTimerStateRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }
}

impl TimerStateRepository for SqliteTimerStateRepository {
    fn load(&self, owner_id: &str) -> Result<Option<PersistedTimerTable>, InfraError> {
        let connection = open_connection(&self.db_path)?;
        let payload: Option<String> = connection
            .query_row(
                "SELECT payload FROM timer_state WHERE owner_id = ?1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        let table: PersistedTimerTable = serde_json::from_str(&payload)?;
        if table.schema != PERSISTED_SCHEMA {
            return Err(InfraError::CorruptState(format!(
                "unsupported timer_state schema {} for owner {owner_id}",
                table.schema
            )));
        }
        Ok(Some(table))
    }

    fn save(&self, owner_id: &str, table: &PersistedTimerTable) -> Result<(), InfraError> {
        let connection = open_connection(&self.db_path)?;
        let payload = serde_json::to_string(table)?;
        connection.execute(
            "INSERT INTO timer_state (owner_id, payload, saved_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(owner_id) DO UPDATE SET
               payload = excluded.payload,
               saved_at = excluded.saved_at",
            params![owner_id, payload, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTimerStateRepository {
    tables: Mutex<HashMap<String, PersistedTimerTable>>,
}

impl TimerStateRepository for InMemoryTimerStateRepository {
    fn load(&self, owner_id: &str) -> Result<Option<PersistedTimerTable>, InfraError> {
        let tables = self
            .tables
            .lock()
            .map_err(|error| InfraError::lock_poisoned("timer state", error))?;
        Ok(tables.get(owner_id).cloned())
    }

    fn save(&self, owner_id: &str, table: &PersistedTimerTable) -> Result<(), InfraError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|error| InfraError::lock_poisoned("timer state", error))?;
        tables.insert(owner_id.to_string(), table.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::initialize_database;
    use chrono::Duration;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_DB: AtomicUsize = AtomicUsize::new(0);

    struct TempDatabase {
        dir: PathBuf,
        path: PathBuf,
    }

    impl TempDatabase {
        fn new() -> Self {
            let sequence = NEXT_TEMP_DB.fetch_add(1, Ordering::Relaxed);
            let dir = std::env::temp_dir().join(format!(
                "tasktimer-repo-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&dir).expect("create temp dir");
            let path = dir.join("state.sqlite");
            initialize_database(&path).expect("initialize database");
            Self { dir, path }
        }
    }

    impl Drop for TempDatabase {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn sample_state() -> LocalTimerState {
        // Sub-millisecond precision must survive the round trip.
        let started = DateTime::parse_from_rfc3339("2026-02-16T09:00:00.123456789Z")
            .expect("valid datetime")
            .with_timezone(&Utc);
        let mut state = LocalTimerState::new("usr-1_tsk-1_1", "tsk-1", "usr-1");
        state.status = TimerStatus::Running;
        state.started_at = Some(started + Duration::seconds(300));
        state.accumulated_seconds = 125;
        state.intervals.push(TimerInterval {
            start: started,
            end: started + Duration::seconds(125),
            duration_seconds: 125,
        });
        state.last_sync_time = Some(started);
        state
    }

    fn sample_table() -> PersistedTimerTable {
        PersistedTimerTable {
            schema: PERSISTED_SCHEMA,
            timers: vec![PersistedTimer::from_state(&sample_state())],
            initialized_tasks: vec!["tsk-1".to_string(), "tsk-2".to_string()],
        }
    }

    #[test]
    fn persisted_timer_roundtrips_exactly() {
        let state = sample_state();
        let restored = PersistedTimer::from_state(&state)
            .to_state()
            .expect("restore state");
        assert_eq!(restored, state);
    }

    #[test]
    fn invalid_timestamps_are_reported() {
        let mut persisted = PersistedTimer::from_state(&sample_state());
        persisted.started_at = Some("yesterday".to_string());
        assert!(matches!(persisted.to_state(), Err(InfraError::CorruptState(_))));
    }

    #[test]
    fn sqlite_repository_roundtrip_and_overwrite() {
        let database = TempDatabase::new();
        let repository = SqliteTimerStateRepository::new(&database.path);

        assert!(repository.load("usr-1").expect("load empty").is_none());
        repository.save("usr-1", &sample_table()).expect("save table");
        assert_eq!(
            repository.load("usr-1").expect("load table"),
            Some(sample_table())
        );

        repository
            .save("usr-1", &PersistedTimerTable::default())
            .expect("overwrite table");
        let loaded = repository.load("usr-1").expect("load").expect("table exists");
        assert!(loaded.timers.is_empty());
        assert!(repository.load("usr-2").expect("load other owner").is_none());
    }

    #[test]
    fn in_memory_repository_roundtrip() {
        let repository = InMemoryTimerStateRepository::default();
        repository.save("usr-1", &sample_table()).expect("save");
        assert_eq!(repository.load("usr-1").expect("load"), Some(sample_table()));
    }
}
