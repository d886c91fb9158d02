use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> NowProvider {
    Arc::new(Utc::now)
}

/// Longest span a single interval may cover before it is treated as implausible.
pub const MAX_INTERVAL_SECONDS: i64 = 86_400;

const SECONDS_PER_HOUR: f64 = 3_600.0;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_id(prefix: &str) -> String {
    let sequence = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Utc::now().timestamp_micros())
}

/// Deterministic remote key for a timer created by `user_id` on `task_id` at
/// `created_at_ms` (epoch millis).
pub fn timer_id_for(user_id: &str, task_id: &str, created_at_ms: i64) -> String {
    format!("{}_{}_{created_at_ms}", user_id.trim(), task_id.trim())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl TimerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    /// Only running and paused timers occupy an entry in the local table.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimerInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_seconds: i64,
}

impl TimerInterval {
    pub fn validate(&self) -> Result<(), String> {
        if self.end < self.start {
            return Err("interval.end must be >= interval.start".to_string());
        }
        if self.duration_seconds < 0 {
            return Err("interval.duration_seconds must be >= 0".to_string());
        }
        if self.duration_seconds > MAX_INTERVAL_SECONDS {
            return Err(format!(
                "interval.duration_seconds must be <= {MAX_INTERVAL_SECONDS}"
            ));
        }
        let span = (self.end - self.start).num_seconds();
        if (span - self.duration_seconds).abs() > 1 {
            return Err(format!(
                "interval.duration_seconds {} does not match span {span}",
                self.duration_seconds
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalTimerState {
    pub timer_id: String,
    pub task_id: String,
    pub user_id: String,
    pub status: TimerStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub accumulated_seconds: i64,
    pub intervals: Vec<TimerInterval>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl LocalTimerState {
    pub fn new(
        timer_id: impl Into<String>,
        task_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            timer_id: timer_id.into(),
            task_id: task_id.into(),
            user_id: user_id.into(),
            status: TimerStatus::Idle,
            started_at: None,
            paused_at: None,
            accumulated_seconds: 0,
            intervals: Vec::new(),
            last_sync_time: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == TimerStatus::Running
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.timer_id, "timer.timer_id")?;
        validate_non_empty(&self.task_id, "timer.task_id")?;
        validate_non_empty(&self.user_id, "timer.user_id")?;
        if self.accumulated_seconds < 0 {
            return Err("timer.accumulated_seconds must be >= 0".to_string());
        }
        if self.status == TimerStatus::Running && self.started_at.is_none() {
            return Err("running timer requires started_at".to_string());
        }
        for interval in &self.intervals {
            interval.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTimerDocument {
    pub timer_id: String,
    pub task_id: String,
    pub user_id: String,
    pub status: TimerStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub accumulated_seconds: i64,
    pub intervals: Vec<TimerInterval>,
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_sync: DateTime<Utc>,
}

impl RemoteTimerDocument {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn written_by(&self, device_id: &str) -> bool {
        self.device_id.as_deref() == Some(device_id)
    }

    pub fn to_local_state(&self, synced_at: DateTime<Utc>) -> LocalTimerState {
        LocalTimerState {
            timer_id: self.timer_id.clone(),
            task_id: self.task_id.clone(),
            user_id: self.user_id.clone(),
            status: self.status,
            started_at: self.started_at,
            paused_at: self.paused_at,
            accumulated_seconds: self.accumulated_seconds,
            intervals: self.intervals.clone(),
            last_sync_time: Some(synced_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskAggregate {
    pub task_id: String,
    pub total_seconds: i64,
    pub total_hours: f64,
    pub total_minutes: i64,
    pub member_seconds: BTreeMap<String, i64>,
    pub member_hours: BTreeMap<String, f64>,
}

impl TaskAggregate {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Self::default()
        }
    }

    /// Adds `seconds` for `user_id` and recomputes the derived hour/minute fields
    /// from the exact second counters.
    pub fn apply_seconds(&mut self, user_id: &str, seconds: i64) {
        self.total_seconds = self.total_seconds.saturating_add(seconds);
        self.total_hours = self.total_seconds as f64 / SECONDS_PER_HOUR;
        self.total_minutes = self.total_seconds / 60;

        let member_total = self
            .member_seconds
            .entry(user_id.to_string())
            .or_insert(0);
        *member_total = member_total.saturating_add(seconds);
        let member_hours = *member_total as f64 / SECONDS_PER_HOUR;
        self.member_hours.insert(user_id.to_string(), member_hours);
    }

    pub fn hours_for(&self, user_id: &str) -> f64 {
        self.member_hours.get(user_id).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeLogSource {
    TimerSession,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeLogEntry {
    pub id: String,
    pub task_id: String,
    pub user_id: String,
    pub timer_id: Option<String>,
    pub seconds: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub source: TimeLogSource,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TimeLogEntry {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "time_log.id")?;
        validate_non_empty(&self.task_id, "time_log.task_id")?;
        validate_non_empty(&self.user_id, "time_log.user_id")?;
        if self.seconds <= 0 {
            return Err("time_log.seconds must be > 0".to_string());
        }
        if let (Some(started_at), Some(ended_at)) = (self.started_at, self.ended_at) {
            if ended_at < started_at {
                return Err("time_log.ended_at must be >= time_log.started_at".to_string());
            }
        }
        Ok(())
    }
}

pub fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
