use crate::domain::models::{
    next_id, system_clock, timer_id_for, NowProvider, RemoteTimerDocument, TaskAggregate,
    TimeLogEntry, TimeLogSource, TimerInterval, TimerStatus,
};
use crate::domain::intervals;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::timer_gateway::{
    ManualEntryCommit, ManualEntryRequest, RemoteChange, RemoteTimerGateway, StopCommit,
    StopCommitRequest, SubscriptionScope, TimerPatch, TimerSubscription,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

struct Subscriber {
    scope: SubscriptionScope,
    sender: mpsc::UnboundedSender<RemoteChange>,
}

#[derive(Default)]
struct GatewayState {
    timers: HashMap<String, RemoteTimerDocument>,
    aggregates: HashMap<String, TaskAggregate>,
    time_logs: Vec<TimeLogEntry>,
    subscribers: Vec<Subscriber>,
    scripted_failures: HashMap<&'static str, VecDeque<InfraError>>,
    calls: HashMap<&'static str, usize>,
}

impl GatewayState {
    fn notify(&mut self, change: RemoteChange) {
        self.subscribers
            .retain(|subscriber| !subscriber.sender.is_closed());
        let (timer_id, task_id, user_id) = match &change {
            RemoteChange::Upserted(document) => {
                (&document.timer_id, &document.task_id, &document.user_id)
            }
            RemoteChange::Removed {
                timer_id,
                task_id,
                user_id,
            } => (timer_id, task_id, user_id),
        };
        for subscriber in &self.subscribers {
            if subscriber.scope.matches(timer_id, task_id, user_id) {
                let _ = subscriber.sender.send(change.clone());
            }
        }
    }

    /// Counts the call and pops the next scripted failure for `operation`.
    fn begin(&mut self, operation: &'static str) -> Result<(), InfraError> {
        *self.calls.entry(operation).or_insert(0) += 1;
        match self
            .scripted_failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn timer_mut(&mut self, timer_id: &str) -> Result<&mut RemoteTimerDocument, InfraError> {
        self.timers
            .get_mut(timer_id)
            .ok_or_else(|| InfraError::DocumentNotFound(timer_id.to_string()))
    }
}

/// Complete in-process document store: server timestamps come from the
/// injected clock and every batch is applied under a single lock.
pub struct InMemoryTimerGateway {
    state: Mutex<GatewayState>,
    now_provider: NowProvider,
}

impl Default for InMemoryTimerGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTimerGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GatewayState::default()),
            now_provider: system_clock(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, GatewayState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::lock_poisoned("in-memory gateway", error))
    }

    pub fn insert_task(&self, task_id: &str) -> Result<(), InfraError> {
        self.lock()?
            .aggregates
            .entry(task_id.to_string())
            .or_insert_with(|| TaskAggregate::new(task_id));
        Ok(())
    }

    /// Writes a document as another device would, notifying subscribers.
    pub fn put_timer(&self, document: RemoteTimerDocument) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state
            .timers
            .insert(document.timer_id.clone(), document.clone());
        state.notify(RemoteChange::Upserted(document));
        Ok(())
    }

    /// Removes a document without going through the call accounting.
    pub fn remove_timer(&self, timer_id: &str) -> Result<Option<RemoteTimerDocument>, InfraError> {
        let mut state = self.lock()?;
        let removed = state.timers.remove(timer_id);
        if let Some(document) = &removed {
            state.notify(RemoteChange::Removed {
                timer_id: document.timer_id.clone(),
                task_id: document.task_id.clone(),
                user_id: document.user_id.clone(),
            });
        }
        Ok(removed)
    }

    /// Makes the next calls of `operation` fail with `errors`, in order.
    pub fn script_failures(
        &self,
        operation: &'static str,
        errors: Vec<InfraError>,
    ) -> Result<(), InfraError> {
        self.lock()?
            .scripted_failures
            .entry(operation)
            .or_default()
            .extend(errors);
        Ok(())
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.lock()
            .map(|state| state.calls.get(operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn time_logs(&self) -> Result<Vec<TimeLogEntry>, InfraError> {
        Ok(self.lock()?.time_logs.clone())
    }

    pub fn timer_count(&self) -> Result<usize, InfraError> {
        Ok(self.lock()?.timers.len())
    }
}

fn check_interval(interval: &TimerInterval) -> Result<(), InfraError> {
    interval
        .validate()
        .map_err(|message| InfraError::Rejected(format!("invalid interval: {message}")))
}

#[async_trait]
impl RemoteTimerGateway for InMemoryTimerGateway {
    async fn create_timer(
        &self,
        user_id: &str,
        task_id: &str,
        device_id: &str,
    ) -> Result<String, InfraError> {
        let now = (self.now_provider)();
        let mut state = self.lock()?;
        state.begin("create_timer")?;

        let mut created_at_ms = now.timestamp_millis();
        let mut timer_id = timer_id_for(user_id, task_id, created_at_ms);
        while state.timers.contains_key(&timer_id) {
            created_at_ms += 1;
            timer_id = timer_id_for(user_id, task_id, created_at_ms);
        }

        let document = RemoteTimerDocument {
            timer_id: timer_id.clone(),
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            status: TimerStatus::Idle,
            started_at: None,
            paused_at: None,
            accumulated_seconds: 0,
            intervals: Vec::new(),
            device_id: Some(device_id.to_string()),
            created_at: now,
            updated_at: now,
            last_sync: now,
        };
        state.timers.insert(timer_id.clone(), document.clone());
        state.notify(RemoteChange::Upserted(document));
        Ok(timer_id)
    }

    async fn get_timer(&self, timer_id: &str) -> Result<Option<RemoteTimerDocument>, InfraError> {
        let mut state = self.lock()?;
        state.begin("get_timer")?;
        Ok(state.timers.get(timer_id).cloned())
    }

    async fn update_timer(&self, timer_id: &str, patch: &TimerPatch) -> Result<(), InfraError> {
        let now = (self.now_provider)();
        let mut state = self.lock()?;
        state.begin("update_timer")?;
        if let Some(intervals) = &patch.intervals {
            intervals.iter().try_for_each(check_interval)?;
        }

        let document = state.timer_mut(timer_id)?;
        if let Some(status) = patch.status {
            document.status = status;
        }
        if let Some(seconds) = patch.accumulated_seconds {
            document.accumulated_seconds = seconds;
        }
        if let Some(intervals) = &patch.intervals {
            document.intervals = intervals.clone();
        }
        if let Some(device_id) = &patch.device_id {
            document.device_id = Some(device_id.clone());
        }
        document.updated_at = now;
        document.last_sync = now;
        let updated = document.clone();
        state.notify(RemoteChange::Upserted(updated));
        Ok(())
    }

    async fn delete_timer(&self, timer_id: &str) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state.begin("delete_timer")?;
        let document = state
            .timers
            .remove(timer_id)
            .ok_or_else(|| InfraError::DocumentNotFound(timer_id.to_string()))?;
        state.notify(RemoteChange::Removed {
            timer_id: document.timer_id,
            task_id: document.task_id,
            user_id: document.user_id,
        });
        Ok(())
    }

    async fn list_active_timers(
        &self,
        user_id: &str,
        task_ids: &[String],
    ) -> Result<Vec<RemoteTimerDocument>, InfraError> {
        let mut state = self.lock()?;
        state.begin("list_active_timers")?;
        let mut active: Vec<RemoteTimerDocument> = state
            .timers
            .values()
            .filter(|document| {
                document.user_id == user_id
                    && document.is_active()
                    && task_ids.iter().any(|id| id == &document.task_id)
            })
            .cloned()
            .collect();
        active.sort_by(|left, right| left.timer_id.cmp(&right.timer_id));
        Ok(active)
    }

    async fn start_atomic(
        &self,
        timer_id: &str,
        device_id: &str,
    ) -> Result<RemoteTimerDocument, InfraError> {
        let now = (self.now_provider)();
        let mut state = self.lock()?;
        state.begin("start_atomic")?;
        let document = state.timer_mut(timer_id)?;
        document.status = TimerStatus::Running;
        document.started_at = Some(now);
        document.paused_at = None;
        document.device_id = Some(device_id.to_string());
        document.updated_at = now;
        document.last_sync = now;
        let started = document.clone();
        state.notify(RemoteChange::Upserted(started.clone()));
        Ok(started)
    }

    async fn pause_atomic(
        &self,
        timer_id: &str,
        interval: &TimerInterval,
        device_id: &str,
    ) -> Result<RemoteTimerDocument, InfraError> {
        let now = (self.now_provider)();
        let mut state = self.lock()?;
        state.begin("pause_atomic")?;
        check_interval(interval)?;
        let document = state.timer_mut(timer_id)?;
        document.status = TimerStatus::Paused;
        document.started_at = None;
        document.paused_at = Some(now);
        document.accumulated_seconds = document
            .accumulated_seconds
            .saturating_add(interval.duration_seconds);
        document.intervals.push(interval.clone());
        document.device_id = Some(device_id.to_string());
        document.updated_at = now;
        document.last_sync = now;
        let paused = document.clone();
        state.notify(RemoteChange::Upserted(paused.clone()));
        Ok(paused)
    }

    async fn stop_and_aggregate_atomic(
        &self,
        request: &StopCommitRequest,
    ) -> Result<StopCommit, InfraError> {
        let now = (self.now_provider)();
        let mut state = self.lock()?;
        state.begin("stop_and_aggregate_atomic")?;

        // Every precondition is checked before the first write.
        let document = state
            .timers
            .get(&request.timer_id)
            .cloned()
            .ok_or_else(|| InfraError::DocumentNotFound(request.timer_id.clone()))?;
        if !state.aggregates.contains_key(&request.task_id) {
            return Err(InfraError::TaskAggregateMissing(request.task_id.clone()));
        }
        if let Some(interval) = &request.final_interval {
            check_interval(interval)?;
        }
        let final_seconds = request
            .final_interval
            .as_ref()
            .map(|interval| interval.duration_seconds)
            .unwrap_or(0);
        let total_seconds = document.accumulated_seconds.saturating_add(final_seconds);
        if total_seconds <= 0 {
            return Err(InfraError::Rejected(format!(
                "timer {} has no recorded time",
                request.timer_id
            )));
        }

        let mut sessions = document.intervals.clone();
        sessions.extend(request.final_interval.clone());
        let merged = intervals::merge_intervals(&sessions);
        let log_entry = TimeLogEntry {
            id: next_id("log"),
            task_id: request.task_id.clone(),
            user_id: request.user_id.clone(),
            timer_id: Some(request.timer_id.clone()),
            seconds: total_seconds,
            started_at: merged.first().map(|interval| interval.start),
            ended_at: merged.last().map(|interval| interval.end),
            source: TimeLogSource::TimerSession,
            note: None,
            created_at: now,
        };

        state.timers.remove(&request.timer_id);
        let aggregate = match state.aggregates.get_mut(&request.task_id) {
            Some(aggregate) => {
                aggregate.apply_seconds(&request.user_id, total_seconds);
                aggregate.clone()
            }
            None => return Err(InfraError::TaskAggregateMissing(request.task_id.clone())),
        };
        state.time_logs.push(log_entry.clone());
        state.notify(RemoteChange::Removed {
            timer_id: document.timer_id,
            task_id: document.task_id,
            user_id: document.user_id,
        });

        Ok(StopCommit {
            total_seconds,
            log_entry,
            aggregate,
        })
    }

    async fn commit_manual_entry_atomic(
        &self,
        request: &ManualEntryRequest,
    ) -> Result<ManualEntryCommit, InfraError> {
        let now = (self.now_provider)();
        let mut state = self.lock()?;
        state.begin("commit_manual_entry_atomic")?;
        if request.seconds <= 0 || !intervals::is_plausible(request.seconds) {
            return Err(InfraError::Rejected(format!(
                "manual entry of {} seconds is not plausible",
                request.seconds
            )));
        }

        let log_entry = TimeLogEntry {
            id: next_id("log"),
            task_id: request.task_id.clone(),
            user_id: request.user_id.clone(),
            timer_id: None,
            seconds: request.seconds,
            started_at: None,
            ended_at: None,
            source: TimeLogSource::Manual,
            note: request.note.clone(),
            created_at: now,
        };
        let aggregate = state
            .aggregates
            .get_mut(&request.task_id)
            .ok_or_else(|| InfraError::TaskAggregateMissing(request.task_id.clone()))?;
        aggregate.apply_seconds(&request.user_id, request.seconds);
        let aggregate = aggregate.clone();
        state.time_logs.push(log_entry.clone());

        Ok(ManualEntryCommit {
            log_entry,
            aggregate,
        })
    }

    async fn get_task_aggregate(
        &self,
        task_id: &str,
    ) -> Result<Option<TaskAggregate>, InfraError> {
        let mut state = self.lock()?;
        state.begin("get_task_aggregate")?;
        Ok(state.aggregates.get(task_id).cloned())
    }

    async fn subscribe(&self, scope: SubscriptionScope) -> Result<TimerSubscription, InfraError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock()?;
        state.begin("subscribe")?;
        state.subscribers.push(Subscriber { scope, sender });
        Ok(TimerSubscription::new(receiver))
    }
}
