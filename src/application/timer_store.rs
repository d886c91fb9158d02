use crate::domain::intervals::elapsed_seconds;
use crate::domain::models::{LocalTimerState, TimerInterval, TimerStatus};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::timer_state_repository::{
    PersistedTimer, PersistedTimerTable, TimerStateRepository, PERSISTED_SCHEMA,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Clone, Default)]
struct StoreState {
    timers: BTreeMap<String, LocalTimerState>,
    initialized_tasks: BTreeSet<String>,
    globally_initialized: bool,
}

impl StoreState {
    fn to_table(&self) -> PersistedTimerTable {
        PersistedTimerTable {
            schema: PERSISTED_SCHEMA,
            timers: self.timers.values().map(PersistedTimer::from_state).collect(),
            initialized_tasks: self.initialized_tasks.iter().cloned().collect(),
        }
    }
}

pub struct TimerStateStore {
    owner_id: String,
    repository: Arc<dyn TimerStateRepository>,
    state: Mutex<StoreState>,
    revision: watch::Sender<u64>,
}

impl TimerStateStore {
    pub fn new(owner_id: impl Into<String>, repository: Arc<dyn TimerStateRepository>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            owner_id: owner_id.into(),
            repository,
            state: Mutex::new(StoreState::default()),
            revision,
        }
    }

    /// Loads the persisted table for `owner_id`. Entries that fail to decode
    /// or validate are dropped. The global-initialized flag always starts false.
    pub fn restore(
        owner_id: impl Into<String>,
        repository: Arc<dyn TimerStateRepository>,
    ) -> Result<Self, InfraError> {
        let store = Self::new(owner_id, repository);
        let Some(table) = store.repository.load(&store.owner_id)? else {
            return Ok(store);
        };

        {
            let mut state = store.lock()?;
            for persisted in &table.timers {
                match persisted.to_state() {
                    Ok(timer) if timer.status.is_active() && timer.validate().is_ok() => {
                        state.timers.insert(timer.task_id.clone(), timer);
                    }
                    Ok(timer) => {
                        tracing::warn!(timer_id = %timer.timer_id, "dropping invalid persisted timer");
                    }
                    Err(error) => {
                        tracing::warn!(timer_id = %persisted.timer_id, %error, "dropping unreadable persisted timer");
                    }
                }
            }
            state.initialized_tasks = table.initialized_tasks.into_iter().collect();
        }
        Ok(store)
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::lock_poisoned("timer state store", error))
    }

    /// Applies `mutate` to a copy of the table that replaces the live table
    /// once it has been saved.
    fn mutate<T>(
        &self,
        mutate: impl FnOnce(&mut StoreState) -> (T, bool),
    ) -> Result<T, InfraError> {
        let mut state = self.lock()?;
        let mut next = state.clone();
        let (result, changed) = mutate(&mut next);
        if changed {
            self.repository.save(&self.owner_id, &next.to_table())?;
            *state = next;
            drop(state);
            self.revision.send_modify(|revision| *revision += 1);
        }
        Ok(result)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<LocalTimerState>, InfraError> {
        Ok(self.lock()?.timers.get(task_id).cloned())
    }

    /// Stores `timer` under its task. Idle or stopped states remove the entry.
    pub fn set_timer_state(&self, timer: LocalTimerState) -> Result<(), InfraError> {
        self.mutate(|state| {
            if timer.status.is_active() {
                state.timers.insert(timer.task_id.clone(), timer);
                ((), true)
            } else {
                let removed = state.timers.remove(&timer.task_id).is_some();
                ((), removed)
            }
        })
    }

    /// Appends a closed interval and adds its duration to the accumulated
    /// total. Returns `false` when the task has no entry.
    pub fn append_interval(
        &self,
        task_id: &str,
        interval: TimerInterval,
    ) -> Result<bool, InfraError> {
        self.mutate(|state| match state.timers.get_mut(task_id) {
            Some(timer) => {
                timer.accumulated_seconds = timer
                    .accumulated_seconds
                    .saturating_add(interval.duration_seconds);
                timer.intervals.push(interval);
                (true, true)
            }
            None => (false, false),
        })
    }

    pub fn clear(&self, task_id: &str) -> Result<Option<LocalTimerState>, InfraError> {
        self.mutate(|state| {
            let removed = state.timers.remove(task_id);
            let changed = removed.is_some();
            (removed, changed)
        })
    }

    pub fn bulk_apply(&self, timers: Vec<LocalTimerState>) -> Result<usize, InfraError> {
        self.mutate(|state| {
            let mut applied = 0;
            for timer in timers {
                if timer.status.is_active() {
                    state.timers.insert(timer.task_id.clone(), timer);
                    applied += 1;
                }
            }
            (applied, applied > 0)
        })
    }

    pub fn all_active_timers(&self) -> Result<Vec<LocalTimerState>, InfraError> {
        Ok(self.lock()?.timers.values().cloned().collect())
    }

    pub fn running_timer_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<LocalTimerState>, InfraError> {
        Ok(self
            .lock()?
            .timers
            .values()
            .find(|timer| timer.user_id == user_id && timer.status == TimerStatus::Running)
            .cloned())
    }

    pub fn is_running(&self, task_id: &str) -> Result<bool, InfraError> {
        Ok(self
            .lock()?
            .timers
            .get(task_id)
            .is_some_and(LocalTimerState::is_running))
    }

    pub fn display_seconds(&self, task_id: &str, now: DateTime<Utc>) -> Result<i64, InfraError> {
        let state = self.lock()?;
        let Some(timer) = state.timers.get(task_id) else {
            return Ok(0);
        };
        let running = match (timer.status, timer.started_at) {
            (TimerStatus::Running, Some(started_at)) => elapsed_seconds(started_at, now),
            _ => 0,
        };
        Ok(timer.accumulated_seconds.saturating_add(running))
    }

    pub fn mark_task_initialized(&self, task_id: &str) -> Result<(), InfraError> {
        self.mutate(|state| ((), state.initialized_tasks.insert(task_id.to_string())))
    }

    pub fn is_task_initialized(&self, task_id: &str) -> Result<bool, InfraError> {
        Ok(self.lock()?.initialized_tasks.contains(task_id))
    }

    pub fn mark_globally_initialized(&self) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        let changed = !state.globally_initialized;
        state.globally_initialized = true;
        drop(state);
        if changed {
            self.revision.send_modify(|revision| *revision += 1);
        }
        Ok(())
    }

    pub fn is_globally_initialized(&self) -> Result<bool, InfraError> {
        Ok(self.lock()?.globally_initialized)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }
}
