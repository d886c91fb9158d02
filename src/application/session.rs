use crate::application::bootstrap::BootstrapResult;
use crate::application::confirmation::{ChannelConfirmer, ConfirmationPrompt, SwitchConfirmer};
use crate::application::error::TimerError;
use crate::application::retry::{RetryExecutor, RetryPolicy};
use crate::application::sync_coordinator::{RealtimeHandle, SyncCoordinator, SyncPhase, SyncReport};
use crate::application::timer_controller::{
    OrphanedSession, PauseOutcome, StartOutcome, StopOutcome, TimerController,
};
use crate::application::timer_store::TimerStateStore;
use crate::application::write_ledger::{TimerFailure, WriteLedger};
use crate::domain::intervals::{implausible_intervals, interval_stats, IntervalStats};
use crate::domain::models::{
    next_id, system_clock, validate_non_empty, LocalTimerState, NowProvider, RemoteTimerDocument,
};
use crate::infrastructure::activity_log::ActivityLog;
use crate::infrastructure::aggregate_mirror::TaskAggregateMirror;
use crate::infrastructure::config::{load_engine_config, EngineConfig};
use crate::infrastructure::document_cache::DocumentCache;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::timer_gateway::{ManualEntryCommit, RemoteTimerGateway};
use crate::infrastructure::timer_state_repository::SqliteTimerStateRepository;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerView {
    #[serde(flatten)]
    pub timer: LocalTimerState,
    pub display_seconds: i64,
    pub pending: bool,
    pub error: Option<TimerFailure>,
    pub stats: Option<IntervalStats>,
    /// Recorded sessions longer than a day, usually from a forgotten timer.
    pub implausible_sessions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub user_id: String,
    pub device_id: String,
    pub phase: SyncPhase,
    pub globally_initialized: bool,
    pub timers: Vec<TimerView>,
}

#[derive(Default)]
struct Background {
    realtime: Option<RealtimeHandle>,
    sweeper: Option<JoinHandle<()>>,
}

impl Background {
    fn stop(&mut self) {
        if let Some(realtime) = self.realtime.take() {
            realtime.stop();
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct TimeTrackingSession<G, M>
where
    G: RemoteTimerGateway + 'static,
    M: TaskAggregateMirror,
{
    user_id: String,
    config: EngineConfig,
    store: Arc<TimerStateStore>,
    ledger: Arc<WriteLedger>,
    cache: Arc<DocumentCache<RemoteTimerDocument>>,
    coordinator: Arc<SyncCoordinator<G>>,
    controller: TimerController<G, M>,
    activity: ActivityLog,
    background: Mutex<Background>,
    now_provider: NowProvider,
}

impl<G, M> TimeTrackingSession<G, M>
where
    G: RemoteTimerGateway + 'static,
    M: TaskAggregateMirror,
{
    pub fn open(
        workspace: &BootstrapResult,
        user_id: &str,
        gateway: Arc<G>,
        mirror: Arc<M>,
    ) -> Result<Self, InfraError> {
        Self::open_with_clock(workspace, user_id, gateway, mirror, system_clock())
    }

    /// Opens a session for `user_id`, restoring its persisted timer table
    /// from the workspace database. Every component shares `now_provider`.
    pub fn open_with_clock(
        workspace: &BootstrapResult,
        user_id: &str,
        gateway: Arc<G>,
        mirror: Arc<M>,
        now_provider: NowProvider,
    ) -> Result<Self, InfraError> {
        validate_non_empty(user_id, "user_id").map_err(InfraError::InvalidArgument)?;
        let config = load_engine_config(&workspace.config_dir)?;

        let repository = Arc::new(SqliteTimerStateRepository::new(&workspace.database_path));
        let store = Arc::new(TimerStateStore::restore(user_id, repository)?);
        let ledger = Arc::new(WriteLedger::new().with_now_provider(Arc::clone(&now_provider)));
        let cache = Arc::new(
            DocumentCache::new(config.cache_ttl()).with_now_provider(Arc::clone(&now_provider)),
        );
        let retry = RetryExecutor::new(RetryPolicy::from(&config.retry));
        let device_id = next_id("device");

        let coordinator = Arc::new(
            SyncCoordinator::new(
                Arc::clone(&gateway),
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::clone(&cache),
                device_id.clone(),
            )
            .with_retry(retry.clone())
            .with_now_provider(Arc::clone(&now_provider)),
        );
        let controller = TimerController::new(
            gateway,
            mirror,
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&cache),
            device_id,
        )
        .with_retry(retry)
        .with_now_provider(Arc::clone(&now_provider));

        let activity =
            ActivityLog::new(&workspace.logs_dir).with_now_provider(Arc::clone(&now_provider));
        activity.info(
            "open_session",
            &format!(
                "user_id={user_id} restored_timers={}",
                store.all_active_timers()?.len()
            ),
        );

        Ok(Self {
            user_id: user_id.to_string(),
            config,
            store,
            ledger,
            cache,
            coordinator,
            controller,
            activity,
            background: Mutex::new(Background::default()),
            now_provider,
        })
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn SwitchConfirmer>) -> Self {
        self.controller = self.controller.with_confirmer(confirmer);
        self
    }

    /// Routes switch confirmations to the returned receiver. Prompts left
    /// unanswered past the configured timeout count as declined.
    pub fn with_prompt_channel(self) -> (Self, mpsc::Receiver<ConfirmationPrompt>) {
        let (confirmer, prompts) = ChannelConfirmer::new(self.config.confirmation_timeout());
        (self.with_confirmer(Arc::new(confirmer)), prompts)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        self.coordinator.device_id()
    }

    pub fn store(&self) -> &Arc<TimerStateStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<WriteLedger> {
        &self.ledger
    }

    fn lock_background(&self) -> Result<MutexGuard<'_, Background>, InfraError> {
        self.background
            .lock()
            .map_err(|error| InfraError::lock_poisoned("session background", error))
    }

    pub async fn initialize(&self, task_ids: &[String]) -> Result<SyncReport, TimerError> {
        let report = self
            .coordinator
            .initialize(&self.user_id, task_ids)
            .await
            .map_err(|error| self.activity.action_error("initialize", error))?;
        self.activity.info(
            "initialize",
            &format!(
                "applied={} ghosts_cleared={} skipped_pending={}",
                report.applied,
                report.ghosts_cleared.len(),
                report.skipped_pending
            ),
        );
        self.ensure_background()
            .await
            .map_err(|error| self.activity.action_error("realtime", error))?;
        Ok(report)
    }

    // Reopens the subscription when the task set changed since it was opened.
    async fn ensure_background(&self) -> Result<(), TimerError> {
        let current = {
            let background = self.lock_background()?;
            match &background.realtime {
                Some(realtime) => self.coordinator.is_current(realtime)?,
                None => false,
            }
        };
        if current {
            return Ok(());
        }

        let realtime = self.coordinator.start_realtime().await?;
        let mut background = self.lock_background()?;
        let reopened = match background.realtime.replace(realtime) {
            Some(stale) => {
                stale.stop();
                true
            }
            None => false,
        };
        if background.sweeper.is_none() {
            background.sweeper =
                Some(Arc::clone(&self.cache).spawn_sweeper(self.config.sweep_interval()));
        }
        drop(background);
        let message = if reopened {
            "subscription reopened"
        } else {
            "subscription opened"
        };
        self.activity.info("realtime", message);
        Ok(())
    }

    async fn load_and_start(&self, task_id: &str) -> Result<StartOutcome, TimerError> {
        if self.store.is_globally_initialized()? && !self.store.is_task_initialized(task_id)? {
            self.coordinator.load_task(&self.user_id, task_id).await?;
        }
        self.controller.start(task_id, &self.user_id).await
    }

    /// Starts `task_id`, pulling its timer first when it lies outside the
    /// initialized task set. Fails with [`TimerError::SyncNotInitialized`]
    /// before [`Self::initialize`].
    pub async fn start(&self, task_id: &str) -> Result<StartOutcome, TimerError> {
        let outcome = self
            .load_and_start(task_id)
            .await
            .map_err(|error| self.activity.action_error("start_timer", error))?;
        let message = match &outcome {
            StartOutcome::Started(report) => match &report.switched_from {
                Some(switched) => format!(
                    "task_id={task_id} timer_id={} switched_from={} decision={:?}",
                    report.timer.timer_id, switched.task_id, switched.decision
                ),
                None => format!("task_id={task_id} timer_id={}", report.timer.timer_id),
            },
            StartOutcome::Declined => format!("task_id={task_id} switch declined"),
        };
        self.activity.info("start_timer", &message);
        Ok(outcome)
    }

    pub async fn pause(&self, task_id: &str) -> Result<PauseOutcome, TimerError> {
        let outcome = self
            .controller
            .pause(task_id, &self.user_id)
            .await
            .map_err(|error| self.activity.action_error("pause_timer", error))?;
        let message = match &outcome {
            PauseOutcome::Paused(timer) => format!(
                "task_id={task_id} accumulated_seconds={}",
                timer.accumulated_seconds
            ),
            PauseOutcome::GhostCleared => format!("task_id={task_id} ghost cleared"),
            PauseOutcome::Orphaned(orphan) => orphan_message(orphan),
        };
        if matches!(outcome, PauseOutcome::Orphaned(_)) {
            self.activity.warn("pause_timer", &message);
        } else {
            self.activity.info("pause_timer", &message);
        }
        Ok(outcome)
    }

    pub async fn stop(&self, task_id: &str) -> Result<StopOutcome, TimerError> {
        let outcome = self
            .controller
            .stop(task_id, &self.user_id)
            .await
            .map_err(|error| self.activity.action_error("stop_timer", error))?;
        let message = match &outcome {
            StopOutcome::Committed(commit) => format!(
                "task_id={task_id} seconds={} log_id={}",
                commit.total_seconds, commit.log_entry.id
            ),
            StopOutcome::GhostCleared => format!("task_id={task_id} ghost cleared"),
            StopOutcome::Orphaned(orphan) => orphan_message(orphan),
        };
        if matches!(outcome, StopOutcome::Orphaned(_)) {
            self.activity.warn("stop_timer", &message);
        } else {
            self.activity.info("stop_timer", &message);
        }
        Ok(outcome)
    }

    pub async fn reset(&self, task_id: &str) -> Result<bool, TimerError> {
        let reset = self
            .controller
            .reset(task_id, &self.user_id)
            .await
            .map_err(|error| self.activity.action_error("reset_timer", error))?;
        self.activity
            .info("reset_timer", &format!("task_id={task_id} reset={reset}"));
        Ok(reset)
    }

    pub async fn log_manual_time(
        &self,
        task_id: &str,
        seconds: i64,
        note: Option<String>,
    ) -> Result<ManualEntryCommit, TimerError> {
        let commit = self
            .controller
            .log_manual_time(task_id, &self.user_id, seconds, note)
            .await
            .map_err(|error| self.activity.action_error("log_manual_time", error))?;
        self.activity.info(
            "log_manual_time",
            &format!("task_id={task_id} seconds={seconds} log_id={}", commit.log_entry.id),
        );
        Ok(commit)
    }

    pub async fn load_task(&self, task_id: &str) -> Result<Option<LocalTimerState>, TimerError> {
        self.coordinator
            .load_task(&self.user_id, task_id)
            .await
            .map_err(|error| self.activity.action_error("load_task", error))
    }

    pub async fn handle_visibility_change(
        &self,
        visible: bool,
    ) -> Result<Option<SyncReport>, TimerError> {
        self.coordinator
            .handle_visibility_change(visible)
            .await
            .map_err(|error| self.activity.action_error("visibility_change", error))
    }

    pub async fn handle_connectivity_change(
        &self,
        online: bool,
    ) -> Result<Option<SyncReport>, TimerError> {
        self.coordinator
            .handle_connectivity_change(online)
            .await
            .map_err(|error| self.activity.action_error("connectivity_change", error))
    }

    pub fn snapshot(&self) -> Result<SessionSnapshot, TimerError> {
        let now = (self.now_provider)();
        let ledger = self.ledger.snapshot()?;
        let timers = self
            .store
            .all_active_timers()?
            .into_iter()
            .filter(|timer| timer.user_id == self.user_id)
            .map(|timer| {
                Ok(TimerView {
                    display_seconds: self.store.display_seconds(&timer.task_id, now)?,
                    pending: ledger.pending.contains(&timer.timer_id),
                    error: ledger.errors.get(&timer.timer_id).cloned(),
                    stats: interval_stats(&timer.intervals),
                    implausible_sessions: implausible_intervals(&timer.intervals).len(),
                    timer,
                })
            })
            .collect::<Result<Vec<_>, InfraError>>()?;

        Ok(SessionSnapshot {
            user_id: self.user_id.clone(),
            device_id: self.device_id().to_string(),
            phase: self.coordinator.phase()?,
            globally_initialized: self.store.is_globally_initialized()?,
            timers,
        })
    }

    pub fn shutdown(&self) -> Result<(), InfraError> {
        self.lock_background()?.stop();
        self.activity.info("close_session", &format!("user_id={}", self.user_id));
        Ok(())
    }
}

fn orphan_message(orphan: &OrphanedSession) -> String {
    format!(
        "task_id={} orphaned_seconds={} committed_seconds={}",
        orphan.task_id,
        orphan.interval.duration_seconds,
        orphan
            .commit
            .as_ref()
            .map_or(0, |commit| commit.total_seconds)
    )
}
