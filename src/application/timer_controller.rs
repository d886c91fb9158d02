use crate::application::confirmation::{AutoSend, SwitchConfirmer, SwitchDecision, SwitchRequest};
use crate::application::error::TimerError;
use crate::application::retry::RetryExecutor;
use crate::application::sync_coordinator::purge_ghost_timer;
use crate::application::timer_store::TimerStateStore;
use crate::application::write_ledger::WriteLedger;
use crate::domain::intervals::{create_interval, elapsed_seconds, is_plausible};
use crate::domain::models::{
    system_clock, validate_non_empty, LocalTimerState, NowProvider, RemoteTimerDocument,
    TaskAggregate, TimeLogEntry, TimerInterval, TimerStatus,
};
use crate::infrastructure::aggregate_mirror::{AggregateUpdate, TaskAggregateMirror};
use crate::infrastructure::document_cache::DocumentCache;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::timer_gateway::{
    ManualEntryCommit, ManualEntryRequest, RemoteTimerGateway, StopCommit, StopCommitRequest,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// What happened to the timer that was running when another task started.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchedTimer {
    pub task_id: String,
    pub decision: SwitchDecision,
    pub commit: Option<StopCommit>,
    pub orphaned_interval: Option<TimerInterval>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartReport {
    pub timer: LocalTimerState,
    pub switched_from: Option<SwitchedTimer>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(StartReport),
    Declined,
}

/// A timer whose running span was too long to count. The span is left out of
/// the task totals, the time recorded before it is committed, and the timer
/// is removed.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanedSession {
    pub task_id: String,
    pub timer_id: String,
    pub interval: TimerInterval,
    pub commit: Option<StopCommit>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PauseOutcome {
    Paused(LocalTimerState),
    GhostCleared,
    Orphaned(OrphanedSession),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Committed(StopCommit),
    GhostCleared,
    Orphaned(OrphanedSession),
}

enum SwitchResolution {
    Declined,
    Resolved(Option<SwitchedTimer>),
}

enum Finalization {
    Committed(StopCommit),
    Orphaned(OrphanedSession),
    Ghost,
    Empty,
}

struct ActionGuard<'a> {
    processing: &'a Mutex<HashSet<String>>,
    task_id: String,
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        let mut processing = match self.processing.lock() {
            Ok(processing) => processing,
            Err(poisoned) => poisoned.into_inner(),
        };
        processing.remove(&self.task_id);
    }
}

fn require_id(value: &str, field_name: &str) -> Result<(), TimerError> {
    validate_non_empty(value, field_name)
        .map_err(|message| TimerError::Infra(InfraError::InvalidArgument(message)))
}

fn closing_interval(timer: &LocalTimerState, now: DateTime<Utc>) -> Option<TimerInterval> {
    match (timer.status, timer.started_at) {
        (TimerStatus::Running, Some(started_at)) => Some(create_interval(started_at, now)),
        _ => None,
    }
}

fn check_log_entry(entry: &TimeLogEntry) {
    if let Err(problem) = entry.validate() {
        tracing::warn!(log_id = %entry.id, task_id = %entry.task_id, %problem, "remote store returned an invalid time log entry");
    }
}

pub struct TimerController<G, M>
where
    G: RemoteTimerGateway,
    M: TaskAggregateMirror,
{
    gateway: Arc<G>,
    mirror: Arc<M>,
    store: Arc<TimerStateStore>,
    ledger: Arc<WriteLedger>,
    cache: Arc<DocumentCache<RemoteTimerDocument>>,
    retry: RetryExecutor,
    confirmer: Arc<dyn SwitchConfirmer>,
    device_id: String,
    now_provider: NowProvider,
    processing: Mutex<HashSet<String>>,
}

impl<G, M> TimerController<G, M>
where
    G: RemoteTimerGateway,
    M: TaskAggregateMirror,
{
    pub fn new(
        gateway: Arc<G>,
        mirror: Arc<M>,
        store: Arc<TimerStateStore>,
        ledger: Arc<WriteLedger>,
        cache: Arc<DocumentCache<RemoteTimerDocument>>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            mirror,
            store,
            ledger,
            cache,
            retry: RetryExecutor::default(),
            confirmer: Arc::new(AutoSend),
            device_id: device_id.into(),
            now_provider: system_clock(),
            processing: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn SwitchConfirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    // Timers running on other devices are only known after global init.
    fn require_synced(&self) -> Result<(), TimerError> {
        if self.store.is_globally_initialized()? {
            Ok(())
        } else {
            Err(TimerError::SyncNotInitialized)
        }
    }

    fn begin_action(&self, task_id: &str) -> Result<ActionGuard<'_>, TimerError> {
        let mut processing = self
            .processing
            .lock()
            .map_err(|error| InfraError::lock_poisoned("timer actions", error))?;
        if !processing.insert(task_id.to_string()) {
            return Err(TimerError::ActionInProgress {
                task_id: task_id.to_string(),
            });
        }
        Ok(ActionGuard {
            processing: &self.processing,
            task_id: task_id.to_string(),
        })
    }

    fn mark_pending(&self, timer_id: &str) -> Result<(), InfraError> {
        self.ledger.apply_optimistic(timer_id)?;
        if let Some(cached) = self.cache.get(timer_id)? {
            self.cache.set(timer_id, cached.document, true)?;
        }
        Ok(())
    }

    fn confirm_write(&self, document: RemoteTimerDocument) -> LocalTimerState {
        let timer_id = document.timer_id.clone();
        let confirmed = document.to_local_state(self.now());
        let recorded = [
            self.ledger.confirm(&timer_id),
            self.cache.set(&timer_id, document, false),
            self.store.set_timer_state(confirmed.clone()),
        ];
        for error in recorded.into_iter().filter_map(Result::err) {
            tracing::warn!(%timer_id, %error, "failed to record confirmed timer write locally");
        }
        confirmed
    }

    fn reject_write(&self, timer_id: &str, error: TimerError) -> TimerError {
        tracing::warn!(timer_id, %error, "timer write failed");
        if let Err(ledger_error) =
            self.ledger
                .reject(timer_id, &error.to_string(), error.is_transient())
        {
            tracing::warn!(timer_id, %ledger_error, "failed to record timer write failure");
        }
        error
    }

    // Runs after the remote side is already settled.
    fn forget(&self, timer: &LocalTimerState) {
        let forgotten = [
            self.store.clear(&timer.task_id).map(|_| ()),
            self.ledger.clear(&timer.timer_id),
            self.cache.invalidate(&timer.timer_id),
        ];
        for error in forgotten.into_iter().filter_map(Result::err) {
            tracing::warn!(task_id = %timer.task_id, timer_id = %timer.timer_id, %error, "failed to drop finished timer locally");
        }
    }

    fn refresh_mirror(&self, aggregate: &TaskAggregate, user_id: &str) {
        let update = AggregateUpdate::for_member(aggregate, user_id);
        if let Err(error) = self.mirror.update(&aggregate.task_id, &update) {
            tracing::warn!(task_id = %aggregate.task_id, %error, "failed to refresh task aggregate mirror");
        }
    }

    /// Re-reads the remote document behind `local`. An absent or finished
    /// document means `local` is a ghost: it is purged and `None` is returned.
    async fn remote_base(
        &self,
        local: &LocalTimerState,
    ) -> Result<Option<LocalTimerState>, TimerError> {
        let gateway = &self.gateway;
        let timer_id = local.timer_id.as_str();
        let document = self
            .retry
            .execute("get_timer", move || gateway.get_timer(timer_id))
            .await?;

        match document {
            Some(document) if document.is_active() => {
                let base = document.to_local_state(self.now());
                self.cache.set(timer_id, document, false)?;
                Ok(Some(base))
            }
            _ => {
                purge_ghost_timer(
                    self.gateway.as_ref(),
                    &self.store,
                    &self.ledger,
                    &self.cache,
                    local,
                )
                .await?;
                Ok(None)
            }
        }
    }

    async fn commit_stop(
        &self,
        base: &LocalTimerState,
        final_interval: Option<TimerInterval>,
    ) -> Result<StopCommit, TimerError> {
        let request = StopCommitRequest {
            timer_id: base.timer_id.clone(),
            task_id: base.task_id.clone(),
            user_id: base.user_id.clone(),
            device_id: self.device_id.clone(),
            final_interval,
        };
        self.mark_pending(&base.timer_id)?;
        let gateway = &self.gateway;
        let request = &request;
        let commit = match self
            .retry
            .execute("stop_and_aggregate_atomic", move || {
                gateway.stop_and_aggregate_atomic(request)
            })
            .await
        {
            Ok(commit) => commit,
            Err(error) => return Err(self.reject_write(&base.timer_id, error)),
        };

        check_log_entry(&commit.log_entry);
        self.refresh_mirror(&commit.aggregate, &base.user_id);
        self.forget(base);
        tracing::info!(
            task_id = %base.task_id,
            timer_id = %base.timer_id,
            seconds = commit.total_seconds,
            "timer committed"
        );
        Ok(commit)
    }

    /// Removes a timer whose running span is implausible. Whatever it held
    /// before that span is committed. An empty timer is deleted.
    async fn settle_orphan(
        &self,
        base: &LocalTimerState,
        interval: TimerInterval,
    ) -> Result<OrphanedSession, TimerError> {
        tracing::warn!(
            task_id = %base.task_id,
            timer_id = %base.timer_id,
            seconds = interval.duration_seconds,
            "implausible running span left out of task totals"
        );
        let commit = if base.accumulated_seconds > 0 {
            Some(self.commit_stop(base, None).await?)
        } else {
            self.discard(base).await?;
            None
        };
        Ok(OrphanedSession {
            task_id: base.task_id.clone(),
            timer_id: base.timer_id.clone(),
            interval,
            commit,
        })
    }

    async fn finalize(&self, local: &LocalTimerState) -> Result<Finalization, TimerError> {
        let Some(base) = self.remote_base(local).await? else {
            return Ok(Finalization::Ghost);
        };
        let final_interval = closing_interval(&base, self.now());
        if let Some(orphaned) = final_interval
            .as_ref()
            .filter(|interval| !is_plausible(interval.duration_seconds))
        {
            let orphan = self.settle_orphan(&base, orphaned.clone()).await?;
            return Ok(Finalization::Orphaned(orphan));
        }

        let total_seconds = base.accumulated_seconds.saturating_add(
            final_interval
                .as_ref()
                .map_or(0, |interval| interval.duration_seconds),
        );
        if total_seconds <= 0 {
            return Ok(Finalization::Empty);
        }
        let commit = self.commit_stop(&base, final_interval).await?;
        Ok(Finalization::Committed(commit))
    }

    /// Deletes the remote document of `timer` and drops it locally. The time
    /// it held is not committed anywhere.
    async fn discard(&self, timer: &LocalTimerState) -> Result<(), TimerError> {
        let gateway = &self.gateway;
        let timer_id = timer.timer_id.as_str();
        let deleted = self
            .retry
            .execute("delete_timer", move || gateway.delete_timer(timer_id))
            .await;
        self.forget(timer);
        match deleted {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(self.reject_write(&timer.timer_id, error)),
        }
    }

    async fn resolve_switch(
        &self,
        running: &LocalTimerState,
        new_task_id: &str,
    ) -> Result<SwitchResolution, TimerError> {
        let running_seconds = running.accumulated_seconds.saturating_add(
            running
                .started_at
                .map_or(0, |started_at| elapsed_seconds(started_at, self.now())),
        );
        let request = SwitchRequest {
            current_task_id: running.task_id.clone(),
            new_task_id: new_task_id.to_string(),
            current_timer_id: running.timer_id.clone(),
            running_seconds,
        };
        let decision = self.confirmer.confirm_switch(request).await;
        if decision == SwitchDecision::Declined {
            tracing::info!(
                task_id = new_task_id,
                running_task_id = %running.task_id,
                "timer switch declined"
            );
            return Ok(SwitchResolution::Declined);
        }

        let _guard = self.begin_action(&running.task_id)?;
        // The prompt may have been open for a while.
        let Some(current) = self
            .store
            .get(&running.task_id)?
            .filter(|timer| timer.is_running() && timer.timer_id == running.timer_id)
        else {
            return Ok(SwitchResolution::Resolved(None));
        };

        let mut orphaned_interval = None;
        let commit = match decision {
            SwitchDecision::Send => match self.finalize(&current).await? {
                Finalization::Committed(commit) => Some(commit),
                Finalization::Orphaned(orphan) => {
                    orphaned_interval = Some(orphan.interval);
                    orphan.commit
                }
                Finalization::Ghost => None,
                Finalization::Empty => {
                    self.discard(&current).await?;
                    None
                }
            },
            _ => {
                self.discard(&current).await?;
                None
            }
        };
        Ok(SwitchResolution::Resolved(Some(SwitchedTimer {
            task_id: current.task_id,
            decision,
            commit,
            orphaned_interval,
        })))
    }

    /// Starts or resumes the timer of `task_id`. Another running timer of the
    /// same user is resolved through the confirmer first. Fails with
    /// [`TimerError::SyncNotInitialized`] until the user's timers and this
    /// task's timer have been loaded.
    pub async fn start(&self, task_id: &str, user_id: &str) -> Result<StartOutcome, TimerError> {
        require_id(task_id, "task_id")?;
        require_id(user_id, "user_id")?;
        self.require_synced()?;
        if !self.store.is_task_initialized(task_id)? {
            return Err(TimerError::SyncNotInitialized);
        }
        let _guard = self.begin_action(task_id)?;

        let existing = self.store.get(task_id)?;
        if existing.as_ref().is_some_and(LocalTimerState::is_running) {
            return Err(TimerError::AlreadyRunning {
                task_id: task_id.to_string(),
            });
        }

        let switched_from = match self.store.running_timer_for_user(user_id)? {
            Some(running) => match self.resolve_switch(&running, task_id).await? {
                SwitchResolution::Declined => return Ok(StartOutcome::Declined),
                SwitchResolution::Resolved(switched) => switched,
            },
            None => None,
        };

        let base = match &existing {
            Some(paused) => self.remote_base(paused).await?,
            None => None,
        };
        if let Some(remote) = base.as_ref().filter(|remote| remote.is_running()) {
            // Another device resumed it already.
            self.store.set_timer_state(remote.clone())?;
            return Ok(StartOutcome::Started(StartReport {
                timer: remote.clone(),
                switched_from,
            }));
        }

        let mut next = match base {
            Some(paused) => paused,
            None => {
                let gateway = &self.gateway;
                let device_id = self.device_id.as_str();
                let timer_id = self
                    .retry
                    .execute("create_timer", move || {
                        gateway.create_timer(user_id, task_id, device_id)
                    })
                    .await?;
                LocalTimerState::new(timer_id, task_id, user_id)
            }
        };
        next.status = TimerStatus::Running;
        next.started_at = Some(self.now());
        next.paused_at = None;

        let timer_id = next.timer_id.clone();
        self.mark_pending(&timer_id)?;
        self.store.set_timer_state(next)?;

        let gateway = &self.gateway;
        let device_id = self.device_id.as_str();
        let started = {
            let timer_id = timer_id.as_str();
            self.retry
                .execute("start_atomic", move || gateway.start_atomic(timer_id, device_id))
                .await
        };
        match started {
            Ok(document) => {
                let timer = self.confirm_write(document);
                tracing::info!(task_id, timer_id = %timer.timer_id, "timer started");
                Ok(StartOutcome::Started(StartReport {
                    timer,
                    switched_from,
                }))
            }
            Err(error) => Err(self.reject_write(&timer_id, error)),
        }
    }

    pub async fn pause(&self, task_id: &str, user_id: &str) -> Result<PauseOutcome, TimerError> {
        require_id(task_id, "task_id")?;
        require_id(user_id, "user_id")?;
        self.require_synced()?;
        let _guard = self.begin_action(task_id)?;

        let local = self
            .store
            .get(task_id)?
            .ok_or_else(|| TimerError::NoActiveTimer {
                task_id: task_id.to_string(),
            })?;
        if !local.is_running() || local.started_at.is_none() {
            return Err(TimerError::NotRunning {
                task_id: task_id.to_string(),
            });
        }

        let Some(base) = self.remote_base(&local).await? else {
            return Ok(PauseOutcome::GhostCleared);
        };
        if base.status == TimerStatus::Paused {
            self.store.set_timer_state(base.clone())?;
            return Ok(PauseOutcome::Paused(base));
        }
        let interval = closing_interval(&base, self.now()).ok_or_else(|| {
            TimerError::NotRunning {
                task_id: task_id.to_string(),
            }
        })?;
        if !is_plausible(interval.duration_seconds) {
            let orphan = self.settle_orphan(&base, interval).await?;
            return Ok(PauseOutcome::Orphaned(orphan));
        }

        let mut next = base;
        next.status = TimerStatus::Paused;
        next.started_at = None;
        next.paused_at = Some(interval.end);

        let timer_id = next.timer_id.clone();
        self.mark_pending(&timer_id)?;
        self.store.set_timer_state(next)?;
        self.store.append_interval(task_id, interval.clone())?;

        let gateway = &self.gateway;
        let device_id = self.device_id.as_str();
        let paused = {
            let timer_id = timer_id.as_str();
            let interval = &interval;
            self.retry
                .execute("pause_atomic", move || {
                    gateway.pause_atomic(timer_id, interval, device_id)
                })
                .await
        };
        match paused {
            Ok(document) => {
                let timer = self.confirm_write(document);
                tracing::info!(task_id, seconds = timer.accumulated_seconds, "timer paused");
                Ok(PauseOutcome::Paused(timer))
            }
            Err(error) => Err(self.reject_write(&timer_id, error)),
        }
    }

    pub async fn stop(&self, task_id: &str, user_id: &str) -> Result<StopOutcome, TimerError> {
        require_id(task_id, "task_id")?;
        require_id(user_id, "user_id")?;
        self.require_synced()?;
        let _guard = self.begin_action(task_id)?;

        let local = self
            .store
            .get(task_id)?
            .ok_or_else(|| TimerError::NoActiveTimer {
                task_id: task_id.to_string(),
            })?;
        match self.finalize(&local).await? {
            Finalization::Committed(commit) => Ok(StopOutcome::Committed(commit)),
            Finalization::Orphaned(orphan) => Ok(StopOutcome::Orphaned(orphan)),
            Finalization::Ghost => Ok(StopOutcome::GhostCleared),
            Finalization::Empty => Err(TimerError::ZeroDuration {
                task_id: task_id.to_string(),
            }),
        }
    }

    /// Drops the timer of `task_id` without committing its time. Returns
    /// `false` when there was nothing to reset.
    pub async fn reset(&self, task_id: &str, user_id: &str) -> Result<bool, TimerError> {
        require_id(task_id, "task_id")?;
        require_id(user_id, "user_id")?;
        let _guard = self.begin_action(task_id)?;

        let Some(local) = self.store.get(task_id)? else {
            return Ok(false);
        };
        self.discard(&local).await?;
        tracing::info!(task_id, timer_id = %local.timer_id, "timer reset");
        Ok(true)
    }

    pub async fn log_manual_time(
        &self,
        task_id: &str,
        user_id: &str,
        seconds: i64,
        note: Option<String>,
    ) -> Result<ManualEntryCommit, TimerError> {
        require_id(task_id, "task_id")?;
        require_id(user_id, "user_id")?;
        if seconds <= 0 {
            return Err(TimerError::ZeroDuration {
                task_id: task_id.to_string(),
            });
        }
        if !is_plausible(seconds) {
            return Err(TimerError::ImplausibleInterval { seconds });
        }
        let _guard = self.begin_action(task_id)?;

        let request = ManualEntryRequest {
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            device_id: self.device_id.clone(),
            seconds,
            note,
        };
        let gateway = &self.gateway;
        let request = &request;
        let commit = self
            .retry
            .execute("commit_manual_entry_atomic", move || {
                gateway.commit_manual_entry_atomic(request)
            })
            .await?;
        check_log_entry(&commit.log_entry);
        self.refresh_mirror(&commit.aggregate, user_id);
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::confirmation::{FnConfirmer, SwitchResponse};
    use crate::application::retry::RetryPolicy;
    use crate::infrastructure::aggregate_mirror::InMemoryAggregateMirror;
    use crate::infrastructure::in_memory_gateway::InMemoryTimerGateway;
    use crate::test_support::{FlakyRepository, ManualClock};
    use std::time::Duration;

    const USER: &str = "usr-1";

    struct Fixture {
        clock: ManualClock,
        gateway: Arc<InMemoryTimerGateway>,
        mirror: Arc<InMemoryAggregateMirror>,
        repository: Arc<FlakyRepository>,
        store: Arc<TimerStateStore>,
        ledger: Arc<WriteLedger>,
        controller: TimerController<InMemoryTimerGateway, InMemoryAggregateMirror>,
    }

    fn build(confirmer: Option<Arc<dyn SwitchConfirmer>>, synced: bool) -> Fixture {
        let clock = ManualClock::default();
        let gateway = Arc::new(InMemoryTimerGateway::new().with_now_provider(clock.provider()));
        let mirror = Arc::new(InMemoryAggregateMirror::default());
        for task_id in ["tsk-a", "tsk-b"] {
            gateway.insert_task(task_id).expect("register task");
            mirror
                .insert(TaskAggregate::new(task_id))
                .expect("mirror task");
        }
        let repository = Arc::new(FlakyRepository::default());
        let store = Arc::new(TimerStateStore::new(USER, repository.clone()));
        if synced {
            store.mark_globally_initialized().expect("global flag");
            for task_id in ["tsk-a", "tsk-b"] {
                store.mark_task_initialized(task_id).expect("task flag");
            }
        }
        let ledger = Arc::new(WriteLedger::new().with_now_provider(clock.provider()));
        let cache = Arc::new(
            DocumentCache::new(Duration::from_secs(60)).with_now_provider(clock.provider()),
        );
        let mut controller = TimerController::new(
            Arc::clone(&gateway),
            Arc::clone(&mirror),
            Arc::clone(&store),
            Arc::clone(&ledger),
            cache,
            "device-a",
        )
        .with_retry(RetryExecutor::new(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 1,
            jitter_ms: 0,
        }))
        .with_now_provider(clock.provider());
        if let Some(confirmer) = confirmer {
            controller = controller.with_confirmer(confirmer);
        }
        Fixture {
            clock,
            gateway,
            mirror,
            repository,
            store,
            ledger,
            controller,
        }
    }

    fn fixture_with(confirmer: Option<Arc<dyn SwitchConfirmer>>) -> Fixture {
        build(confirmer, true)
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    fn answering(response: SwitchResponse) -> Arc<dyn SwitchConfirmer> {
        Arc::new(FnConfirmer(move |_request: SwitchRequest| async move {
            response
        }))
    }

    fn offline_errors(count: usize) -> Vec<InfraError> {
        (0..count)
            .map(|_| InfraError::Remote("network error while writing timer: offline".to_string()))
            .collect()
    }

    async fn started(fixture: &Fixture, task_id: &str) -> LocalTimerState {
        match fixture.controller.start(task_id, USER).await.expect("start") {
            StartOutcome::Started(report) => report.timer,
            StartOutcome::Declined => panic!("start of {task_id} was declined"),
        }
    }

    fn assert_hours(actual: f64, seconds: i64) {
        let expected = seconds as f64 / 3_600.0;
        assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
    }

    #[tokio::test]
    async fn pause_resume_stop_commits_every_session() {
        let fixture = fixture();
        let t0 = fixture.clock.now();

        let running = started(&fixture, "tsk-a").await;
        assert_eq!(running.status, TimerStatus::Running);
        assert_eq!(running.started_at, Some(t0));

        fixture.clock.advance_seconds(125);
        let PauseOutcome::Paused(paused) =
            fixture.controller.pause("tsk-a", USER).await.expect("pause")
        else {
            panic!("expected paused timer");
        };
        assert_eq!(paused.accumulated_seconds, 125);
        assert_eq!(paused.intervals.len(), 1);
        assert_eq!(paused.intervals[0].duration_seconds, 125);

        fixture.clock.advance_seconds(75);
        let resumed = started(&fixture, "tsk-a").await;
        assert_eq!(resumed.timer_id, running.timer_id);
        assert_eq!(resumed.accumulated_seconds, 125);
        assert_eq!(fixture.gateway.call_count("create_timer"), 1);

        fixture.clock.advance_seconds(200);
        assert_eq!(
            fixture
                .store
                .display_seconds("tsk-a", fixture.clock.now())
                .expect("display"),
            325
        );
        let StopOutcome::Committed(commit) =
            fixture.controller.stop("tsk-a", USER).await.expect("stop")
        else {
            panic!("expected committed stop");
        };

        assert_eq!(commit.total_seconds, 325);
        assert_eq!(commit.log_entry.started_at, Some(t0));
        assert_eq!(commit.log_entry.ended_at, Some(fixture.clock.now()));
        assert_hours(commit.aggregate.total_hours, 325);
        let mirrored = fixture.mirror.find("tsk-a").expect("find").expect("mirrored");
        assert_eq!(mirrored.total_seconds, 325);
        assert_hours(mirrored.hours_for(USER), 325);
        assert!(fixture.store.get("tsk-a").expect("get").is_none());
        assert_eq!(fixture.gateway.timer_count().expect("count"), 0);
        assert!(fixture.ledger.snapshot().expect("snapshot").pending.is_empty());
    }

    #[tokio::test]
    async fn declined_switch_changes_nothing() {
        let fixture = fixture_with(Some(answering(SwitchResponse::declined())));
        let running = started(&fixture, "tsk-a").await;
        fixture.clock.advance_seconds(300);

        let outcome = fixture.controller.start("tsk-b", USER).await.expect("start b");

        assert_eq!(outcome, StartOutcome::Declined);
        assert_eq!(fixture.store.get("tsk-a").expect("get"), Some(running));
        assert!(fixture.store.get("tsk-b").expect("get").is_none());
        assert_eq!(fixture.gateway.call_count("create_timer"), 1);
        assert_eq!(fixture.gateway.timer_count().expect("count"), 1);
    }

    #[tokio::test]
    async fn discarded_switch_leaves_totals_unchanged() {
        let fixture = fixture_with(Some(answering(SwitchResponse::discard())));
        started(&fixture, "tsk-a").await;
        fixture.clock.advance_seconds(300);

        let StartOutcome::Started(report) =
            fixture.controller.start("tsk-b", USER).await.expect("start b")
        else {
            panic!("expected start");
        };

        let switched = report.switched_from.expect("switched timer");
        assert_eq!(switched.task_id, "tsk-a");
        assert_eq!(switched.decision, SwitchDecision::Discard);
        assert!(switched.commit.is_none());
        assert!(fixture.store.get("tsk-a").expect("get").is_none());
        assert!(fixture.store.is_running("tsk-b").expect("running"));
        let aggregate = fixture
            .gateway
            .get_task_aggregate("tsk-a")
            .await
            .expect("aggregate")
            .expect("present");
        assert_eq!(aggregate.total_seconds, 0);
        assert!(fixture.gateway.time_logs().expect("logs").is_empty());
        assert_eq!(fixture.gateway.timer_count().expect("count"), 1);
    }

    #[tokio::test]
    async fn sent_switch_commits_running_time() {
        let fixture = fixture_with(Some(answering(SwitchResponse::send())));
        started(&fixture, "tsk-a").await;
        fixture.clock.advance_seconds(300);

        let StartOutcome::Started(report) =
            fixture.controller.start("tsk-b", USER).await.expect("start b")
        else {
            panic!("expected start");
        };

        let commit = report
            .switched_from
            .and_then(|switched| switched.commit)
            .expect("commit of running timer");
        assert_eq!(commit.total_seconds, 300);
        assert_hours(commit.aggregate.hours_for(USER), 300);
        assert!(fixture.store.get("tsk-a").expect("get").is_none());
        assert_eq!(report.timer.task_id, "tsk-b");
        assert_eq!(fixture.gateway.time_logs().expect("logs").len(), 1);
        assert_hours(
            fixture
                .mirror
                .find("tsk-a")
                .expect("find")
                .expect("mirrored")
                .total_hours,
            300,
        );
    }

    #[tokio::test]
    async fn switch_without_confirmer_sends() {
        let fixture = fixture();
        started(&fixture, "tsk-a").await;
        fixture.clock.advance_seconds(90);

        fixture.controller.start("tsk-b", USER).await.expect("start b");

        let logs = fixture.gateway.time_logs().expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].seconds, 90);
        assert!(fixture.store.running_timer_for_user(USER).expect("running").is_some_and(
            |timer| timer.task_id == "tsk-b"
        ));
    }

    #[tokio::test]
    async fn sent_switch_with_no_time_is_discarded() {
        let fixture = fixture();
        started(&fixture, "tsk-a").await;

        fixture.controller.start("tsk-b", USER).await.expect("start b");

        assert!(fixture.store.get("tsk-a").expect("get").is_none());
        assert!(fixture.gateway.time_logs().expect("logs").is_empty());
        assert_eq!(fixture.gateway.call_count("delete_timer"), 1);
    }

    #[tokio::test]
    async fn stop_without_time_fails_and_changes_nothing() {
        let fixture = fixture();
        started(&fixture, "tsk-a").await;
        fixture.controller.pause("tsk-a", USER).await.expect("pause");

        let result = fixture.controller.stop("tsk-a", USER).await;

        assert!(matches!(result, Err(TimerError::ZeroDuration { .. })));
        assert_eq!(
            fixture.store.get("tsk-a").expect("get").map(|timer| timer.status),
            Some(TimerStatus::Paused)
        );
        assert_eq!(fixture.gateway.call_count("stop_and_aggregate_atomic"), 0);
        assert_eq!(
            fixture.mirror.find("tsk-a").expect("find").map(|agg| agg.total_seconds),
            Some(0)
        );
    }

    #[tokio::test]
    async fn pause_of_ghost_timer_clears_it() {
        let fixture = fixture();
        let running = started(&fixture, "tsk-a").await;
        fixture.gateway.remove_timer(&running.timer_id).expect("remove");
        fixture.clock.advance_seconds(30);

        let outcome = fixture.controller.pause("tsk-a", USER).await.expect("pause");

        assert_eq!(outcome, PauseOutcome::GhostCleared);
        assert!(fixture.store.get("tsk-a").expect("get").is_none());
        assert!(fixture.ledger.error_for(&running.timer_id).expect("error").is_none());
    }

    #[tokio::test]
    async fn stop_of_ghost_timer_clears_it() {
        let fixture = fixture();
        let running = started(&fixture, "tsk-a").await;
        fixture.gateway.remove_timer(&running.timer_id).expect("remove");

        let outcome = fixture.controller.stop("tsk-a", USER).await.expect("stop");

        assert_eq!(outcome, StopOutcome::GhostCleared);
        assert!(fixture.store.get("tsk-a").expect("get").is_none());
        assert!(fixture.gateway.time_logs().expect("logs").is_empty());
    }

    #[tokio::test]
    async fn pause_adopts_a_remote_pause() {
        let fixture = fixture();
        let running = started(&fixture, "tsk-a").await;
        let mut remote = fixture
            .gateway
            .get_timer(&running.timer_id)
            .await
            .expect("get")
            .expect("document");
        remote.status = TimerStatus::Paused;
        remote.started_at = None;
        remote.paused_at = Some(fixture.clock.now());
        remote.accumulated_seconds = 50;
        remote.device_id = Some("device-b".to_string());
        fixture.gateway.put_timer(remote).expect("remote pause");

        let PauseOutcome::Paused(adopted) =
            fixture.controller.pause("tsk-a", USER).await.expect("pause")
        else {
            panic!("expected adopted pause");
        };

        assert_eq!(adopted.accumulated_seconds, 50);
        assert_eq!(fixture.gateway.call_count("pause_atomic"), 0);
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() {
        let fixture = fixture();
        assert!(matches!(
            fixture.controller.pause("tsk-a", USER).await,
            Err(TimerError::NoActiveTimer { .. })
        ));
        assert!(matches!(
            fixture.controller.stop("tsk-a", USER).await,
            Err(TimerError::NoActiveTimer { .. })
        ));

        started(&fixture, "tsk-a").await;
        assert!(matches!(
            fixture.controller.start("tsk-a", USER).await,
            Err(TimerError::AlreadyRunning { .. })
        ));

        fixture.clock.advance_seconds(10);
        fixture.controller.pause("tsk-a", USER).await.expect("pause");
        assert!(matches!(
            fixture.controller.pause("tsk-a", USER).await,
            Err(TimerError::NotRunning { .. })
        ));
        assert!(matches!(
            fixture.controller.start("", USER).await,
            Err(TimerError::Infra(InfraError::InvalidArgument(_)))
        ));
    }

    #[tokio::test]
    async fn concurrent_action_on_same_task_is_rejected() {
        let fixture = fixture();
        let busy = fixture.controller.begin_action("tsk-a").expect("claim");

        assert!(matches!(
            fixture.controller.start("tsk-a", USER).await,
            Err(TimerError::ActionInProgress { .. })
        ));
        assert_eq!(fixture.gateway.call_count("create_timer"), 0);

        drop(busy);
        started(&fixture, "tsk-a").await;
    }

    #[tokio::test]
    async fn failed_pause_keeps_optimistic_state_and_records_error() {
        let fixture = fixture();
        let running = started(&fixture, "tsk-a").await;
        fixture.clock.advance_seconds(60);
        fixture
            .gateway
            .script_failures("pause_atomic", offline_errors(3))
            .expect("script");

        let result = fixture.controller.pause("tsk-a", USER).await;

        assert!(matches!(
            result,
            Err(TimerError::NetworkRetryExhausted { attempts: 3, .. })
        ));
        let local = fixture.store.get("tsk-a").expect("get").expect("entry");
        assert_eq!(local.status, TimerStatus::Paused);
        assert_eq!(local.accumulated_seconds, 60);
        let failure = fixture
            .ledger
            .error_for(&running.timer_id)
            .expect("error")
            .expect("recorded");
        assert!(failure.retryable);
        assert!(!fixture.ledger.is_pending(&running.timer_id).expect("pending"));
    }

    #[tokio::test]
    async fn transient_start_failure_is_retried() {
        let fixture = fixture();
        fixture
            .gateway
            .script_failures("start_atomic", offline_errors(2))
            .expect("script");

        let timer = started(&fixture, "tsk-a").await;

        assert_eq!(timer.status, TimerStatus::Running);
        assert_eq!(fixture.gateway.call_count("start_atomic"), 3);
        assert!(fixture.ledger.error_for(&timer.timer_id).expect("error").is_none());
    }

    async fn orphaned_after_one_minute(fixture: &Fixture) -> LocalTimerState {
        started(fixture, "tsk-a").await;
        fixture.clock.advance_seconds(60);
        fixture.controller.pause("tsk-a", USER).await.expect("pause");
        let resumed = started(fixture, "tsk-a").await;
        fixture.clock.advance_seconds(90_000);
        resumed
    }

    #[tokio::test]
    async fn stop_of_orphaned_timer_commits_earlier_time_and_flags_the_span() {
        let fixture = fixture();
        let resumed = orphaned_after_one_minute(&fixture).await;

        let StopOutcome::Orphaned(orphan) =
            fixture.controller.stop("tsk-a", USER).await.expect("stop")
        else {
            panic!("expected orphaned timer");
        };

        assert_eq!(orphan.timer_id, resumed.timer_id);
        assert_eq!(orphan.interval.duration_seconds, 90_000);
        assert_eq!(orphan.commit.map(|commit| commit.total_seconds), Some(60));
        assert!(fixture.store.get("tsk-a").expect("get").is_none());
        assert_eq!(fixture.gateway.timer_count().expect("count"), 0);
        assert_eq!(
            fixture.mirror.find("tsk-a").expect("find").map(|agg| agg.total_seconds),
            Some(60)
        );

        started(&fixture, "tsk-b").await;
        fixture.clock.advance_seconds(30);
        assert!(matches!(
            fixture.controller.pause("tsk-b", USER).await,
            Ok(PauseOutcome::Paused(_))
        ));
    }

    #[tokio::test]
    async fn switch_away_from_orphaned_timer_is_not_blocked() {
        let fixture = fixture();
        orphaned_after_one_minute(&fixture).await;

        let StartOutcome::Started(report) =
            fixture.controller.start("tsk-b", USER).await.expect("start b")
        else {
            panic!("expected start");
        };

        let switched = report.switched_from.expect("switched timer");
        assert_eq!(
            switched.orphaned_interval.map(|interval| interval.duration_seconds),
            Some(90_000)
        );
        assert_eq!(switched.commit.map(|commit| commit.total_seconds), Some(60));
        assert!(fixture.store.get("tsk-a").expect("get").is_none());
        assert!(fixture.store.is_running("tsk-b").expect("running"));
    }

    #[tokio::test]
    async fn pause_of_orphaned_timer_without_earlier_time_drops_it() {
        let fixture = fixture();
        started(&fixture, "tsk-a").await;
        fixture.clock.advance_seconds(86_401);

        let PauseOutcome::Orphaned(orphan) =
            fixture.controller.pause("tsk-a", USER).await.expect("pause")
        else {
            panic!("expected orphaned timer");
        };

        assert_eq!(orphan.interval.duration_seconds, 86_401);
        assert!(orphan.commit.is_none());
        assert!(fixture.store.get("tsk-a").expect("get").is_none());
        assert_eq!(fixture.gateway.call_count("pause_atomic"), 0);
        assert_eq!(fixture.gateway.timer_count().expect("count"), 0);
        assert!(fixture.gateway.time_logs().expect("logs").is_empty());
    }

    #[tokio::test]
    async fn actions_wait_for_initialization() {
        let fixture = build(None, false);
        assert!(matches!(
            fixture.controller.start("tsk-a", USER).await,
            Err(TimerError::SyncNotInitialized)
        ));
        assert!(matches!(
            fixture.controller.pause("tsk-a", USER).await,
            Err(TimerError::SyncNotInitialized)
        ));
        assert!(matches!(
            fixture.controller.stop("tsk-a", USER).await,
            Err(TimerError::SyncNotInitialized)
        ));

        fixture.store.mark_globally_initialized().expect("global flag");
        assert!(matches!(
            fixture.controller.start("tsk-a", USER).await,
            Err(TimerError::SyncNotInitialized)
        ));
        assert_eq!(fixture.gateway.call_count("create_timer"), 0);

        fixture.store.mark_task_initialized("tsk-a").expect("task flag");
        started(&fixture, "tsk-a").await;
    }

    #[tokio::test]
    async fn committed_stop_survives_local_persistence_failure() {
        let fixture = fixture();
        let running = started(&fixture, "tsk-a").await;
        fixture.clock.advance_seconds(100);
        fixture.repository.fail_saves(true);

        let outcome = fixture.controller.stop("tsk-a", USER).await.expect("stop");

        let StopOutcome::Committed(commit) = outcome else {
            panic!("expected committed stop");
        };
        assert_eq!(commit.total_seconds, 100);
        assert_eq!(fixture.gateway.time_logs().expect("logs").len(), 1);
        assert!(!fixture.ledger.is_pending(&running.timer_id).expect("pending"));

        fixture.repository.fail_saves(false);
    }

    #[tokio::test]
    async fn stop_without_task_aggregate_keeps_timer() {
        let fixture = fixture();
        fixture
            .store
            .mark_task_initialized("tsk-unregistered")
            .expect("task flag");
        started(&fixture, "tsk-unregistered").await;
        fixture.clock.advance_seconds(45);

        let result = fixture.controller.stop("tsk-unregistered", USER).await;

        assert!(matches!(result, Err(TimerError::TaskAggregateMissing { .. })));
        assert!(fixture.store.is_running("tsk-unregistered").expect("running"));
        assert_eq!(fixture.gateway.timer_count().expect("count"), 1);
    }

    #[tokio::test]
    async fn reset_drops_timer_without_committing() {
        let fixture = fixture();
        assert!(!fixture.controller.reset("tsk-a", USER).await.expect("noop reset"));
        assert_eq!(fixture.gateway.call_count("delete_timer"), 0);

        started(&fixture, "tsk-a").await;
        fixture.clock.advance_seconds(600);
        assert!(fixture.controller.reset("tsk-a", USER).await.expect("reset"));

        assert!(fixture.store.get("tsk-a").expect("get").is_none());
        assert_eq!(fixture.gateway.timer_count().expect("count"), 0);
        assert!(fixture.gateway.time_logs().expect("logs").is_empty());
    }

    #[tokio::test]
    async fn reset_of_already_deleted_timer_succeeds() {
        let fixture = fixture();
        let running = started(&fixture, "tsk-a").await;
        fixture.gateway.remove_timer(&running.timer_id).expect("remove");

        assert!(fixture.controller.reset("tsk-a", USER).await.expect("reset"));
        assert!(fixture.store.get("tsk-a").expect("get").is_none());
    }

    #[tokio::test]
    async fn manual_time_updates_totals() {
        let fixture = fixture();
        let commit = fixture
            .controller
            .log_manual_time("tsk-b", USER, 1_800, Some("pairing".to_string()))
            .await
            .expect("manual entry");

        assert_eq!(commit.log_entry.seconds, 1_800);
        assert_hours(
            fixture
                .mirror
                .find("tsk-b")
                .expect("find")
                .expect("mirrored")
                .hours_for(USER),
            1_800,
        );
        assert!(matches!(
            fixture.controller.log_manual_time("tsk-b", USER, 0, None).await,
            Err(TimerError::ZeroDuration { .. })
        ));
        assert!(matches!(
            fixture
                .controller
                .log_manual_time("tsk-b", USER, 90_000, None)
                .await,
            Err(TimerError::ImplausibleInterval { seconds: 90_000 })
        ));
    }
}
