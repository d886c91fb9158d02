use crate::application::error::TimerError;
use crate::application::retry::RetryExecutor;
use crate::application::timer_store::TimerStateStore;
use crate::application::write_ledger::WriteLedger;
use crate::domain::models::{
    system_clock, LocalTimerState, NowProvider, RemoteTimerDocument, TimerStatus,
};
use crate::infrastructure::document_cache::DocumentCache;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::timer_gateway::{RemoteChange, RemoteTimerGateway, SubscriptionScope};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "message", rename_all = "snake_case")]
pub enum SyncPhase {
    Uninitialized,
    Initializing,
    Synced,
    Error(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub applied: usize,
    /// Task ids whose local entry was a ghost and has been cleared.
    pub ghosts_cleared: Vec<String>,
    pub skipped_pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedScope {
    user_id: String,
    task_ids: Vec<String>,
}

impl TrackedScope {
    fn new(user_id: &str, task_ids: &[String]) -> Self {
        let mut task_ids = task_ids.to_vec();
        task_ids.sort();
        task_ids.dedup();
        Self {
            user_id: user_id.to_string(),
            task_ids,
        }
    }
}

/// Live subscription task. Dropping the handle stops it.
#[derive(Debug)]
pub struct RealtimeHandle {
    task: JoinHandle<()>,
    scope: TrackedScope,
}

impl RealtimeHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RealtimeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct SyncCoordinator<G>
where
    G: RemoteTimerGateway,
{
    gateway: Arc<G>,
    store: Arc<TimerStateStore>,
    ledger: Arc<WriteLedger>,
    cache: Arc<DocumentCache<RemoteTimerDocument>>,
    retry: RetryExecutor,
    device_id: String,
    now_provider: NowProvider,
    phase: Mutex<SyncPhase>,
    scope: Mutex<Option<TrackedScope>>,
    online: AtomicBool,
}

impl<G> SyncCoordinator<G>
where
    G: RemoteTimerGateway,
{
    pub fn new(
        gateway: Arc<G>,
        store: Arc<TimerStateStore>,
        ledger: Arc<WriteLedger>,
        cache: Arc<DocumentCache<RemoteTimerDocument>>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            store,
            ledger,
            cache,
            retry: RetryExecutor::default(),
            device_id: device_id.into(),
            now_provider: system_clock(),
            phase: Mutex::new(SyncPhase::Uninitialized),
            scope: Mutex::new(None),
            online: AtomicBool::new(true),
        }
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn lock_phase(&self) -> Result<MutexGuard<'_, SyncPhase>, InfraError> {
        self.phase
            .lock()
            .map_err(|error| InfraError::lock_poisoned("sync phase", error))
    }

    fn set_phase(&self, phase: SyncPhase) -> Result<(), InfraError> {
        *self.lock_phase()? = phase;
        Ok(())
    }

    pub fn phase(&self) -> Result<SyncPhase, InfraError> {
        Ok(self.lock_phase()?.clone())
    }

    fn lock_scope(&self) -> Result<MutexGuard<'_, Option<TrackedScope>>, InfraError> {
        self.scope
            .lock()
            .map_err(|error| InfraError::lock_poisoned("sync scope", error))
    }

    fn track_scope(&self, scope: TrackedScope) -> Result<(), InfraError> {
        *self.lock_scope()? = Some(scope);
        Ok(())
    }

    fn tracked_scope(&self) -> Result<Option<TrackedScope>, InfraError> {
        Ok(self.lock_scope()?.clone())
    }

    pub async fn initialize(
        &self,
        user_id: &str,
        task_ids: &[String],
    ) -> Result<SyncReport, TimerError> {
        self.set_phase(SyncPhase::Initializing)?;
        self.track_scope(TrackedScope::new(user_id, task_ids))?;

        match self.reconcile(user_id, task_ids).await {
            Ok(report) => {
                self.set_phase(SyncPhase::Synced)?;
                tracing::info!(
                    user_id,
                    applied = report.applied,
                    ghosts = report.ghosts_cleared.len(),
                    "timer state synchronized"
                );
                Ok(report)
            }
            Err(error) => {
                self.set_phase(SyncPhase::Error(error.to_string()))?;
                tracing::warn!(user_id, %error, "timer synchronization failed");
                Err(error)
            }
        }
    }

    async fn reconcile(
        &self,
        user_id: &str,
        task_ids: &[String],
    ) -> Result<SyncReport, TimerError> {
        let gateway = &self.gateway;
        let remote = self
            .retry
            .execute("list_active_timers", move || {
                gateway.list_active_timers(user_id, task_ids)
            })
            .await?;

        let remote_ids: HashSet<&str> = remote
            .iter()
            .map(|document| document.timer_id.as_str())
            .collect();
        let in_scope: HashSet<&str> = task_ids.iter().map(String::as_str).collect();

        let mut report = SyncReport::default();
        let mut pending_tasks = HashSet::new();
        for local in self.store.all_active_timers()? {
            if local.user_id != user_id || !in_scope.contains(local.task_id.as_str()) {
                continue;
            }
            if self.ledger.is_pending(&local.timer_id)? {
                report.skipped_pending += 1;
                pending_tasks.insert(local.task_id);
                continue;
            }
            if !remote_ids.contains(local.timer_id.as_str()) {
                self.purge_ghost(&local).await?;
                report.ghosts_cleared.push(local.task_id);
            }
        }

        let synced_at = (self.now_provider)();
        let mut authoritative = Vec::with_capacity(remote.len());
        for document in &remote {
            self.cache.set(&document.timer_id, document.clone(), false)?;
            if !pending_tasks.contains(&document.task_id) {
                authoritative.push(document.to_local_state(synced_at));
            }
        }
        report.applied = self.store.bulk_apply(authoritative)?;

        for task_id in task_ids {
            self.store.mark_task_initialized(task_id)?;
        }
        self.store.mark_globally_initialized()?;
        Ok(report)
    }

    async fn purge_ghost(&self, local: &LocalTimerState) -> Result<(), TimerError> {
        purge_ghost_timer(
            self.gateway.as_ref(),
            &self.store,
            &self.ledger,
            &self.cache,
            local,
        )
        .await?;
        Ok(())
    }

    pub async fn handle_visibility_change(
        &self,
        visible: bool,
    ) -> Result<Option<SyncReport>, TimerError> {
        if !visible {
            return Ok(None);
        }
        self.reinitialize().await
    }

    /// On an offline to online transition, clears recorded failures and
    /// re-runs reconciliation.
    pub async fn handle_connectivity_change(
        &self,
        online: bool,
    ) -> Result<Option<SyncReport>, TimerError> {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if !online || was_online {
            return Ok(None);
        }
        let cleared = self.ledger.clear_errors()?;
        tracing::debug!(cleared, "connectivity restored");
        self.reinitialize().await
    }

    async fn reinitialize(&self) -> Result<Option<SyncReport>, TimerError> {
        let Some(scope) = self.tracked_scope()? else {
            return Ok(None);
        };
        self.initialize(&scope.user_id, &scope.task_ids)
            .await
            .map(Some)
    }

    /// Pulls the timer of a single task, cache first, and marks the task initialized.
    pub async fn load_task(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<LocalTimerState>, TimerError> {
        let local = self.store.get(task_id)?;
        let pending = match &local {
            Some(timer) => self.ledger.is_pending(&timer.timer_id)?,
            None => false,
        };

        if !pending {
            let remote = match &local {
                Some(timer) => self.fetch_document(&timer.timer_id).await?,
                None => {
                    let gateway = &self.gateway;
                    let task_ids = [task_id.to_string()];
                    let task_ids = &task_ids;
                    self.retry
                        .execute("list_active_timers", move || {
                            gateway.list_active_timers(user_id, task_ids)
                        })
                        .await?
                        .into_iter()
                        .next()
                }
            };

            match (local.as_ref(), remote) {
                (_, Some(document)) if document.is_active() => {
                    self.cache.set(&document.timer_id, document.clone(), false)?;
                    if let Some(stale) = local
                        .as_ref()
                        .filter(|timer| timer.timer_id != document.timer_id)
                    {
                        self.ledger.clear(&stale.timer_id)?;
                    }
                    self.store
                        .set_timer_state(document.to_local_state((self.now_provider)()))?;
                }
                (Some(timer), _) => self.purge_ghost(timer).await?,
                (None, _) => {}
            }
        }

        self.store.mark_task_initialized(task_id)?;
        Ok(self.store.get(task_id)?)
    }

    pub async fn fetch_document(
        &self,
        timer_id: &str,
    ) -> Result<Option<RemoteTimerDocument>, TimerError> {
        if let Some(cached) = self.cache.get(timer_id)? {
            if !cached.pending_writes {
                return Ok(Some(cached.document));
            }
        }
        let gateway = &self.gateway;
        let document = self
            .retry
            .execute("get_timer", move || gateway.get_timer(timer_id))
            .await?;
        match &document {
            Some(document) => self.cache.set(timer_id, document.clone(), false)?,
            None => self.cache.invalidate(timer_id)?,
        }
        Ok(document)
    }

    /// Applies one change from the realtime stream. Returns whether local
    /// state changed.
    pub async fn apply_remote_change(&self, change: RemoteChange) -> Result<bool, TimerError> {
        match change {
            RemoteChange::Upserted(document) => {
                if document.written_by(&self.device_id) {
                    tracing::trace!(timer_id = %document.timer_id, "skipping echo of local write");
                    return Ok(false);
                }
                let local = self.store.get(&document.task_id)?;
                if let Some(timer) = &local {
                    if self.ledger.is_pending(&timer.timer_id)? {
                        return Ok(false);
                    }
                }

                if document.is_active() {
                    self.cache.set(&document.timer_id, document.clone(), false)?;
                    self.store
                        .set_timer_state(document.to_local_state((self.now_provider)()))?;
                    if document.status == TimerStatus::Running {
                        self.recheck_other_running(&document).await?;
                    }
                    return Ok(true);
                }

                self.cache.invalidate(&document.timer_id)?;
                match local {
                    Some(timer) if timer.timer_id == document.timer_id => {
                        self.store.clear(&timer.task_id)?;
                        self.ledger.clear(&timer.timer_id)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
            RemoteChange::Removed {
                timer_id, task_id, ..
            } => {
                self.cache.invalidate(&timer_id)?;
                let Some(timer) = self.store.get(&task_id)? else {
                    return Ok(false);
                };
                if timer.timer_id != timer_id || self.ledger.is_pending(&timer_id)? {
                    return Ok(false);
                }
                self.store.clear(&task_id)?;
                self.ledger.clear(&timer_id)?;
                Ok(true)
            }
        }
    }

    /// Re-reads every other local timer still shown as running after another
    /// device started `running`.
    async fn recheck_other_running(&self, running: &RemoteTimerDocument) -> Result<(), TimerError> {
        for local in self.store.all_active_timers()? {
            if local.user_id != running.user_id
                || local.task_id == running.task_id
                || !local.is_running()
                || self.ledger.is_pending(&local.timer_id)?
            {
                continue;
            }

            let gateway = &self.gateway;
            let timer_id = local.timer_id.as_str();
            let remote = self
                .retry
                .execute("get_timer", move || gateway.get_timer(timer_id))
                .await?;
            match remote {
                Some(document) if document.is_active() => {
                    if document.status == TimerStatus::Running {
                        tracing::warn!(
                            task_id = %local.task_id,
                            other_task_id = %running.task_id,
                            "remote store holds two running timers for one user"
                        );
                    }
                    let state = document.to_local_state((self.now_provider)());
                    self.cache.set(timer_id, document, false)?;
                    self.store.set_timer_state(state)?;
                }
                _ => self.purge_ghost(&local).await?,
            }
        }
        Ok(())
    }
}

/// Clears a local entry that has no remote document, then deletes whatever
/// remote leftover may still exist. A document that is already gone is fine.
pub(crate) async fn purge_ghost_timer<G>(
    gateway: &G,
    store: &TimerStateStore,
    ledger: &WriteLedger,
    cache: &DocumentCache<RemoteTimerDocument>,
    local: &LocalTimerState,
) -> Result<(), InfraError>
where
    G: RemoteTimerGateway + ?Sized,
{
    tracing::info!(
        task_id = %local.task_id,
        timer_id = %local.timer_id,
        "clearing ghost timer"
    );
    store.clear(&local.task_id)?;
    ledger.clear(&local.timer_id)?;
    cache.invalidate(&local.timer_id)?;

    match gateway.delete_timer(&local.timer_id).await {
        Ok(()) | Err(InfraError::DocumentNotFound(_)) => {}
        Err(error) => {
            tracing::warn!(timer_id = %local.timer_id, %error, "best-effort ghost delete failed");
        }
    }
    Ok(())
}

impl<G> SyncCoordinator<G>
where
    G: RemoteTimerGateway + 'static,
{
    /// Opens one subscription across the tracked task set. Requires a
    /// completed [`Self::initialize`].
    pub async fn start_realtime(self: &Arc<Self>) -> Result<RealtimeHandle, TimerError> {
        if !self.store.is_globally_initialized()? {
            return Err(TimerError::SyncNotInitialized);
        }
        let scope = self.tracked_scope()?.ok_or(TimerError::SyncNotInitialized)?;
        let mut subscription = self
            .gateway
            .subscribe(SubscriptionScope::Tasks {
                user_id: scope.user_id.clone(),
                task_ids: scope.task_ids.clone(),
            })
            .await?;

        let coordinator = Arc::clone(self);
        let user_id = scope.user_id.clone();
        let task = tokio::spawn(async move {
            tracing::debug!(%user_id, "realtime timer subscription opened");
            while let Some(change) = subscription.next().await {
                let timer_id = change.timer_id().to_string();
                let task_id = change.task_id().to_string();
                if let Err(error) = coordinator.apply_remote_change(change).await {
                    tracing::warn!(%timer_id, %task_id, %error, "failed to apply remote timer change");
                }
            }
            tracing::debug!(%user_id, "realtime timer subscription closed");
        });
        Ok(RealtimeHandle { task, scope })
    }

    /// Whether `handle` is alive and follows the task set of the latest
    /// initialization.
    pub fn is_current(&self, handle: &RealtimeHandle) -> Result<bool, InfraError> {
        Ok(!handle.is_finished() && self.tracked_scope()?.as_ref() == Some(&handle.scope))
    }
}
