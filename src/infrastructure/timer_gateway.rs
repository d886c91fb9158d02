use crate::domain::models::{
    RemoteTimerDocument, TaskAggregate, TimeLogEntry, TimerInterval, TimerStatus,
};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Partial update for [`RemoteTimerGateway::update_timer`]. `None` fields are left as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TimerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accumulated_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intervals: Option<Vec<TimerInterval>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopCommitRequest {
    pub timer_id: String,
    pub task_id: String,
    pub user_id: String,
    pub device_id: String,
    /// Closing interval of a timer that was still running, if any.
    pub final_interval: Option<TimerInterval>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopCommit {
    pub total_seconds: i64,
    pub log_entry: TimeLogEntry,
    pub aggregate: TaskAggregate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualEntryRequest {
    pub task_id: String,
    pub user_id: String,
    pub device_id: String,
    pub seconds: i64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualEntryCommit {
    pub log_entry: TimeLogEntry,
    pub aggregate: TaskAggregate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope {
    Timer(String),
    Tasks {
        user_id: String,
        task_ids: Vec<String>,
    },
}

impl SubscriptionScope {
    pub fn matches(&self, timer_id: &str, task_id: &str, user_id: &str) -> bool {
        match self {
            Self::Timer(id) => id == timer_id,
            Self::Tasks {
                user_id: scope_user,
                task_ids,
            } => scope_user == user_id && task_ids.iter().any(|id| id == task_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    Upserted(RemoteTimerDocument),
    Removed {
        timer_id: String,
        task_id: String,
        user_id: String,
    },
}

impl RemoteChange {
    pub fn timer_id(&self) -> &str {
        match self {
            Self::Upserted(document) => &document.timer_id,
            Self::Removed { timer_id, .. } => timer_id,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::Upserted(document) => &document.task_id,
            Self::Removed { task_id, .. } => task_id,
        }
    }
}

/// Stream of remote changes. Dropping it unsubscribes.
#[derive(Debug)]
pub struct TimerSubscription {
    receiver: mpsc::UnboundedReceiver<RemoteChange>,
    poller: Option<JoinHandle<()>>,
}

impl TimerSubscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<RemoteChange>) -> Self {
        Self {
            receiver,
            poller: None,
        }
    }

    pub fn with_poller(
        receiver: mpsc::UnboundedReceiver<RemoteChange>,
        poller: JoinHandle<()>,
    ) -> Self {
        Self {
            receiver,
            poller: Some(poller),
        }
    }

    pub async fn next(&mut self) -> Option<RemoteChange> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<RemoteChange> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for TimerSubscription {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

/// Remote document store. The `*_atomic` methods apply all their writes as
/// one batch or not at all.
#[async_trait]
pub trait RemoteTimerGateway: Send + Sync {
    async fn create_timer(
        &self,
        user_id: &str,
        task_id: &str,
        device_id: &str,
    ) -> Result<String, InfraError>;

    async fn get_timer(&self, timer_id: &str) -> Result<Option<RemoteTimerDocument>, InfraError>;

    async fn update_timer(&self, timer_id: &str, patch: &TimerPatch) -> Result<(), InfraError>;

    /// Fails with [`InfraError::DocumentNotFound`] when the document is already gone.
    async fn delete_timer(&self, timer_id: &str) -> Result<(), InfraError>;

    async fn list_active_timers(
        &self,
        user_id: &str,
        task_ids: &[String],
    ) -> Result<Vec<RemoteTimerDocument>, InfraError>;

    async fn start_atomic(
        &self,
        timer_id: &str,
        device_id: &str,
    ) -> Result<RemoteTimerDocument, InfraError>;

    async fn pause_atomic(
        &self,
        timer_id: &str,
        interval: &TimerInterval,
        device_id: &str,
    ) -> Result<RemoteTimerDocument, InfraError>;

    /// Finalizes the timer, writes its time-log record and increments the task
    /// aggregate in one batch. The timer document is removed on success.
    async fn stop_and_aggregate_atomic(
        &self,
        request: &StopCommitRequest,
    ) -> Result<StopCommit, InfraError>;

    async fn commit_manual_entry_atomic(
        &self,
        request: &ManualEntryRequest,
    ) -> Result<ManualEntryCommit, InfraError>;

    async fn get_task_aggregate(&self, task_id: &str)
        -> Result<Option<TaskAggregate>, InfraError>;

    async fn subscribe(&self, scope: SubscriptionScope) -> Result<TimerSubscription, InfraError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_scope_matches_user_and_task() {
        let scope = SubscriptionScope::Tasks {
            user_id: "usr-1".to_string(),
            task_ids: vec!["tsk-1".to_string(), "tsk-2".to_string()],
        };
        assert!(scope.matches("any", "tsk-2", "usr-1"));
        assert!(!scope.matches("any", "tsk-3", "usr-1"));
        assert!(!scope.matches("any", "tsk-1", "usr-2"));
    }

    #[test]
    fn timer_scope_matches_only_its_id() {
        let scope = SubscriptionScope::Timer("tmr-1".to_string());
        assert!(scope.matches("tmr-1", "tsk-1", "usr-1"));
        assert!(!scope.matches("tmr-2", "tsk-1", "usr-1"));
    }

    #[test]
    fn patch_serializes_only_present_fields() {
        let patch = TimerPatch {
            accumulated_seconds: Some(90),
            ..TimerPatch::default()
        };
        let value = serde_json::to_value(&patch).expect("serialize patch");
        assert_eq!(value, serde_json::json!({ "accumulatedSeconds": 90 }));
    }

    #[tokio::test]
    async fn dropping_subscription_aborts_poller() {
        let (_sender, receiver) = mpsc::unbounded_channel();
        let (alive_tx, alive_rx) = tokio::sync::oneshot::channel::<()>();
        let poller = tokio::spawn(async move {
            let _alive = alive_tx;
            tokio::time::sleep(std::time::Duration::from_secs(3_600)).await;
        });
        drop(TimerSubscription::with_poller(receiver, poller));

        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), alive_rx)
            .await
            .expect("poller should be aborted");
        assert!(closed.is_err());
    }
}
