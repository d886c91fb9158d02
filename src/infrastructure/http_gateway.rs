use crate::domain::models::{RemoteTimerDocument, TaskAggregate, TimerInterval};
use crate::infrastructure::config::RemoteConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::timer_gateway::{
    ManualEntryCommit, ManualEntryRequest, RemoteChange, RemoteTimerGateway, StopCommit,
    StopCommitRequest, SubscriptionScope, TimerPatch, TimerSubscription,
};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct HttpTimerGateway {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    poll_interval: Duration,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTimerBody<'a> {
    user_id: &'a str,
    task_id: &'a str,
    device_id: &'a str,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTimerResponse {
    timer_id: Option<String>,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct StartBody<'a> {
    device_id: &'a str,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct PauseBody<'a> {
    interval: &'a TimerInterval,
    device_id: &'a str,
}

#[derive(Debug, serde::Deserialize)]
struct TimerListResponse {
    timers: Option<Vec<RemoteTimerDocument>>,
}

impl HttpTimerGateway {
    pub fn new(base_url: &str) -> Result<Self, InfraError> {
        let trimmed = base_url.trim();
        let normalized = if trimmed.ends_with('/') {
            trimmed.to_string()
        } else {
            format!("{trimmed}/")
        };
        let base_url = Url::parse(&normalized).map_err(|error| {
            InfraError::InvalidConfig(format!("invalid remote base url '{trimmed}': {error}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(InfraError::InvalidConfig(format!(
                "remote base url '{trimmed}' cannot be a base"
            )));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| InfraError::InvalidConfig(format!("failed to build http client: {error}")))?;

        Ok(Self {
            client,
            base_url,
            api_key: None,
            poll_interval: Duration::from_millis(2_000),
        })
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self, InfraError> {
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            InfraError::InvalidConfig(
                "remote.baseUrl is not configured (set TASKTIMER_REMOTE_URL)".to_string(),
            )
        })?;
        let mut gateway = Self::new(base_url)?.with_poll_interval(Duration::from_millis(
            config.poll_interval_ms.max(100),
        ));
        gateway.api_key = config.api_key.clone();
        Ok(gateway)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::Rejected(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("remote base url cannot be a base".to_string())
            })?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match self.api_key.as_deref() {
            Some(api_key) => builder.bearer_auth(api_key),
            None => builder,
        }
    }

    fn transport_error(action: &str, error: reqwest::Error) -> InfraError {
        if error.is_timeout() {
            InfraError::Remote(format!("timeout while {action}: {error}"))
        } else if error.is_connect() {
            InfraError::Remote(format!("network error while {action}: connection refused: {error}"))
        } else {
            InfraError::Remote(format!("network error while {action}: {error}"))
        }
    }

    /// Maps a non-success status. 404 and 422 carry `subject` (the timer or
    /// task the request was about).
    fn status_error(status: StatusCode, body: &str, subject: &str) -> InfraError {
        let detail = if body.trim().is_empty() {
            format!("http {}", status.as_u16())
        } else {
            format!("http {}; body={body}", status.as_u16())
        };
        match status {
            StatusCode::NOT_FOUND => InfraError::DocumentNotFound(subject.to_string()),
            StatusCode::UNPROCESSABLE_ENTITY => InfraError::TaskAggregateMissing(subject.to_string()),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                InfraError::Remote(format!("service unavailable: {detail}"))
            }
            status if status.is_server_error() => {
                InfraError::Remote(format!("service unavailable: {detail}"))
            }
            _ => InfraError::Rejected(detail),
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        action: &str,
    ) -> Result<(StatusCode, String), InfraError> {
        let response = builder
            .send()
            .await
            .map_err(|error| Self::transport_error(action, error))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| Self::transport_error(action, error))?;
        Ok((status, body))
    }

    fn parse<T: DeserializeOwned>(body: &str, what: &str) -> Result<T, InfraError> {
        serde_json::from_str(body)
            .map_err(|error| InfraError::Remote(format!("invalid {what} payload: {error}; body={body}")))
    }

    async fn fetch_scope(
        &self,
        scope: &SubscriptionScope,
    ) -> Result<Vec<RemoteTimerDocument>, InfraError> {
        match scope {
            SubscriptionScope::Timer(timer_id) => {
                Ok(self.get_timer(timer_id).await?.into_iter().collect())
            }
            SubscriptionScope::Tasks { user_id, task_ids } => {
                self.list_active_timers(user_id, task_ids).await
            }
        }
    }

    async fn poll_changes(
        self,
        scope: SubscriptionScope,
        sender: mpsc::UnboundedSender<RemoteChange>,
    ) {
        let mut known = HashMap::new();
        let mut ticker = tokio::time::interval(self.poll_interval.max(Duration::from_millis(100)));
        loop {
            ticker.tick().await;
            if sender.is_closed() {
                break;
            }
            match self.fetch_scope(&scope).await {
                Ok(current) => {
                    for change in diff_snapshot(&mut known, current) {
                        if sender.send(change).is_err() {
                            tracing::debug!("timer subscription closed");
                            return;
                        }
                    }
                }
                Err(error) => tracing::warn!(%error, "timer subscription poll failed"),
            }
        }
    }
}

/// Changes between the previously `known` documents and the `current` poll
/// result. `known` is replaced by `current`.
pub fn diff_snapshot(
    known: &mut HashMap<String, RemoteTimerDocument>,
    current: Vec<RemoteTimerDocument>,
) -> Vec<RemoteChange> {
    let mut changes = Vec::new();
    let mut next = HashMap::with_capacity(current.len());
    for document in current {
        let changed = known
            .get(&document.timer_id)
            .is_none_or(|previous| previous != &document);
        if changed {
            changes.push(RemoteChange::Upserted(document.clone()));
        }
        next.insert(document.timer_id.clone(), document);
    }

    let mut removed: Vec<&RemoteTimerDocument> = known
        .values()
        .filter(|document| !next.contains_key(&document.timer_id))
        .collect();
    removed.sort_by(|left, right| left.timer_id.cmp(&right.timer_id));
    changes.extend(removed.into_iter().map(|document| RemoteChange::Removed {
        timer_id: document.timer_id.clone(),
        task_id: document.task_id.clone(),
        user_id: document.user_id.clone(),
    }));

    *known = next;
    changes
}

#[async_trait]
impl RemoteTimerGateway for HttpTimerGateway {
    async fn create_timer(
        &self,
        user_id: &str,
        task_id: &str,
        device_id: &str,
    ) -> Result<String, InfraError> {
        Self::ensure_non_empty(user_id, "user id")?;
        Self::ensure_non_empty(task_id, "task id")?;

        let builder = self
            .request(Method::POST, self.endpoint(&["timers"])?)
            .json(&CreateTimerBody {
                user_id,
                task_id,
                device_id,
            });
        let (status, body) = self.send(builder, "creating timer").await?;
        if !status.is_success() {
            return Err(Self::status_error(status, &body, task_id));
        }

        let parsed: CreateTimerResponse = Self::parse(&body, "timer create")?;
        parsed
            .timer_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::Remote("timer create response did not include timerId".to_string()))
    }

    async fn get_timer(&self, timer_id: &str) -> Result<Option<RemoteTimerDocument>, InfraError> {
        Self::ensure_non_empty(timer_id, "timer id")?;

        let builder = self.request(Method::GET, self.endpoint(&["timers", timer_id])?);
        let (status, body) = self.send(builder, "fetching timer").await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::status_error(status, &body, timer_id));
        }
        Self::parse(&body, "timer").map(Some)
    }

    async fn update_timer(&self, timer_id: &str, patch: &TimerPatch) -> Result<(), InfraError> {
        Self::ensure_non_empty(timer_id, "timer id")?;

        let builder = self
            .request(Method::PATCH, self.endpoint(&["timers", timer_id])?)
            .json(patch);
        let (status, body) = self.send(builder, "updating timer").await?;
        if !status.is_success() {
            return Err(Self::status_error(status, &body, timer_id));
        }
        Ok(())
    }

    async fn delete_timer(&self, timer_id: &str) -> Result<(), InfraError> {
        Self::ensure_non_empty(timer_id, "timer id")?;

        let builder = self.request(Method::DELETE, self.endpoint(&["timers", timer_id])?);
        let (status, body) = self.send(builder, "deleting timer").await?;
        if !status.is_success() {
            return Err(Self::status_error(status, &body, timer_id));
        }
        Ok(())
    }

    async fn list_active_timers(
        &self,
        user_id: &str,
        task_ids: &[String],
    ) -> Result<Vec<RemoteTimerDocument>, InfraError> {
        Self::ensure_non_empty(user_id, "user id")?;
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }

        let builder = self
            .request(Method::GET, self.endpoint(&["timers"])?)
            .query(&[
                ("userId", user_id.to_string()),
                ("taskIds", task_ids.join(",")),
                ("status", "active".to_string()),
            ]);
        let (status, body) = self.send(builder, "listing active timers").await?;
        if !status.is_success() {
            return Err(Self::status_error(status, &body, user_id));
        }

        let parsed: TimerListResponse = Self::parse(&body, "timer list")?;
        Ok(parsed
            .timers
            .unwrap_or_default()
            .into_iter()
            .filter(RemoteTimerDocument::is_active)
            .collect())
    }

    async fn start_atomic(
        &self,
        timer_id: &str,
        device_id: &str,
    ) -> Result<RemoteTimerDocument, InfraError> {
        Self::ensure_non_empty(timer_id, "timer id")?;

        let builder = self
            .request(Method::POST, self.endpoint(&["timers", timer_id, "start"])?)
            .json(&StartBody { device_id });
        let (status, body) = self.send(builder, "starting timer").await?;
        if !status.is_success() {
            return Err(Self::status_error(status, &body, timer_id));
        }
        Self::parse(&body, "timer start")
    }

    async fn pause_atomic(
        &self,
        timer_id: &str,
        interval: &TimerInterval,
        device_id: &str,
    ) -> Result<RemoteTimerDocument, InfraError> {
        Self::ensure_non_empty(timer_id, "timer id")?;

        let builder = self
            .request(Method::POST, self.endpoint(&["timers", timer_id, "pause"])?)
            .json(&PauseBody {
                interval,
                device_id,
            });
        let (status, body) = self.send(builder, "pausing timer").await?;
        if !status.is_success() {
            return Err(Self::status_error(status, &body, timer_id));
        }
        Self::parse(&body, "timer pause")
    }

    async fn stop_and_aggregate_atomic(
        &self,
        request: &StopCommitRequest,
    ) -> Result<StopCommit, InfraError> {
        Self::ensure_non_empty(&request.timer_id, "timer id")?;
        Self::ensure_non_empty(&request.task_id, "task id")?;

        let builder = self
            .request(Method::POST, self.endpoint(&["batches", "stop"])?)
            .json(request);
        let (status, body) = self.send(builder, "committing timer stop").await?;
        match status {
            StatusCode::NOT_FOUND => Err(InfraError::DocumentNotFound(request.timer_id.clone())),
            status if !status.is_success() => {
                Err(Self::status_error(status, &body, &request.task_id))
            }
            _ => Self::parse(&body, "stop commit"),
        }
    }

    async fn commit_manual_entry_atomic(
        &self,
        request: &ManualEntryRequest,
    ) -> Result<ManualEntryCommit, InfraError> {
        Self::ensure_non_empty(&request.task_id, "task id")?;

        let builder = self
            .request(Method::POST, self.endpoint(&["batches", "manual-entry"])?)
            .json(request);
        let (status, body) = self.send(builder, "committing manual entry").await?;
        if !status.is_success() {
            return Err(Self::status_error(status, &body, &request.task_id));
        }
        Self::parse(&body, "manual entry commit")
    }

    async fn get_task_aggregate(
        &self,
        task_id: &str,
    ) -> Result<Option<TaskAggregate>, InfraError> {
        Self::ensure_non_empty(task_id, "task id")?;

        let builder = self.request(Method::GET, self.endpoint(&["tasks", task_id, "aggregate"])?);
        let (status, body) = self.send(builder, "fetching task aggregate").await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::status_error(status, &body, task_id));
        }
        Self::parse(&body, "task aggregate").map(Some)
    }

    async fn subscribe(&self, scope: SubscriptionScope) -> Result<TimerSubscription, InfraError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let poller = tokio::spawn(self.clone().poll_changes(scope, sender));
        Ok(TimerSubscription::with_poller(receiver, poller))
    }
}
