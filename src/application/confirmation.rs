use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const PROMPT_QUEUE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRequest {
    pub current_task_id: String,
    pub new_task_id: String,
    pub current_timer_id: String,
    /// Time the running timer would commit if sent now.
    pub running_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchAction {
    Send,
    Discard,
}

/// Wire shape of a confirmation answer: `{confirmed, action?}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchResponse {
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SwitchAction>,
}

impl SwitchResponse {
    pub fn declined() -> Self {
        Self {
            confirmed: false,
            action: None,
        }
    }

    pub fn send() -> Self {
        Self {
            confirmed: true,
            action: Some(SwitchAction::Send),
        }
    }

    pub fn discard() -> Self {
        Self {
            confirmed: true,
            action: Some(SwitchAction::Discard),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDecision {
    Declined,
    Discard,
    Send,
}

impl From<SwitchResponse> for SwitchDecision {
    fn from(response: SwitchResponse) -> Self {
        match (response.confirmed, response.action) {
            (false, _) => Self::Declined,
            (true, Some(SwitchAction::Discard)) => Self::Discard,
            (true, Some(SwitchAction::Send) | None) => Self::Send,
        }
    }
}

#[async_trait]
pub trait SwitchConfirmer: Send + Sync {
    async fn confirm_switch(&self, request: SwitchRequest) -> SwitchDecision;
}

/// Used when no confirmer is supplied: the running timer is always sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoSend;

#[async_trait]
impl SwitchConfirmer for AutoSend {
    async fn confirm_switch(&self, _request: SwitchRequest) -> SwitchDecision {
        SwitchDecision::Send
    }
}

pub struct FnConfirmer<F>(pub F);

#[async_trait]
impl<F, Fut> SwitchConfirmer for FnConfirmer<F>
where
    F: Fn(SwitchRequest) -> Fut + Send + Sync,
    Fut: Future<Output = SwitchResponse> + Send,
{
    async fn confirm_switch(&self, request: SwitchRequest) -> SwitchDecision {
        (self.0)(request).await.into()
    }
}

#[derive(Debug)]
pub struct ConfirmationPrompt {
    pub request: SwitchRequest,
    responder: oneshot::Sender<SwitchResponse>,
}

impl ConfirmationPrompt {
    /// Consumes the prompt. Returns `false` if the engine stopped waiting.
    pub fn respond(self, response: SwitchResponse) -> bool {
        self.responder.send(response).is_ok()
    }
}

/// Forwards each request as a [`ConfirmationPrompt`] and waits at most
/// `timeout` for the answer.
#[derive(Debug, Clone)]
pub struct ChannelConfirmer {
    prompts: mpsc::Sender<ConfirmationPrompt>,
    timeout: Duration,
}

impl ChannelConfirmer {
    pub fn new(timeout: Duration) -> (Self, mpsc::Receiver<ConfirmationPrompt>) {
        let (prompts, receiver) = mpsc::channel(PROMPT_QUEUE);
        (Self { prompts, timeout }, receiver)
    }
}

#[async_trait]
impl SwitchConfirmer for ChannelConfirmer {
    async fn confirm_switch(&self, request: SwitchRequest) -> SwitchDecision {
        let (responder, answer) = oneshot::channel();
        let new_task_id = request.new_task_id.clone();
        let exchange = async {
            self.prompts
                .send(ConfirmationPrompt { request, responder })
                .await
                .ok()?;
            answer.await.ok()
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Some(response)) => response.into(),
            Ok(None) => {
                tracing::debug!(task_id = %new_task_id, "confirmation abandoned, treating as declined");
                SwitchDecision::Declined
            }
            Err(_) => {
                tracing::warn!(task_id = %new_task_id, "confirmation timed out, treating as declined");
                SwitchDecision::Declined
            }
        }
    }
}
