pub mod application;
pub mod domain;
pub mod infrastructure;

#[cfg(test)]
mod test_support;

pub use application::bootstrap::{bootstrap_workspace, BootstrapResult};
pub use application::confirmation::{
    AutoSend, ChannelConfirmer, ConfirmationPrompt, FnConfirmer, SwitchConfirmer, SwitchDecision,
    SwitchRequest, SwitchResponse,
};
pub use application::error::TimerError;
pub use application::session::{SessionSnapshot, TimeTrackingSession, TimerView};
pub use application::sync_coordinator::{SyncCoordinator, SyncPhase, SyncReport};
pub use application::timer_controller::{
    OrphanedSession, PauseOutcome, StartOutcome, StartReport, StopOutcome, SwitchedTimer,
    TimerController,
};
pub use domain::models::{
    LocalTimerState, RemoteTimerDocument, TaskAggregate, TimeLogEntry, TimerInterval, TimerStatus,
};
pub use infrastructure::error::InfraError;
pub use infrastructure::http_gateway::HttpTimerGateway;
pub use infrastructure::in_memory_gateway::InMemoryTimerGateway;
pub use infrastructure::timer_gateway::RemoteTimerGateway;
