pub mod bootstrap;
pub mod confirmation;
pub mod error;
pub mod retry;
pub mod session;
pub mod sync_coordinator;
pub mod timer_controller;
pub mod timer_store;
pub mod write_ledger;
