pub mod activity_log;
pub mod aggregate_mirror;
pub mod config;
pub mod document_cache;
pub mod error;
pub mod http_gateway;
pub mod in_memory_gateway;
pub mod storage;
pub mod timer_gateway;
pub mod timer_state_repository;
