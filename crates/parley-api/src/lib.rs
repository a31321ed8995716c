pub mod auth;
pub mod backend;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod orchestrator;
pub mod rate_limit;
pub mod wallet;
