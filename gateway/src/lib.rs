pub mod app_state;
pub mod auth_middleware;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod downstream;
pub mod handlers;
pub mod metrics;
pub mod rate_limiter;
pub mod router;
pub mod warmer;
