pub mod app_state;
pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod issues;
pub mod keys;
pub mod maintenance;
pub mod models;
pub mod mutation;
pub mod notifications;
pub mod query;
pub mod rate_limiter;
pub mod realtime;
pub mod retry;
pub mod websocket;
