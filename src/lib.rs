//! relaygate: an OpenAI-compatible relay gateway.
//!
//! Requests arrive in the canonical OpenAI shape, are priced and pre-authorized
//! against a quota ledger, relayed to an upstream channel through an adaptor, and
//! reconciled against the usage the upstream actually reported. Every call is
//! recorded in a deduplicating, conversation-aware chat log off the request path.

pub mod api_types;
pub mod app;
pub mod auth;
pub mod chat_log;
pub mod config;
pub mod content_policy;
pub mod db;
pub mod jobs;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod pricing;
pub mod providers;
pub mod relay;
pub mod routes;
pub mod routing;
pub mod streaming;
pub mod tokenizer;
pub mod usage_buffer;

pub use app::AppState;
pub use config::GatewayConfig;
