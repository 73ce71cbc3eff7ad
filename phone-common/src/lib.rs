pub mod config;
pub mod consumer;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod normalizer;
pub mod pg;
pub mod queue;
pub mod retry;
pub mod store;
pub mod types;
