pub mod config;
pub mod enricher;
pub mod error;
