//! canto-core: shared types and configuration for Canto.
//!
//! Holds the pieces every other crate agrees on: the `canto.toml`
//! configuration ([`CantoConfig`]), the health monitor tuning knobs
//! ([`HealthOptions`]), and the wire model of the backend health endpoint
//! ([`HealthResponse`]).

pub mod config;
pub mod error;
pub mod types;

pub use config::{ApiConfig, CantoConfig, HealthOptions};
pub use error::ConfigError;
pub use types::{HealthResponse, HealthStatus};
