//! ---
//! fl_section: "01-core-orchestration"
//! fl_type: "source"
//! fl_scope: "code"
//! fl_description: "Shared primitives and utilities for the core runtime."
//! fl_version: "v0.0.0-prealpha"
//! fl_owner: "tbd"
//! ---
//! Shared primitives for the Faultline orchestrator workspace: configuration
//! loading and tracing bootstrap consumed across the workspace.

pub mod config;
pub mod logging;

pub use config::{AppConfig, EngineConfig, LoggingConfig, MetricsConfig};
pub use logging::{init_tracing, LogFormat};
