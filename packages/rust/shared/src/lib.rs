//! Shared error model and configuration for Phasewatch.
//!
//! This crate is the foundation depended on by all other Phasewatch crates.
//! It provides:
//! - [`PhasewatchError`], the unified error type
//! - Configuration ([`AppConfig`], [`DashboardSettings`], config loading)

pub mod config;
pub mod error;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DashboardSettings, ExportSettings, config_dir, config_file_path, init_config,
    load_config, load_config_from,
};
pub use error::{PhasewatchError, Result};
