//! Patchwork Plugin Runtime
//!
//! Applies vetted plugins to a running host:
//! - Plugin contract and lifecycle (initialize, configure, pre-patch)
//! - Patch descriptors and the protected framework namespaces
//! - Priority-ordered Before/After interception
//! - Per-run orchestration with per-plugin failure isolation
//! - Savedata persistence and guarded host member access
//! - Aggregated compliance and application reports

pub mod accessor;
pub mod descriptor;
pub mod interception;
pub mod orchestrator;
pub mod plugin;
pub mod registry;
pub mod report;
pub mod savedata;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Module load failed for '{0}': {1}")]
    ModuleLoad(String, String),

    #[error("Interception engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Access to '{0}' denied by the active tier")]
    AccessDenied(String),

    #[error("Savedata error: {0}")]
    Savedata(String),

    #[error("Plugin IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;

/// Fully-qualified name of the base contract every plugin type derives from
pub const PLUGIN_BASE_TYPE: &str = "Patchwork.Plugin";
