//! Patchwork Core Library
//!
//! This crate provides the vetting half of Patchwork:
//! - Permission tiers and the reference four tier policy
//! - Compiled artifact format with debug symbol streams
//! - Bytecode compliance analysis against a tier
//! - On-demand plugin compilation with staged references
//! - Multi-tier verification of plugins
//! - Configuration

pub mod analyzer;
pub mod artifact;
pub mod compiler;
pub mod config;
pub mod error;
pub mod policy;
pub mod verifier;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::analyzer::{TierTestResult, ViolationRecord};
    pub use crate::artifact::CompiledArtifact;
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::policy::{PermissionPolicy, PermissionTier, SymbolVerdict};
    pub use crate::verifier::{PluginComplianceReport, PluginInput, Verifier};
}

#[cfg(test)]
mod config_tests;
