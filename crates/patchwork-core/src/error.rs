//! Error types for Patchwork

use thiserror::Error;

/// Result type alias using Patchwork's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Patchwork error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Artifact errors (E001-E099)
    #[error("Invalid module header: {0}")]
    InvalidHeader(String),

    #[error("Malformed artifact: {0}")]
    MalformedArtifact(String),

    #[error("Unsupported artifact format version {0}")]
    UnsupportedFormat(u16),

    // Compilation errors (E100-E199)
    #[error("Compilation failed with {} error(s)", .0.len())]
    CompileFailed(Vec<crate::compiler::Diagnostic>),

    #[error("Compiler could not be started: {0}. Check `compiler.program` with `patchwork config get compiler.program`.")]
    ToolchainUnavailable(String),

    #[error("Reference staging failed: {0}")]
    StagingFailed(String),

    #[error("Compiler emitted a module Patchwork cannot analyze: {0}")]
    ForeignModule(String),

    // Policy errors (E200-E299)
    #[error("Invalid permission policy: {0}")]
    InvalidPolicy(String),

    #[error("Tier {0} is not defined by the active policy. Run `patchwork tiers` to list tiers.")]
    TierNotFound(u8),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidHeader(_) => "E001",
            Self::MalformedArtifact(_) => "E002",
            Self::UnsupportedFormat(_) => "E003",
            Self::CompileFailed(_) => "E100",
            Self::ToolchainUnavailable(_) => "E101",
            Self::StagingFailed(_) => "E102",
            Self::ForeignModule(_) => "E103",
            Self::InvalidPolicy(_) => "E200",
            Self::TierNotFound(_) => "E201",
            Self::InvalidInput(_) => "E800",
            Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::ToolchainUnavailable(_) => {
                Some("patchwork config get compiler.program".to_string())
            }
            Self::ForeignModule(_) => Some(format!(
                "patchwork config set compiler.program {}",
                crate::config::DEFAULT_COMPILER
            )),
            Self::TierNotFound(_) => Some("patchwork tiers".to_string()),
            Self::InvalidPolicy(_) => Some("patchwork config get policy.path".to_string()),
            _ => None,
        }
    }

    /// Whether this error was produced while reading a module or symbol stream
    pub fn is_artifact_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidHeader(_) | Self::MalformedArtifact(_) | Self::UnsupportedFormat(_)
        )
    }
}
