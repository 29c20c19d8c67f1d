//! Multi-tier compliance verification
//!
//! Compiles (or loads) a plugin once and runs the analyzer against every tier
//! of the active policy. A plugin that cannot be compiled or loaded has every
//! tier marked untested rather than passed.

use crate::analyzer::{self, TierTestResult};
use crate::artifact::CompiledArtifact;
use crate::compiler::{CompilationService, CompileOptions, Diagnostic, ReferenceSet};
use crate::error::Error;
use crate::policy::PermissionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File extension of pre-built plugin modules
pub const MODULE_EXTENSION: &str = "pwmod";

/// A plugin submitted for verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginInput {
    Source { identity: String, files: Vec<PathBuf> },
    Binary { identity: String, path: PathBuf },
}

impl PluginInput {
    /// Classify a file by extension and derive its identity relative to `root`
    pub fn from_path(root: Option<&Path>, path: &Path) -> Self {
        let identity = relative_identity(root, path);
        let is_binary = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(MODULE_EXTENSION));
        if is_binary {
            Self::Binary {
                identity,
                path: path.to_path_buf(),
            }
        } else {
            Self::Source {
                identity,
                files: vec![path.to_path_buf()],
            }
        }
    }

    pub fn identity(&self) -> &str {
        match self {
            Self::Source { identity, .. } | Self::Binary { identity, .. } => identity,
        }
    }
}

/// Identity of a plugin: its path relative to the plugin root, `/` separated
pub fn relative_identity(root: Option<&Path>, path: &Path) -> String {
    let relative = root
        .and_then(|r| path.strip_prefix(r).ok())
        .unwrap_or(path);
    relative.to_string_lossy().replace('\\', "/")
}

/// Compliance results for one plugin across every tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginComplianceReport {
    pub identity: String,
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compile_errors: Vec<Diagnostic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_error: Option<String>,
    pub tiers: Vec<TierTestResult>,
}

impl PluginComplianceReport {
    fn untested(identity: &str, policy: &PermissionPolicy) -> Self {
        Self {
            identity: identity.to_string(),
            fingerprint: None,
            compile_errors: Vec::new(),
            load_error: None,
            tiers: policy
                .tiers()
                .iter()
                .map(|t| TierTestResult::untested(t.rank()))
                .collect(),
        }
    }

    /// True when the plugin never reached analysis
    pub fn is_untested(&self) -> bool {
        self.tiers.iter().all(|t| !t.tested)
    }

    /// Most restrictive tier the plugin passed
    pub fn highest_passed_tier(&self) -> Option<u8> {
        self.tiers
            .iter()
            .filter(|t| t.tested && t.passed)
            .map(|t| t.tier)
            .max()
    }

    pub fn tier(&self, rank: u8) -> Option<&TierTestResult> {
        self.tiers.iter().find(|t| t.tier == rank)
    }
}

/// Runs the analyzer across all tiers of a policy
pub struct Verifier<'a> {
    policy: &'a PermissionPolicy,
    compiler: &'a mut CompilationService,
    references: ReferenceSet,
}

impl<'a> Verifier<'a> {
    pub fn new(
        policy: &'a PermissionPolicy,
        compiler: &'a mut CompilationService,
        references: ReferenceSet,
    ) -> Self {
        Self {
            policy,
            compiler,
            references,
        }
    }

    /// Verify one plugin against every tier
    pub fn verify(&mut self, plugin: &PluginInput) -> PluginComplianceReport {
        let identity = plugin.identity();
        let mut report = PluginComplianceReport::untested(identity, self.policy);

        let artifact = match self.obtain_artifact(plugin) {
            Ok(artifact) => artifact,
            Err(Error::CompileFailed(diagnostics)) => {
                warn!(plugin = %identity, errors = diagnostics.len(), "Plugin failed to compile");
                report.compile_errors = diagnostics;
                return report;
            }
            Err(e) => {
                warn!(plugin = %identity, error = %e, "Plugin could not be loaded for analysis");
                report.load_error = Some(e.to_string());
                return report;
            }
        };

        report.fingerprint = Some(artifact.fingerprint());

        // Decode once; every tier sees the same image
        let decoded = artifact
            .image()
            .and_then(|image| artifact.debug_symbols().map(|symbols| (image, symbols)));
        let (image, symbols) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(plugin = %identity, error = %e, "Artifact could not be decoded");
                report.load_error = Some(e.to_string());
                return report;
            }
        };

        report.tiers = self
            .policy
            .tiers()
            .iter()
            .map(|tier| analyzer::analyze_image(&image, symbols.as_ref(), tier))
            .collect();

        info!(
            plugin = %identity,
            highest_tier = ?report.highest_passed_tier(),
            "Plugin verified"
        );
        report
    }

    /// Verify many plugins sequentially, in input order
    pub fn verify_all(&mut self, plugins: &[PluginInput]) -> Vec<PluginComplianceReport> {
        plugins.iter().map(|p| self.verify(p)).collect()
    }

    fn obtain_artifact(&mut self, plugin: &PluginInput) -> crate::Result<CompiledArtifact> {
        match plugin {
            PluginInput::Binary { path, .. } => CompiledArtifact::read(path),
            PluginInput::Source { files, .. } => {
                let mut artifacts = self
                    .compiler
                    .compile(files, &self.references, CompileOptions::for_analysis())?;
                artifacts.pop().ok_or_else(|| {
                    Error::MalformedArtifact("compiler returned no artifact".to_string())
                })
            }
        }
    }
}

#[cfg(test)]
#[path = "verifier_tests.rs"]
mod tests;
