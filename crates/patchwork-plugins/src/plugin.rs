//! Plugin contract and lifecycle states

use crate::accessor::GuardedAccessor;
use crate::descriptor::PatchList;
use crate::savedata::Savedata;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure reported by a plugin callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFault {
    pub message: String,
}

impl PluginFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for PluginFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PluginFault {}

impl From<crate::PluginError> for PluginFault {
    fn from(err: crate::PluginError) -> Self {
        Self::new(err.to_string())
    }
}

/// Result of one lifecycle callback
pub type StageResult = Result<(), PluginFault>;

/// Identity and capability flags a plugin declares while initializing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: Option<String>,
    pub author: Option<String>,
    /// Load and persist a savedata section for this plugin
    pub uses_savedata: bool,
}

impl PluginInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            author: None,
            uses_savedata: true,
        }
    }
}

/// Handed to [`Plugin::initialize`]
pub struct InitContext<'a> {
    pub(crate) info: PluginInfo,
    pub(crate) accessor: Option<GuardedAccessor<'a>>,
}

impl<'a> InitContext<'a> {
    pub(crate) fn new(default_name: &str, accessor: Option<GuardedAccessor<'a>>) -> Self {
        Self {
            info: PluginInfo::named(default_name),
            accessor,
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.info.name = name.into();
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.info.version = Some(version.into());
    }

    pub fn set_author(&mut self, author: impl Into<String>) {
        self.info.author = Some(author.into());
    }

    pub fn set_uses_savedata(&mut self, uses: bool) {
        self.info.uses_savedata = uses;
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    /// Host member access, when the host grants it for this run
    pub fn accessor(&self) -> Option<&GuardedAccessor<'a>> {
        self.accessor.as_ref()
    }
}

/// The contract every plugin implements.
///
/// Callbacks run strictly in order: `initialize`, `configure`, `pre_patch`.
/// Returning an error, or panicking, stops this plugin only.
pub trait Plugin {
    fn initialize(&mut self, _ctx: &mut InitContext<'_>) -> StageResult {
        Ok(())
    }

    /// Merge persisted configuration. Changes are written back asynchronously.
    fn configure(&mut self, _savedata: &mut Savedata) -> StageResult {
        Ok(())
    }

    /// Declare the patches to apply
    fn pre_patch(&mut self, patches: &mut PatchList) -> StageResult;
}

/// Lifecycle stage a plugin failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Construction,
    Initialize,
    ConfigurationLoad,
    PrePatch,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Construction => "construction",
            Self::Initialize => "Initialize",
            Self::ConfigurationLoad => "configuration load",
            Self::PrePatch => "PrePatch",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum PluginState {
    Constructed,
    Initialized,
    Configured,
    PrePatched,
    Patched,
    Failed(LifecycleStage),
}

impl PluginState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Patched | Self::Failed(_))
    }
}

/// A lifecycle failure with its cause
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: LifecycleStage,
    pub message: String,
    /// Raised as a panic rather than returned
    pub panicked: bool,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed {}: {}", self.stage, self.message)?;
        if self.panicked {
            write!(f, " (panic)")?;
        }
        Ok(())
    }
}
