//! Combined compliance and patch application report

use crate::descriptor::FunctionDescriptor;
use crate::orchestrator::{
    ApplicationOutcome, DescriptorOutcome, DescriptorStatus, PluginRuntimeRecord, ResultCode,
};
use crate::plugin::{LifecycleStage, PluginState};
use chrono::{DateTime, Utc};
use patchwork_core::verifier::PluginComplianceReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Why a plugin, or one of its descriptors, did not take effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Construction,
    Initialize,
    ConfigurationLoad,
    PrePatch,
    ProtectedNamespace,
    NullDescriptor,
    InterceptionFailure,
}

impl From<LifecycleStage> for FailureReason {
    fn from(stage: LifecycleStage) -> Self {
        match stage {
            LifecycleStage::Construction => Self::Construction,
            LifecycleStage::Initialize => Self::Initialize,
            LifecycleStage::ConfigurationLoad => Self::ConfigurationLoad,
            LifecycleStage::PrePatch => Self::PrePatch,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Construction => "failed construction",
            Self::Initialize => "failed Initialize",
            Self::ConfigurationLoad => "failed configuration load",
            Self::PrePatch => "failed PrePatch",
            Self::ProtectedNamespace => "attempted protected-namespace patch",
            Self::NullDescriptor => "null descriptor",
            Self::InterceptionFailure => "interception failure",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub reason: FailureReason,
    pub detail: String,
}

/// One plugin instance as seen by the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub type_name: String,
    pub display_name: Option<String>,
    pub state: PluginState,
    pub patches_applied: usize,
    pub failures: Vec<FailureEntry>,
}

impl InstanceSummary {
    fn from_record(record: &PluginRuntimeRecord) -> Self {
        let mut failures = Vec::new();
        if let Some(failure) = &record.failure {
            failures.push(FailureEntry {
                reason: failure.stage.into(),
                detail: failure.message.clone(),
            });
        }

        let mut patches_applied = 0;
        for outcome in &record.descriptors {
            let entry = match &outcome.status {
                DescriptorStatus::Applied => {
                    patches_applied += 1;
                    continue;
                }
                DescriptorStatus::NullDescriptor => FailureEntry {
                    reason: FailureReason::NullDescriptor,
                    detail: describe_descriptor(outcome),
                },
                DescriptorStatus::ProtectedNamespace(namespace) => FailureEntry {
                    reason: FailureReason::ProtectedNamespace,
                    detail: format!("{} (protected: {namespace})", describe_descriptor(outcome)),
                },
                DescriptorStatus::InterceptionFailed(message) => FailureEntry {
                    reason: FailureReason::InterceptionFailure,
                    detail: message.clone(),
                },
            };
            failures.push(entry);
        }

        Self {
            type_name: record.type_name.clone(),
            display_name: record.info.as_ref().map(|i| i.name.clone()),
            state: record.state,
            patches_applied,
            failures,
        }
    }
}

fn describe_descriptor(outcome: &DescriptorOutcome) -> String {
    let side = |f: &Option<FunctionDescriptor>| {
        f.as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "<none>".to_string())
    };
    format!(
        "{} -> {}",
        side(&outcome.descriptor.stub),
        side(&outcome.descriptor.target)
    )
}

/// Everything known about one plugin identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub compliance: Option<PluginComplianceReport>,
    pub instances: Vec<InstanceSummary>,
}

impl PluginEntry {
    pub fn failure_reasons(&self) -> Vec<FailureReason> {
        self.instances
            .iter()
            .flat_map(|i| i.failures.iter().map(|f| f.reason))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub generated_at: DateTime<Utc>,
    pub run_id: Option<Uuid>,
    pub result: ResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_detail: Option<String>,
    /// Keyed by relative source path
    pub plugins: BTreeMap<String, PluginEntry>,
}

impl AggregateReport {
    pub fn plugin(&self, identity: &str) -> Option<&PluginEntry> {
        self.plugins.get(identity)
    }

    pub fn instance(&self, type_name: &str) -> Option<&InstanceSummary> {
        self.plugins
            .values()
            .flat_map(|p| p.instances.iter())
            .find(|i| i.type_name == type_name)
    }
}

/// Fold compliance reports and an optional run outcome into one report.
///
/// Without an outcome the result code is `Success`: nothing was applied, so
/// nothing could fail fatally.
pub fn aggregate(
    compliance: &[PluginComplianceReport],
    outcome: Option<&ApplicationOutcome>,
) -> AggregateReport {
    let mut plugins: BTreeMap<String, PluginEntry> = BTreeMap::new();
    for report in compliance {
        plugins.entry(report.identity.clone()).or_default().compliance = Some(report.clone());
    }

    if let Some(outcome) = outcome {
        for record in &outcome.records {
            plugins
                .entry(record.identity.clone())
                .or_default()
                .instances
                .push(InstanceSummary::from_record(record));
        }
    }

    AggregateReport {
        generated_at: Utc::now(),
        run_id: outcome.map(|o| o.run_id),
        result: outcome.map_or(ResultCode::Success, |o| o.result),
        fatal_detail: outcome.and_then(|o| o.fatal_detail.clone()),
        plugins,
    }
}
