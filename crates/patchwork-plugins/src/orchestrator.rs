//! Patch orchestration
//!
//! One call to [`Orchestrator::run`] takes a batch of vetted plugin modules
//! through loading, discovery and the plugin lifecycle, then applies the
//! declared patches through the interception engine.
//!
//! Failures come in two sizes. Batch-fatal conditions (dependency load,
//! engine construction, module load) abort the run before any plugin code
//! executes. Everything after that is isolated per plugin: an error or panic
//! in one plugin's callback moves that plugin to `Failed(stage)` and the run
//! moves on to the next one.

use crate::accessor::{GuardedAccessor, MemberStore};
use crate::descriptor::{PatchDescriptor, PatchList, ProtectedNamespaces};
use crate::interception::{EngineProvider, InterceptionEngine};
use crate::plugin::{
    InitContext, LifecycleStage, Plugin, PluginFault, PluginInfo, PluginState, StageFailure,
};
use crate::registry::{DiscoveredPlugin, ModuleLoader, ModuleRegistry};
use crate::savedata::{Savedata, SavedataStore};
use chrono::{DateTime, Utc};
use patchwork_core::artifact::CompiledArtifact;
use patchwork_core::policy::PermissionTier;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Conditions that abort a whole run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Shared dependency '{0}' failed to load: {1}")]
    DependencyLoad(String, String),

    #[error("Interception engine could not be constructed: {0}")]
    EngineConstruction(String),

    #[error("Plugin module '{0}' failed to load: {1}")]
    ModuleLoad(String, String),
}

impl OrchestratorError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::DependencyLoad(..) => ResultCode::DependencyLoadFailed,
            Self::EngineConstruction(_) => ResultCode::EngineConstructionFailed,
            Self::ModuleLoad(..) => ResultCode::ModuleLoadFailed,
        }
    }
}

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    DependencyLoadFailed,
    EngineConstructionFailed,
    ModuleLoadFailed,
}

/// A vetted plugin module handed to the orchestrator
#[derive(Debug, Clone)]
pub struct PluginPackage {
    /// Relative source path; also the savedata key
    pub identity: String,
    pub artifact: CompiledArtifact,
}

impl PluginPackage {
    pub fn new(identity: impl Into<String>, artifact: CompiledArtifact) -> Self {
        Self {
            identity: identity.into(),
            artifact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum DescriptorStatus {
    Applied,
    /// Target or stub missing
    NullDescriptor,
    /// Target lies in the named protected namespace
    ProtectedNamespace(String),
    InterceptionFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorOutcome {
    pub descriptor: PatchDescriptor,
    pub status: DescriptorStatus,
}

/// What happened to one plugin instance during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRuntimeRecord {
    pub identity: String,
    pub type_name: String,
    pub state: PluginState,
    /// Declared during initialize; absent if the plugin never got that far
    pub info: Option<PluginInfo>,
    pub descriptors: Vec<DescriptorOutcome>,
    pub failure: Option<StageFailure>,
}

impl PluginRuntimeRecord {
    fn new(plugin: &DiscoveredPlugin) -> Self {
        Self {
            identity: plugin.identity.clone(),
            type_name: plugin.type_name.clone(),
            state: PluginState::Constructed,
            info: None,
            descriptors: Vec::new(),
            failure: None,
        }
    }

    fn fail(&mut self, failure: StageFailure) {
        warn!(
            plugin = %self.type_name,
            identity = %self.identity,
            stage = %failure.stage,
            panicked = failure.panicked,
            "Plugin {failure}"
        );
        self.state = PluginState::Failed(failure.stage);
        self.failure = Some(failure);
    }
}

/// Result of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: ResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_detail: Option<String>,
    pub records: Vec<PluginRuntimeRecord>,
}

impl ApplicationOutcome {
    pub fn is_success(&self) -> bool {
        self.result == ResultCode::Success
    }

    pub fn records_for<'a>(
        &'a self,
        identity: &'a str,
    ) -> impl Iterator<Item = &'a PluginRuntimeRecord> + 'a {
        self.records.iter().filter(move |r| r.identity == identity)
    }

    pub fn record(&self, type_name: &str) -> Option<&PluginRuntimeRecord> {
        self.records.iter().find(|r| r.type_name == type_name)
    }
}

/// State owned by a single run
pub struct OrchestrationContext {
    pub run_id: Uuid,
    pub registry: ModuleRegistry,
    pub protected: ProtectedNamespaces,
    engine: Box<dyn InterceptionEngine>,
    savedata: Arc<dyn SavedataStore>,
}

impl OrchestrationContext {
    pub fn engine(&mut self) -> &mut dyn InterceptionEngine {
        self.engine.as_mut()
    }
}

struct MemberAccess {
    tier: PermissionTier,
    store: Arc<dyn MemberStore>,
}

pub struct Orchestrator {
    loader: Box<dyn ModuleLoader>,
    engines: Box<dyn EngineProvider>,
    savedata: Arc<dyn SavedataStore>,
    protected: ProtectedNamespaces,
    dependencies: Vec<CompiledArtifact>,
    member_access: Option<MemberAccess>,
}

impl Orchestrator {
    pub fn new(
        loader: impl ModuleLoader + 'static,
        engines: impl EngineProvider + 'static,
        savedata: Arc<dyn SavedataStore>,
    ) -> Self {
        Self {
            loader: Box::new(loader),
            engines: Box::new(engines),
            savedata,
            protected: ProtectedNamespaces::framework(),
            dependencies: Vec::new(),
            member_access: None,
        }
    }

    /// Shared module loaded ahead of every plugin module
    pub fn with_dependency(mut self, artifact: CompiledArtifact) -> Self {
        self.dependencies.push(artifact);
        self
    }

    /// Grant plugins guarded host member access under `tier`
    pub fn with_member_access(mut self, tier: PermissionTier, store: Arc<dyn MemberStore>) -> Self {
        self.member_access = Some(MemberAccess { tier, store });
        self
    }

    /// Apply a batch of plugin modules
    pub fn run(&self, packages: &[PluginPackage]) -> ApplicationOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, modules = packages.len(), "Starting patch application");

        let mut ctx = match self.prepare(run_id, packages) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(%run_id, error = %e, "Patch application aborted");
                return ApplicationOutcome {
                    run_id,
                    started_at,
                    finished_at: Utc::now(),
                    result: e.result_code(),
                    fatal_detail: Some(e.to_string()),
                    records: Vec::new(),
                };
            }
        };

        let discovered = ctx.registry.discover_plugins();
        info!(%run_id, plugins = discovered.len(), "Plugins discovered");

        let records = discovered
            .iter()
            .map(|plugin| self.run_plugin(&mut ctx, plugin))
            .collect::<Vec<_>>();

        let patched = records
            .iter()
            .filter(|r| r.state == PluginState::Patched)
            .count();
        info!(
            %run_id,
            patched,
            failed = records.len() - patched,
            "Patch application finished"
        );

        ApplicationOutcome {
            run_id,
            started_at,
            finished_at: Utc::now(),
            result: ResultCode::Success,
            fatal_detail: None,
            records,
        }
    }

    /// Load everything and build the engine before any plugin code runs
    fn prepare(
        &self,
        run_id: Uuid,
        packages: &[PluginPackage],
    ) -> Result<OrchestrationContext, OrchestratorError> {
        let mut registry = ModuleRegistry::new();
        for dependency in &self.dependencies {
            registry
                .load_dependency(dependency, self.loader.as_ref())
                .map_err(|e| {
                    OrchestratorError::DependencyLoad(dependency.name().to_string(), e.to_string())
                })?;
        }

        let engine = self
            .engines
            .create_engine()
            .map_err(|e| OrchestratorError::EngineConstruction(e.to_string()))?;

        for package in packages {
            registry
                .load_module(&package.identity, &package.artifact, self.loader.as_ref())
                .map_err(|e| {
                    OrchestratorError::ModuleLoad(package.identity.clone(), e.to_string())
                })?;
        }

        Ok(OrchestrationContext {
            run_id,
            registry,
            protected: self.protected.clone(),
            engine,
            savedata: Arc::clone(&self.savedata),
        })
    }

    fn run_plugin(
        &self,
        ctx: &mut OrchestrationContext,
        plugin: &DiscoveredPlugin,
    ) -> PluginRuntimeRecord {
        let mut record = PluginRuntimeRecord::new(plugin);
        debug!(run_id = %ctx.run_id, plugin = %plugin.type_name, "Constructing plugin");

        let mut instance = match guarded(LifecycleStage::Construction, || {
            plugin.activator.instantiate(&plugin.type_name)
        }) {
            Ok(instance) => instance,
            Err(failure) => {
                record.fail(failure);
                return record;
            }
        };

        let (initialized, info) = {
            let accessor = self
                .member_access
                .as_ref()
                .map(|m| GuardedAccessor::new(&m.tier, &ctx.protected, m.store.as_ref()));
            let mut init = InitContext::new(&plugin.type_name, accessor);
            let result = guarded(LifecycleStage::Initialize, || instance.initialize(&mut init));
            (result, init.info)
        };
        record.info = Some(info.clone());
        if let Err(failure) = initialized {
            record.fail(failure);
            return record;
        }
        record.state = PluginState::Initialized;

        if let Err(failure) = self.configure(ctx, &plugin.identity, &info, instance.as_mut()) {
            record.fail(failure);
            return record;
        }
        record.state = PluginState::Configured;

        let mut patches = PatchList::new();
        let prepared = guarded(LifecycleStage::PrePatch, || instance.pre_patch(&mut patches));
        if let Err(failure) = prepared {
            record.fail(failure);
            return record;
        }
        record.state = PluginState::PrePatched;

        record.descriptors = patches
            .into_inner()
            .into_iter()
            .map(|descriptor| apply_descriptor(ctx, &plugin.identity, descriptor))
            .collect();
        record.state = PluginState::Patched;
        debug!(
            plugin = %plugin.type_name,
            descriptors = record.descriptors.len(),
            "Plugin patched"
        );
        record
    }

    fn configure(
        &self,
        ctx: &OrchestrationContext,
        identity: &str,
        info: &PluginInfo,
        instance: &mut dyn Plugin,
    ) -> Result<(), StageFailure> {
        if !info.uses_savedata {
            return Ok(());
        }
        let stage = LifecycleStage::ConfigurationLoad;
        let document = ctx.savedata.load(identity).map_err(|e| StageFailure {
            stage,
            message: e.to_string(),
            panicked: false,
        })?;
        if document.created {
            debug!(plugin = %identity, "Created savedata section");
        }

        let mut savedata = document.savedata;
        guarded(stage, || instance.configure(&mut savedata))?;
        persist_detached(Arc::clone(&ctx.savedata), identity.to_string(), savedata);
        Ok(())
    }
}

fn apply_descriptor(
    ctx: &mut OrchestrationContext,
    identity: &str,
    descriptor: PatchDescriptor,
) -> DescriptorOutcome {
    let status = match (&descriptor.target, &descriptor.stub) {
        (Some(target), Some(stub)) => {
            if let Some(namespace) = ctx.protected.matching(&target.declaring_type()) {
                warn!(
                    plugin = %identity,
                    function = %target,
                    "Attempted patch of protected namespace"
                );
                DescriptorStatus::ProtectedNamespace(namespace.to_string())
            } else if !ctx.registry.resolves_function(stub) {
                DescriptorStatus::InterceptionFailed(format!(
                    "stub {stub} not found in loaded modules"
                ))
            } else {
                let priority = descriptor.effective_priority();
                match ctx
                    .engine
                    .intercept(target, stub, descriptor.location, priority, identity)
                {
                    Ok(()) => DescriptorStatus::Applied,
                    Err(e) => DescriptorStatus::InterceptionFailed(e.to_string()),
                }
            }
        }
        _ => DescriptorStatus::NullDescriptor,
    };

    if let DescriptorStatus::InterceptionFailed(message) = &status {
        warn!(plugin = %identity, error = %message, "Interception failed");
    }
    DescriptorOutcome { descriptor, status }
}

/// Run one lifecycle callback, turning errors and panics into a stage failure
fn guarded<T, F>(stage: LifecycleStage, f: F) -> Result<T, StageFailure>
where
    F: FnOnce() -> Result<T, PluginFault>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(fault)) => Err(StageFailure {
            stage,
            message: fault.message,
            panicked: false,
        }),
        Err(payload) => Err(StageFailure {
            stage,
            message: panic_message(payload.as_ref()),
            panicked: true,
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Save without blocking the run; failures are logged and dropped
fn persist_detached(store: Arc<dyn SavedataStore>, identity: String, savedata: Savedata) {
    let task = async move {
        if let Err(e) = store.save(identity.clone(), savedata).await {
            warn!(plugin = %identity, error = %e, "Failed to persist savedata");
        }
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => {
            std::thread::spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(task),
                    Err(e) => warn!(error = %e, "No runtime available to persist savedata"),
                }
            });
        }
    }
}
