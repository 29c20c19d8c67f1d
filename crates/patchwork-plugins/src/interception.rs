//! Before/After interception of host functions
//!
//! The orchestrator only talks to an [`InterceptionEngine`]. [`HookTable`] is
//! the in-process engine: a per-target chain for each location, ordered by
//! descending priority and first-come for equal priorities.
//!
//! # Concurrency
//!
//! A `HookTable` is a cheap handle over `Arc<RwLock<..>>`. Clones share the
//! same table, so the host can keep one handle for dispatch while the
//! orchestrator registers through another.

use crate::descriptor::{FunctionDescriptor, InterceptionLocation};
use crate::{PluginError, PluginResult};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterceptError {
    #[error("Target function not found in host: {0}")]
    UnknownTarget(String),

    #[error("Stub {stub} is already attached to {target}")]
    DuplicateStub { target: String, stub: String },

    #[error("Interception engine state is unavailable")]
    Poisoned,
}

/// Attaches stubs to host functions
pub trait InterceptionEngine {
    fn intercept(
        &mut self,
        target: &FunctionDescriptor,
        stub: &FunctionDescriptor,
        location: InterceptionLocation,
        priority: i32,
        owner: &str,
    ) -> Result<(), InterceptError>;
}

/// Builds the engine for one orchestration run
pub trait EngineProvider {
    fn create_engine(&self) -> PluginResult<Box<dyn InterceptionEngine>>;
}

/// A stub attached to one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedStub {
    pub stub: FunctionDescriptor,
    pub priority: i32,
    /// Identity of the plugin that attached it
    pub owner: String,
}

#[derive(Debug, Default)]
struct HookTableInner {
    host_functions: HashSet<FunctionDescriptor>,
    chains: HashMap<(FunctionDescriptor, InterceptionLocation), Vec<AttachedStub>>,
}

#[derive(Debug, Clone, Default)]
pub struct HookTable {
    inner: Arc<RwLock<HookTableInner>>,
}

impl HookTable {
    /// Table over the given patchable host functions
    pub fn new(host_functions: impl IntoIterator<Item = FunctionDescriptor>) -> Self {
        let inner = HookTableInner {
            host_functions: host_functions.into_iter().collect(),
            chains: HashMap::new(),
        };
        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    pub fn add_host_function(&self, function: FunctionDescriptor) {
        if let Ok(mut inner) = self.inner.write() {
            inner.host_functions.insert(function);
        }
    }

    pub fn host_function_count(&self) -> usize {
        self.inner.read().map(|i| i.host_functions.len()).unwrap_or(0)
    }

    /// Stubs run for `target` at `location`, in call order
    pub fn dispatch_order(
        &self,
        target: &FunctionDescriptor,
        location: InterceptionLocation,
    ) -> Vec<AttachedStub> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.chains.get(&(target.clone(), location)).cloned())
            .unwrap_or_default()
    }

    /// Total attached stubs across all targets
    pub fn hook_count(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.chains.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Detach every stub attached by `owner`. Returns the number removed.
    pub fn detach_owner(&self, owner: &str) -> usize {
        let Ok(mut inner) = self.inner.write() else {
            return 0;
        };
        let mut count = 0;
        for chain in inner.chains.values_mut() {
            let before = chain.len();
            chain.retain(|s| s.owner != owner);
            count += before - chain.len();
        }
        count
    }
}

impl InterceptionEngine for HookTable {
    fn intercept(
        &mut self,
        target: &FunctionDescriptor,
        stub: &FunctionDescriptor,
        location: InterceptionLocation,
        priority: i32,
        owner: &str,
    ) -> Result<(), InterceptError> {
        let mut inner = self.inner.write().map_err(|_| InterceptError::Poisoned)?;
        if !inner.host_functions.contains(target) {
            return Err(InterceptError::UnknownTarget(target.to_string()));
        }

        let chain = inner.chains.entry((target.clone(), location)).or_default();
        if chain.iter().any(|s| &s.stub == stub) {
            return Err(InterceptError::DuplicateStub {
                target: target.to_string(),
                stub: stub.to_string(),
            });
        }

        // Descending priority, FIFO among equals
        let pos = chain
            .iter()
            .position(|s| s.priority < priority)
            .unwrap_or(chain.len());
        chain.insert(
            pos,
            AttachedStub {
                stub: stub.clone(),
                priority,
                owner: owner.to_string(),
            },
        );
        debug!(function = %target, %stub, ?location, priority, owner, "Stub attached");
        Ok(())
    }
}

impl EngineProvider for HookTable {
    fn create_engine(&self) -> PluginResult<Box<dyn InterceptionEngine>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| PluginError::EngineUnavailable("hook table lock poisoned".to_string()))?;
        if inner.host_functions.is_empty() {
            return Err(PluginError::EngineUnavailable(
                "no patchable host functions registered".to_string(),
            ));
        }
        drop(inner);
        Ok(Box::new(self.clone()))
    }
}
