//! Loaded modules and plugin discovery
//!
//! Every module of a run, shared dependencies included, is registered here
//! before any plugin executes. Type resolution only ever consults this
//! registry, so a plugin can see its dependencies and its own module but
//! nothing the host did not hand over explicitly.

use crate::descriptor::FunctionDescriptor;
use crate::plugin::{Plugin, PluginFault};
use crate::{PLUGIN_BASE_TYPE, PluginError, PluginResult};
use patchwork_core::artifact::{AssemblyImage, CompiledArtifact, TypeDef};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Upper bound on a module stream accepted by the registry
pub const MAX_MODULE_BYTES: usize = 64 * 1024 * 1024;

/// Creates plugin instances for the types of one loaded module
pub trait PluginActivator: Send + Sync {
    fn instantiate(&self, type_name: &str) -> Result<Box<dyn Plugin>, PluginFault>;
}

/// Turns a compiled artifact into executable code
pub trait ModuleLoader {
    fn load(&self, artifact: &CompiledArtifact) -> PluginResult<Arc<dyn PluginActivator>>;
}

type Factory = Box<dyn Fn() -> Result<Box<dyn Plugin>, PluginFault> + Send + Sync>;

/// Activator backed by host-registered constructors, keyed by type name
#[derive(Default)]
pub struct FactoryActivator {
    factories: HashMap<String, Factory>,
}

impl FactoryActivator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, type_name: &str, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Plugin>, PluginFault> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.to_string(), Box::new(factory));
        self
    }
}

impl PluginActivator for FactoryActivator {
    fn instantiate(&self, type_name: &str) -> Result<Box<dyn Plugin>, PluginFault> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| PluginFault::new(format!("no constructor for {type_name}")))?;
        factory()
    }
}

/// Loader handing out one shared activator per module name
#[derive(Default)]
pub struct StaticModuleLoader {
    activators: HashMap<String, Arc<dyn PluginActivator>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(
        mut self,
        module_name: &str,
        activator: impl PluginActivator + 'static,
    ) -> Self {
        self.activators.insert(module_name.to_string(), Arc::new(activator));
        self
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load(&self, artifact: &CompiledArtifact) -> PluginResult<Arc<dyn PluginActivator>> {
        self.activators.get(artifact.name()).cloned().ok_or_else(|| {
            PluginError::ModuleLoad(
                artifact.name().to_string(),
                "no executable code registered for module".to_string(),
            )
        })
    }
}

/// A module resolved into the registry
pub struct LoadedModule {
    pub identity: String,
    pub image: AssemblyImage,
    /// Shared dependencies are resolvable but never scanned for plugins
    pub is_dependency: bool,
    activator: Arc<dyn PluginActivator>,
}

impl LoadedModule {
    pub fn activator(&self) -> Arc<dyn PluginActivator> {
        Arc::clone(&self.activator)
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("identity", &self.identity)
            .field("image", &self.image.name)
            .field("is_dependency", &self.is_dependency)
            .finish()
    }
}

/// A plugin type found in a loaded module
#[derive(Clone)]
pub struct DiscoveredPlugin {
    pub identity: String,
    pub type_name: String,
    pub activator: Arc<dyn PluginActivator>,
}

impl fmt::Debug for DiscoveredPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveredPlugin")
            .field("identity", &self.identity)
            .field("type_name", &self.type_name)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: Vec<LoadedModule>,
    /// Full type name to module index; first registration wins
    type_index: HashMap<String, usize>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a shared dependency
    pub fn load_dependency(
        &mut self,
        artifact: &CompiledArtifact,
        loader: &dyn ModuleLoader,
    ) -> PluginResult<()> {
        self.insert(artifact.name().to_string(), artifact, loader, true)
    }

    /// Load a plugin module under its identity
    pub fn load_module(
        &mut self,
        identity: &str,
        artifact: &CompiledArtifact,
        loader: &dyn ModuleLoader,
    ) -> PluginResult<()> {
        self.insert(identity.to_string(), artifact, loader, false)
    }

    fn insert(
        &mut self,
        identity: String,
        artifact: &CompiledArtifact,
        loader: &dyn ModuleLoader,
        is_dependency: bool,
    ) -> PluginResult<()> {
        if artifact.module_bytes().len() > MAX_MODULE_BYTES {
            return Err(PluginError::ModuleLoad(
                identity,
                format!(
                    "module too large: {} bytes (limit {MAX_MODULE_BYTES})",
                    artifact.module_bytes().len()
                ),
            ));
        }
        let image = artifact
            .image()
            .map_err(|e| PluginError::ModuleLoad(identity.clone(), e.to_string()))?;
        let activator = loader.load(artifact)?;

        let index = self.modules.len();
        for ty in image.types() {
            self.type_index.entry(ty.full_name()).or_insert(index);
        }
        info!(
            module = %identity,
            types = image.types().count(),
            is_dependency,
            "Module loaded"
        );
        self.modules.push(LoadedModule {
            identity,
            image,
            is_dependency,
            activator,
        });
        Ok(())
    }

    pub fn modules(&self) -> &[LoadedModule] {
        &self.modules
    }

    pub fn resolve_type(&self, full_name: &str) -> Option<&TypeDef> {
        let module = self.modules.get(*self.type_index.get(full_name)?)?;
        module.image.find_type(full_name)
    }

    /// Whether `type_name`'s base chain reaches `base`. A type does not derive
    /// from itself; unresolvable links end the chain.
    pub fn derives_from(&self, type_name: &str, base: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = self.resolve_type(type_name);
        while let Some(ty) = current {
            if !seen.insert(ty.full_name()) {
                return false;
            }
            let Some(parent) = &ty.base_type else {
                return false;
            };
            let parent_name = parent.full_name();
            if parent_name == base {
                return true;
            }
            current = self.resolve_type(&parent_name);
        }
        false
    }

    /// Concrete plugin types of every non-dependency module, in load order
    pub fn discover_plugins(&self) -> Vec<DiscoveredPlugin> {
        let mut found = Vec::new();
        for module in self.modules.iter().filter(|m| !m.is_dependency) {
            for ty in module.image.types().filter(|t| t.is_concrete()) {
                let type_name = ty.full_name();
                if self.derives_from(&type_name, PLUGIN_BASE_TYPE) {
                    debug!(
                        module = %module.identity,
                        plugin = %type_name,
                        "Plugin type discovered"
                    );
                    found.push(DiscoveredPlugin {
                        identity: module.identity.clone(),
                        type_name,
                        activator: module.activator(),
                    });
                }
            }
        }
        found
    }

    /// Whether a loaded module defines the function a descriptor names
    pub fn resolves_function(&self, function: &FunctionDescriptor) -> bool {
        self.resolve_type(&function.declaring_type())
            .is_some_and(|ty| ty.methods.iter().any(|m| m.name == function.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PatchList;
    use crate::plugin::StageResult;
    use patchwork_core::artifact::{MethodDef, ModuleDef, TypeRef};

    struct Noop;

    impl Plugin for Noop {
        fn pre_patch(&mut self, _patches: &mut PatchList) -> StageResult {
            Ok(())
        }
    }

    fn type_def(ns: &str, name: &str, base: Option<&str>) -> TypeDef {
        TypeDef {
            namespace: ns.to_string(),
            name: name.to_string(),
            base_type: base.map(TypeRef::parse),
            is_abstract: false,
            is_interface: false,
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    fn artifact(name: &str, types: Vec<TypeDef>) -> CompiledArtifact {
        let image = AssemblyImage {
            name: name.to_string(),
            modules: vec![ModuleDef {
                name: format!("{name}.pwmod"),
                types,
            }],
        };
        CompiledArtifact::from_image(&image, None).expect("encode")
    }

    fn loader() -> StaticModuleLoader {
        StaticModuleLoader::new()
            .with_module("framework", FactoryActivator::new())
            .with_module("shared", FactoryActivator::new())
            .with_module(
                "mod",
                FactoryActivator::new().register("Mods.Direct", || Ok(Box::new(Noop))),
            )
    }

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        let loader = loader();
        registry
            .load_dependency(
                &artifact("framework", vec![type_def("Patchwork", "Plugin", None)]),
                &loader,
            )
            .expect("framework");
        registry
            .load_dependency(
                &artifact(
                    "shared",
                    vec![type_def("Shared", "BasePlugin", Some("Patchwork.Plugin"))],
                ),
                &loader,
            )
            .expect("shared");

        let mut abstract_plugin = type_def("Mods", "Abstract", Some("Patchwork.Plugin"));
        abstract_plugin.is_abstract = true;
        let mut hooks = type_def("Mods", "Hooks", None);
        hooks.methods.push(MethodDef {
            token: 1,
            name: "OnJump".to_string(),
            return_type: TypeRef::parse("System.Void"),
            parameters: Vec::new(),
            annotations: Vec::new(),
            locals: Vec::new(),
            body: Vec::new(),
        });
        registry
            .load_module(
                "mods/mod.cs",
                &artifact(
                    "mod",
                    vec![
                        type_def("Mods", "Direct", Some("Patchwork.Plugin")),
                        type_def("Mods", "Indirect", Some("Shared.BasePlugin")),
                        abstract_plugin,
                        hooks,
                        type_def("Mods", "Unrelated", Some("System.Object")),
                    ],
                ),
                &loader,
            )
            .expect("mod");
        registry
    }

    #[test]
    fn test_discovery_follows_base_chain_across_modules() {
        let registry = registry();
        let found: Vec<_> = registry
            .discover_plugins()
            .into_iter()
            .map(|p| (p.identity, p.type_name))
            .collect();
        assert_eq!(
            found,
            [
                ("mods/mod.cs".to_string(), "Mods.Direct".to_string()),
                ("mods/mod.cs".to_string(), "Mods.Indirect".to_string()),
            ]
        );
    }

    #[test]
    fn test_derives_from_handles_cycles() {
        let mut registry = ModuleRegistry::new();
        let loader = StaticModuleLoader::new().with_module("loop", FactoryActivator::new());
        registry
            .load_module(
                "loop.cs",
                &artifact(
                    "loop",
                    vec![
                        type_def("L", "A", Some("L.B")),
                        type_def("L", "B", Some("L.A")),
                    ],
                ),
                &loader,
            )
            .expect("load");
        assert!(!registry.derives_from("L.A", PLUGIN_BASE_TYPE));
        assert!(registry.discover_plugins().is_empty());
    }

    #[test]
    fn test_missing_code_is_module_load_error() {
        let mut registry = ModuleRegistry::new();
        let err = registry
            .load_module("x.cs", &artifact("unknown", Vec::new()), &loader())
            .unwrap_err();
        assert!(matches!(err, PluginError::ModuleLoad(name, _) if name == "unknown"));
        assert!(registry.modules().is_empty());
    }

    #[test]
    fn test_resolves_function() {
        let registry = registry();
        assert!(registry.resolves_function(&FunctionDescriptor::new("Mods", "Hooks", "OnJump")));
        assert!(!registry.resolves_function(&FunctionDescriptor::new("Mods", "Hooks", "OnLand")));
        assert!(!registry.resolves_function(&FunctionDescriptor::new("Mods", "Nope", "OnJump")));
    }

    #[test]
    fn test_activator_instantiates_registered_types() {
        let registry = registry();
        let plugins = registry.discover_plugins();
        assert!(plugins[0].activator.instantiate("Mods.Direct").is_ok());
        let fault = plugins[1]
            .activator
            .instantiate("Mods.Indirect")
            .err()
            .expect("no constructor");
        assert!(fault.message.contains("Mods.Indirect"));
    }
}
