//! Patch descriptors declared by plugins during pre-patch

use patchwork_core::policy::namespace_contains;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordering used when a descriptor does not request a priority
pub const DEFAULT_PRIORITY: i32 = 400;

/// Namespaces owned by the framework and its interception engine. Fixed.
pub const PROTECTED_NAMESPACES: [&str; 3] = ["Patchwork", "HarmonyLib", "MonoMod"];

/// Resolvable reference to a function or constructor
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub namespace: String,
    pub type_name: String,
    pub name: String,
}

impl FunctionDescriptor {
    pub fn new(
        namespace: impl Into<String>,
        type_name: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            type_name: type_name.into(),
            name: name.into(),
        }
    }

    /// Parse `Ns.Type::Method`
    pub fn parse(qualified: &str) -> Option<Self> {
        let (owner, name) = qualified.split_once("::")?;
        let (namespace, type_name) = owner.rsplit_once('.').unwrap_or(("", owner));
        if type_name.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, type_name, name))
    }

    pub fn constructor(namespace: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::new(namespace, type_name, ".ctor")
    }

    pub fn declaring_type(&self) -> String {
        if self.namespace.is_empty() {
            self.type_name.clone()
        } else {
            format!("{}.{}", self.namespace, self.type_name)
        }
    }
}

impl fmt::Display for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.declaring_type(), self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterceptionLocation {
    Before,
    After,
}

/// A request to run `stub` before or after `target`.
///
/// Either side may be missing when a plugin failed to resolve it; such
/// descriptors are rejected when applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDescriptor {
    pub target: Option<FunctionDescriptor>,
    pub stub: Option<FunctionDescriptor>,
    pub location: InterceptionLocation,
    /// `None` means host default ordering
    pub priority: Option<i32>,
}

impl PatchDescriptor {
    pub fn before(target: FunctionDescriptor, stub: FunctionDescriptor) -> Self {
        Self {
            target: Some(target),
            stub: Some(stub),
            location: InterceptionLocation::Before,
            priority: None,
        }
    }

    pub fn after(target: FunctionDescriptor, stub: FunctionDescriptor) -> Self {
        Self {
            target: Some(target),
            stub: Some(stub),
            location: InterceptionLocation::After,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }
}

/// Descriptors collected from one plugin's pre-patch step
#[derive(Debug, Default)]
pub struct PatchList {
    descriptors: Vec<PatchDescriptor>,
}

impl PatchList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, descriptor: PatchDescriptor) {
        self.descriptors.push(descriptor);
    }

    pub fn before(&mut self, target: FunctionDescriptor, stub: FunctionDescriptor) {
        self.push(PatchDescriptor::before(target, stub));
    }

    pub fn after(&mut self, target: FunctionDescriptor, stub: FunctionDescriptor) {
        self.push(PatchDescriptor::after(target, stub));
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn into_inner(self) -> Vec<PatchDescriptor> {
        self.descriptors
    }
}

/// The framework namespaces no plugin may patch
#[derive(Debug, Clone)]
pub struct ProtectedNamespaces {
    entries: Vec<String>,
}

impl ProtectedNamespaces {
    pub fn framework() -> Self {
        Self {
            entries: PROTECTED_NAMESPACES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The protected entry covering `namespace`, if any
    pub fn matching(&self, namespace: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|p| namespace_contains(p, namespace))
            .map(String::as_str)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

impl Default for ProtectedNamespaces {
    fn default() -> Self {
        Self::framework()
    }
}
