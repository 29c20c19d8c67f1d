//! Permission tiers
//!
//! A tier is a flat set of restriction and whitelist rules over fully-qualified
//! symbol names. Tiers are evaluated independently; a higher rank only means
//! "more restrictive" for reporting purposes, never that rules are inherited.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Outcome of classifying a single symbol against a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolVerdict {
    Restricted,
    Whitelisted,
    Unrestricted,
}

impl SymbolVerdict {
    pub fn is_restricted(self) -> bool {
        self == Self::Restricted
    }
}

/// One capability tier of a permission policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionTier {
    rank: u8,
    name: String,
    #[serde(default)]
    restricted_namespaces: BTreeSet<String>,
    #[serde(default)]
    restricted_types: BTreeSet<String>,
    #[serde(default)]
    restricted_methods: BTreeSet<String>,
    #[serde(default)]
    whitelisted_namespaces: BTreeSet<String>,
    #[serde(default)]
    whitelisted_types: BTreeSet<String>,
}

impl PermissionTier {
    pub fn builder(rank: u8, name: impl Into<String>) -> PermissionTierBuilder {
        PermissionTierBuilder {
            tier: PermissionTier {
                rank,
                name: name.into(),
                restricted_namespaces: BTreeSet::new(),
                restricted_types: BTreeSet::new(),
                restricted_methods: BTreeSet::new(),
                whitelisted_namespaces: BTreeSet::new(),
                whitelisted_types: BTreeSet::new(),
            },
        }
    }

    pub fn rank(&self) -> u8 {
        self.rank
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn restricted_namespaces(&self) -> &BTreeSet<String> {
        &self.restricted_namespaces
    }

    pub fn restricted_types(&self) -> &BTreeSet<String> {
        &self.restricted_types
    }

    pub fn restricted_methods(&self) -> &BTreeSet<String> {
        &self.restricted_methods
    }

    pub fn whitelisted_namespaces(&self) -> &BTreeSet<String> {
        &self.whitelisted_namespaces
    }

    pub fn whitelisted_types(&self) -> &BTreeSet<String> {
        &self.whitelisted_types
    }

    /// Classify a fully-qualified type or namespace name.
    ///
    /// Whitelist checks run before restriction checks, so a whitelisted type
    /// or namespace carves an exception out of a restricted namespace.
    pub fn classify(&self, symbol: &str) -> SymbolVerdict {
        let symbol = strip_array_suffix(symbol);

        if self.whitelisted_types.contains(symbol) {
            return SymbolVerdict::Whitelisted;
        }
        if self
            .whitelisted_namespaces
            .iter()
            .any(|ns| namespace_contains(ns, symbol))
        {
            return SymbolVerdict::Whitelisted;
        }
        if self.restricted_types.contains(symbol) {
            return SymbolVerdict::Restricted;
        }
        if self
            .restricted_namespaces
            .iter()
            .any(|ns| namespace_contains(ns, symbol))
        {
            return SymbolVerdict::Restricted;
        }

        SymbolVerdict::Unrestricted
    }

    /// Exact match of a plain method name (`Ns.Type::Method`)
    pub fn is_method_restricted(&self, plain_name: &str) -> bool {
        self.restricted_methods.contains(plain_name)
    }
}

/// Builder for [`PermissionTier`]; the tier is frozen once built
#[derive(Debug, Clone)]
pub struct PermissionTierBuilder {
    tier: PermissionTier,
}

impl PermissionTierBuilder {
    pub fn restrict_namespace(mut self, ns: impl Into<String>) -> Self {
        self.tier.restricted_namespaces.insert(ns.into());
        self
    }

    pub fn restrict_type(mut self, ty: impl Into<String>) -> Self {
        self.tier
            .restricted_types
            .insert(strip_array_suffix(&ty.into()).to_string());
        self
    }

    pub fn restrict_method(mut self, method: impl Into<String>) -> Self {
        self.tier.restricted_methods.insert(method.into());
        self
    }

    pub fn whitelist_namespace(mut self, ns: impl Into<String>) -> Self {
        self.tier.whitelisted_namespaces.insert(ns.into());
        self
    }

    pub fn whitelist_type(mut self, ty: impl Into<String>) -> Self {
        self.tier
            .whitelisted_types
            .insert(strip_array_suffix(&ty.into()).to_string());
        self
    }

    pub fn build(self) -> PermissionTier {
        self.tier
    }
}

/// Literal prefix match: `Foo` contains `Foo.Bar` and also `FooBar`.
///
/// Not segment-aware. Kept as-is so existing policies keep their meaning.
pub fn namespace_contains(outer: &str, inner: &str) -> bool {
    inner.starts_with(outer)
}

/// Drop trailing array decorations: `T[]`, `T[,]`, `T[][]` all become `T`.
pub fn strip_array_suffix(name: &str) -> &str {
    let mut current = name.trim_end();
    while current.ends_with(']') {
        match current.rfind('[') {
            Some(open) if current[open + 1..current.len() - 1].chars().all(|c| c == ',') => {
                current = &current[..open];
            }
            _ => break,
        }
    }
    current
}

/// An ordered set of tiers, least restrictive first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    #[serde(rename = "tier")]
    tiers: Vec<PermissionTier>,
}

impl PermissionPolicy {
    pub fn new(mut tiers: Vec<PermissionTier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(Error::InvalidPolicy(
                "a policy must define at least one tier".to_string(),
            ));
        }

        tiers.sort_by_key(|t| t.rank);
        for pair in tiers.windows(2) {
            if pair[0].rank == pair[1].rank {
                return Err(Error::InvalidPolicy(format!(
                    "duplicate tier rank {}",
                    pair[0].rank
                )));
            }
        }

        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[PermissionTier] {
        &self.tiers
    }

    pub fn tier(&self, rank: u8) -> Result<&PermissionTier> {
        self.tiers
            .iter()
            .find(|t| t.rank == rank)
            .ok_or(Error::TierNotFound(rank))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let parsed: PermissionPolicy = toml::from_str(contents)
            .map_err(|e| Error::InvalidPolicy(format!("invalid policy TOML: {e}")))?;
        Self::new(parsed.tiers)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// The built-in four tier policy.
    ///
    /// Tier 1 only protects the framework itself; tier 4 confines plugins to
    /// core value types, collections, text and math.
    pub fn reference() -> Self {
        const DYNAMIC_LOAD: [&str; 5] = [
            "System.Reflection.Assembly::Load",
            "System.Reflection.Assembly::LoadFrom",
            "System.Reflection.Assembly::LoadFile",
            "System.Reflection.Assembly::UnsafeLoadFrom",
            "System.AppDomain::Load",
        ];

        let framework = PermissionTier::builder(1, "Trusted")
            .restrict_namespace("Patchwork")
            .restrict_namespace("HarmonyLib")
            .build();

        let mut system = PermissionTier::builder(2, "System")
            .restrict_namespace("Patchwork")
            .restrict_namespace("HarmonyLib")
            .restrict_namespace("System.Runtime.InteropServices")
            .restrict_namespace("System.Reflection.Emit")
            .restrict_type("System.Diagnostics.Process")
            .restrict_type("System.Diagnostics.ProcessStartInfo");
        for method in DYNAMIC_LOAD {
            system = system.restrict_method(method);
        }

        let mut sandboxed = PermissionTier::builder(3, "Sandboxed")
            .restrict_namespace("Patchwork")
            .restrict_namespace("HarmonyLib")
            .restrict_namespace("System.Runtime.InteropServices")
            .restrict_namespace("System.Reflection")
            .restrict_namespace("System.Diagnostics")
            .restrict_namespace("System.IO")
            .restrict_namespace("System.Net")
            .restrict_namespace("Microsoft.Win32")
            .whitelist_type("System.Reflection.BindingFlags")
            .whitelist_type("System.IO.Path")
            .whitelist_type("System.IO.MemoryStream")
            .whitelist_namespace("System.Diagnostics.CodeAnalysis")
            .whitelist_namespace("System.Diagnostics.Debug");
        for method in DYNAMIC_LOAD {
            sandboxed = sandboxed.restrict_method(method);
        }

        let mut minimal = PermissionTier::builder(4, "Minimal")
            .restrict_namespace("Patchwork")
            .restrict_namespace("HarmonyLib")
            .restrict_namespace("System.Runtime")
            .restrict_namespace("System.Reflection")
            .restrict_namespace("System.Diagnostics")
            .restrict_namespace("System.IO")
            .restrict_namespace("System.Net")
            .restrict_namespace("System.Threading")
            .restrict_namespace("System.Security")
            .restrict_namespace("Microsoft")
            .restrict_type("System.Environment")
            .restrict_type("System.AppDomain")
            .restrict_type("System.Activator")
            .restrict_type("System.Type")
            .whitelist_namespace("System.Runtime.CompilerServices")
            .whitelist_type("System.Diagnostics.DebuggableAttribute");
        for method in DYNAMIC_LOAD {
            minimal = minimal.restrict_method(method);
        }

        Self {
            tiers: vec![framework, system.build(), sandboxed.build(), minimal.build()],
        }
    }
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
