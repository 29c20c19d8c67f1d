//! Capability-gated access to host members
//!
//! Plugins never reach host state directly. Reads and writes go through a
//! [`GuardedAccessor`], which checks the owning type against the run's tier
//! and the protected framework namespaces before touching the store.

use crate::descriptor::ProtectedNamespaces;
use crate::{PluginError, PluginResult};
use patchwork_core::policy::PermissionTier;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Host-side storage of named members
pub trait MemberStore: Send + Sync {
    fn read(&self, type_name: &str, member: &str) -> Option<Value>;

    fn write(&self, type_name: &str, member: &str, value: Value) -> PluginResult<()>;
}

/// In-memory member store keyed by `(type, member)`
#[derive(Debug, Default)]
pub struct MapMemberStore {
    members: RwLock<HashMap<(String, String), Value>>,
}

impl MapMemberStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(self, type_name: &str, member: &str, value: Value) -> Self {
        if let Ok(mut members) = self.members.write() {
            members.insert((type_name.to_string(), member.to_string()), value);
        }
        self
    }
}

impl MemberStore for MapMemberStore {
    fn read(&self, type_name: &str, member: &str) -> Option<Value> {
        self.members
            .read()
            .ok()?
            .get(&(type_name.to_string(), member.to_string()))
            .cloned()
    }

    fn write(&self, type_name: &str, member: &str, value: Value) -> PluginResult<()> {
        let mut members = self
            .members
            .write()
            .map_err(|_| PluginError::NotFound(format!("{type_name}::{member}")))?;
        let slot = members
            .get_mut(&(type_name.to_string(), member.to_string()))
            .ok_or_else(|| PluginError::NotFound(format!("{type_name}::{member}")))?;
        *slot = value;
        Ok(())
    }
}

/// Checked view over a [`MemberStore`]
pub struct GuardedAccessor<'a> {
    tier: &'a PermissionTier,
    protected: &'a ProtectedNamespaces,
    store: &'a dyn MemberStore,
}

impl<'a> GuardedAccessor<'a> {
    pub fn new(
        tier: &'a PermissionTier,
        protected: &'a ProtectedNamespaces,
        store: &'a dyn MemberStore,
    ) -> Self {
        Self {
            tier,
            protected,
            store,
        }
    }

    /// Whether members of `type_name` may be touched at all
    pub fn allows(&self, type_name: &str) -> bool {
        self.protected.matching(type_name).is_none()
            && !self.tier.classify(type_name).is_restricted()
    }

    pub fn get(&self, type_name: &str, member: &str) -> PluginResult<Value> {
        self.check(type_name, member)?;
        self.store
            .read(type_name, member)
            .ok_or_else(|| PluginError::NotFound(format!("{type_name}::{member}")))
    }

    pub fn set(&self, type_name: &str, member: &str, value: Value) -> PluginResult<()> {
        self.check(type_name, member)?;
        self.store.write(type_name, member, value)
    }

    fn check(&self, type_name: &str, member: &str) -> PluginResult<()> {
        if self.allows(type_name) {
            Ok(())
        } else {
            debug!(type_name, member, tier = self.tier.rank(), "Member access denied");
            Err(PluginError::AccessDenied(format!("{type_name}::{member}")))
        }
    }
}
