//! Bytecode compliance analysis
//!
//! Walks every type, annotation, local and instruction operand of an artifact
//! and tests the fully-qualified symbols it references against one tier.
//! Because the compiled image always carries resolved symbol identities,
//! aliasing or renaming in the plugin source cannot hide a reference.

use crate::artifact::{
    Annotation, AssemblyImage, CompiledArtifact, DebugSymbols, Instruction, MethodDef, Operand,
    TypeDef, TypeRef,
};
use crate::error::Result;
use crate::policy::PermissionTier;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

/// Why a symbol was flagged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    RestrictedType,
    RestrictedMethod,
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestrictedType => write!(f, "references a restricted type or namespace"),
            Self::RestrictedMethod => write!(f, "invokes a restricted method"),
        }
    }
}

/// One failed policy test
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub location: String,
    pub offending_name: String,
    pub reason: ViolationReason,
    pub is_generic_argument: bool,
}

impl fmt::Display for ViolationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", self.location, self.offending_name, self.reason)?;
        if self.is_generic_argument {
            write!(f, " (as generic argument)")?;
        }
        Ok(())
    }
}

/// Result of testing one artifact against one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTestResult {
    pub tier: u8,
    pub tested: bool,
    pub passed: bool,
    pub violations: Vec<ViolationRecord>,
}

impl TierTestResult {
    /// A tier that was never analyzed; never counts as passed
    pub fn untested(tier: u8) -> Self {
        Self {
            tier,
            tested: false,
            passed: false,
            violations: Vec::new(),
        }
    }

    pub fn violation_set(&self) -> HashSet<&ViolationRecord> {
        self.violations.iter().collect()
    }
}

/// Decode an artifact and analyze it against a tier
pub fn analyze(artifact: &CompiledArtifact, tier: &PermissionTier) -> Result<TierTestResult> {
    let image = artifact.image()?;
    let symbols = artifact.debug_symbols()?;
    Ok(analyze_image(&image, symbols.as_ref(), tier))
}

/// Analyze an already decoded image
pub fn analyze_image(
    image: &AssemblyImage,
    symbols: Option<&DebugSymbols>,
    tier: &PermissionTier,
) -> TierTestResult {
    let mut scan = Scan {
        tier,
        symbols,
        violations: Vec::new(),
    };

    for ty in image.types() {
        scan.type_def(ty);
    }

    debug!(
        assembly = %image.name,
        tier = tier.rank(),
        violations = scan.violations.len(),
        "Compliance analysis complete"
    );

    TierTestResult {
        tier: tier.rank(),
        tested: true,
        passed: scan.violations.is_empty(),
        violations: scan.violations,
    }
}

struct Scan<'a> {
    tier: &'a PermissionTier,
    symbols: Option<&'a DebugSymbols>,
    violations: Vec<ViolationRecord>,
}

impl Scan<'_> {
    fn type_def(&mut self, ty: &TypeDef) {
        let owner = ty.full_name();
        for annotation in &ty.annotations {
            self.annotation(annotation, &owner);
        }
        for method in &ty.methods {
            self.method(&owner, method);
        }
    }

    fn method(&mut self, owner: &str, method: &MethodDef) {
        let member = format!("{owner}::{}", method.name);
        let span = self.symbols.and_then(|s| s.method_span(method.token));
        let method_location = match span {
            Some((doc, start, end)) => format!("{member} ({doc}:L{start}-L{end})"),
            None => member.clone(),
        };

        for annotation in &method.annotations {
            self.annotation(annotation, &method_location);
        }

        for local in &method.locals {
            let location = format!("{method_location} local #{}", local.index);
            self.flattened(&local.variable_type, &location);
        }

        for instruction in &method.body {
            let location = self.instruction_location(&member, method.token, instruction);
            self.instruction(instruction, &location);
        }
    }

    fn instruction_location(&self, member: &str, token: u32, instruction: &Instruction) -> String {
        match self.symbols.and_then(|s| s.lookup(token, instruction.offset)) {
            Some(point) => format!(
                "{member} IL_{:04x} ({}:L{}-L{})",
                instruction.offset, point.document, point.start_line, point.end_line
            ),
            None => format!("{member} IL_{:04x}", instruction.offset),
        }
    }

    fn instruction(&mut self, instruction: &Instruction, location: &str) {
        match &instruction.operand {
            Operand::Field(field) => {
                self.flattened(&field.declaring_type, location);
                self.flattened(&field.field_type, location);
            }
            Operand::Method(method) => {
                self.flattened(&method.declaring_type, location);
                for arg in &method.generic_arguments {
                    self.generic_argument(arg, location);
                }
                let plain = method.plain_name();
                if self.tier.is_method_restricted(&plain) {
                    self.push(location, plain, ViolationReason::RestrictedMethod, false);
                }
            }
            Operand::Type(ty) => self.flattened(ty, location),
            Operand::None | Operand::Integer(_) | Operand::String(_) => {}
        }
    }

    fn annotation(&mut self, annotation: &Annotation, location: &str) {
        self.flattened(&annotation.annotation_type, location);
        for arg in &annotation.argument_types {
            self.flattened(arg, location);
        }
    }

    /// Test `root` and every type reachable through its generic arguments
    fn flattened(&mut self, root: &TypeRef, location: &str) {
        for (ty, is_root) in flatten_generics(root) {
            self.type_ref(ty, location, !is_root);
        }
    }

    /// A method generic argument and everything nested inside it
    fn generic_argument(&mut self, arg: &TypeRef, location: &str) {
        for (ty, _) in flatten_generics(arg) {
            self.type_ref(ty, location, true);
        }
    }

    fn type_ref(&mut self, ty: &TypeRef, location: &str, is_generic_argument: bool) {
        let name = ty.full_name();
        if self.tier.classify(&name).is_restricted() {
            self.push(location, name, ViolationReason::RestrictedType, is_generic_argument);
        }
    }

    fn push(
        &mut self,
        location: &str,
        offending_name: String,
        reason: ViolationReason,
        is_generic_argument: bool,
    ) {
        self.violations.push(ViolationRecord {
            location: location.to_string(),
            offending_name,
            reason,
            is_generic_argument,
        });
    }
}

/// Expand a type through its generic arguments, depth first.
///
/// Each distinct type is yielded once; the flag marks the root.
pub fn flatten_generics(root: &TypeRef) -> Vec<(&TypeRef, bool)> {
    let mut seen: HashSet<&TypeRef> = HashSet::new();
    let mut out = Vec::new();
    let mut stack = vec![(root, true)];

    while let Some((ty, is_root)) = stack.pop() {
        if !seen.insert(ty) {
            continue;
        }
        out.push((ty, is_root));
        for arg in ty.generic_arguments.iter().rev() {
            stack.push((arg, false));
        }
    }

    out
}

#[cfg(test)]
#[path = "analyzer_tests.rs"]
mod tests;
