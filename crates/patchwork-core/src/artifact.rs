//! Compiled plugin artifacts
//!
//! An artifact is a loadable module image plus an optional debug symbol
//! stream. Both streams share a small fixed header:
//!
//! ```text
//! magic (5 bytes) | format version (u16 LE) | body length (u32 LE) | JSON body
//! ```
//!
//! The body of a module stream is an [`AssemblyImage`]; the body of a symbol
//! stream is a [`DebugSymbols`] table keyed by method token.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

pub const MODULE_MAGIC: &[u8; 5] = b"PWMOD";
pub const SYMBOLS_MAGIC: &[u8; 5] = b"PWSYM";
pub const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 5 + 2 + 4;
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Reference to a type, possibly closed over generic arguments
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeRef {
    pub namespace: String,
    /// Simple name; may carry array decorations such as `Int32[]`
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generic_arguments: Vec<TypeRef>,
}

impl TypeRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            generic_arguments: Vec::new(),
        }
    }

    /// Parse `Ns.Sub.Type` into namespace and name at the last dot
    pub fn parse(full_name: &str) -> Self {
        match full_name.rsplit_once('.') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::new("", full_name),
        }
    }

    pub fn with_generic_arguments(mut self, args: Vec<TypeRef>) -> Self {
        self.generic_arguments = args;
        self
    }

    pub fn array_of(element: &TypeRef) -> Self {
        Self {
            namespace: element.namespace.clone(),
            name: format!("{}[]", element.name),
            generic_arguments: element.generic_arguments.clone(),
        }
    }

    /// Fully-qualified name without generic arguments
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())?;
        if !self.generic_arguments.is_empty() {
            write!(f, "<")?;
            for (i, arg) in self.generic_arguments.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{arg}")?;
            }
            write!(f, ">")?;
        }
        Ok(())
    }
}

/// Applied metadata annotation (custom attribute)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub annotation_type: TypeRef,
    /// Types of the constructor arguments, in declaration order
    #[serde(default)]
    pub argument_types: Vec<TypeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub declaring_type: TypeRef,
    pub name: String,
    pub field_type: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRef {
    pub declaring_type: TypeRef,
    pub name: String,
    pub return_type: TypeRef,
    #[serde(default)]
    pub parameters: Vec<TypeRef>,
    /// Non-empty only for generic method instances
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generic_arguments: Vec<TypeRef>,
}

impl MethodRef {
    /// Decorated signature: `Ret Ns.Type::Name(Arg1,Arg2)`
    pub fn full_name(&self) -> String {
        let params: Vec<String> = self.parameters.iter().map(|p| p.to_string()).collect();
        format!(
            "{} {}::{}({})",
            self.return_type,
            self.declaring_type.full_name(),
            self.name,
            params.join(",")
        )
    }

    /// `Ns.Type::Name`, with return type and parameter list stripped
    pub fn plain_name(&self) -> String {
        plain_method_name(&self.full_name()).to_string()
    }
}

/// Strip the return type prefix and parameter list from a decorated signature
pub fn plain_method_name(signature: &str) -> &str {
    let without_params = match signature.find('(') {
        Some(idx) => &signature[..idx],
        None => signature,
    };
    // Return types never contain "::", so the owner starts after the last
    // space preceding the member separator.
    let owner_start = match without_params.find("::") {
        Some(sep) => without_params[..sep].rfind(' ').map(|i| i + 1).unwrap_or(0),
        None => without_params.rfind(' ').map(|i| i + 1).unwrap_or(0),
    };
    without_params[owner_start..].trim()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Operand {
    None,
    Integer(i64),
    String(String),
    Field(FieldRef),
    Method(MethodRef),
    Type(TypeRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub offset: u32,
    pub opcode: String,
    #[serde(default = "operand_none")]
    pub operand: Operand,
}

fn operand_none() -> Operand {
    Operand::None
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVariable {
    pub index: u16,
    pub variable_type: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    /// Metadata token, used to look up debug symbols
    pub token: u32,
    pub name: String,
    pub return_type: TypeRef,
    #[serde(default)]
    pub parameters: Vec<TypeRef>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub locals: Vec<LocalVariable>,
    #[serde(default)]
    pub body: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub base_type: Option<TypeRef>,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub is_interface: bool,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
}

impl TypeDef {
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    pub fn is_concrete(&self) -> bool {
        !self.is_abstract && !self.is_interface
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDef {
    pub name: String,
    #[serde(default)]
    pub types: Vec<TypeDef>,
}

/// Decoded module stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyImage {
    pub name: String,
    #[serde(default)]
    pub modules: Vec<ModuleDef>,
}

impl AssemblyImage {
    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.modules.iter().flat_map(|m| m.types.iter())
    }

    pub fn find_type(&self, full_name: &str) -> Option<&TypeDef> {
        self.types().find(|t| t.full_name() == full_name)
    }
}

/// Maps a range of IL offsets back to source lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePoint {
    pub offset: u32,
    pub document: String,
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugSymbols {
    /// Sequence points per method token, sorted by offset
    pub methods: BTreeMap<u32, Vec<SequencePoint>>,
}

impl DebugSymbols {
    /// The sequence point covering `offset` within method `token`
    pub fn lookup(&self, token: u32, offset: u32) -> Option<&SequencePoint> {
        let points = self.methods.get(&token)?;
        points
            .iter()
            .take_while(|p| p.offset <= offset)
            .last()
            .or_else(|| points.first())
    }

    /// Document and line span covered by a whole method
    pub fn method_span(&self, token: u32) -> Option<(&str, u32, u32)> {
        let points = self.methods.get(&token)?;
        let first = points.first()?;
        let start = points.iter().map(|p| p.start_line).min()?;
        let end = points.iter().map(|p| p.end_line).max()?;
        Some((first.document.as_str(), start, end))
    }

    fn normalize(&mut self) {
        for points in self.methods.values_mut() {
            points.sort_by_key(|p| p.offset);
        }
    }
}

/// A compiled plugin: raw module bytes plus optional debug symbol bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    name: String,
    module: Vec<u8>,
    symbols: Option<Vec<u8>>,
}

impl CompiledArtifact {
    /// Accept raw module bytes after validating the header
    pub fn from_bytes(
        name: impl Into<String>,
        module: Vec<u8>,
        symbols: Option<Vec<u8>>,
    ) -> Result<Self> {
        read_header(&module, MODULE_MAGIC)?;
        if let Some(sym) = &symbols {
            read_header(sym, SYMBOLS_MAGIC)?;
        }
        Ok(Self {
            name: name.into(),
            module,
            symbols,
        })
    }

    /// Read a module from disk, picking up a sibling `.pwsym` stream if present
    pub fn read(path: &Path) -> Result<Self> {
        let module = fs::read(path)?;
        let symbols_path = path.with_extension("pwsym");
        let symbols = if symbols_path.is_file() {
            Some(fs::read(&symbols_path)?)
        } else {
            None
        };
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_bytes(name, module, symbols)
    }

    pub fn from_image(image: &AssemblyImage, symbols: Option<&DebugSymbols>) -> Result<Self> {
        let module = encode_stream(MODULE_MAGIC, image)?;
        let symbols = symbols
            .map(|s| encode_stream(SYMBOLS_MAGIC, s))
            .transpose()?;
        Ok(Self {
            name: image.name.clone(),
            module,
            symbols,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_bytes(&self) -> &[u8] {
        &self.module
    }

    pub fn symbol_bytes(&self) -> Option<&[u8]> {
        self.symbols.as_deref()
    }

    pub fn has_symbols(&self) -> bool {
        self.symbols.is_some()
    }

    pub fn image(&self) -> Result<AssemblyImage> {
        decode_stream(MODULE_MAGIC, &self.module)
    }

    pub fn debug_symbols(&self) -> Result<Option<DebugSymbols>> {
        self.symbols
            .as_deref()
            .map(|bytes| {
                let mut symbols: DebugSymbols = decode_stream(SYMBOLS_MAGIC, bytes)?;
                symbols.normalize();
                Ok(symbols)
            })
            .transpose()
    }

    /// SHA-256 of the module stream, hex encoded
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.module))
    }
}

/// Validate a stream header and return the declared body length
pub fn read_header(bytes: &[u8], magic: &[u8; 5]) -> Result<usize> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::InvalidHeader(format!(
            "stream is {} bytes, shorter than the {HEADER_LEN} byte header",
            bytes.len()
        )));
    }
    if &bytes[..5] != magic {
        return Err(Error::InvalidHeader(format!(
            "expected magic {:?}",
            String::from_utf8_lossy(magic)
        )));
    }

    let version = u16::from_le_bytes([bytes[5], bytes[6]]);
    if version != FORMAT_VERSION {
        return Err(Error::UnsupportedFormat(version));
    }

    let len = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]) as usize;
    if len > MAX_BODY_BYTES {
        return Err(Error::InvalidHeader(format!(
            "declared body of {len} bytes exceeds limit {MAX_BODY_BYTES}"
        )));
    }
    if bytes.len() - HEADER_LEN != len {
        return Err(Error::InvalidHeader(format!(
            "declared body of {len} bytes but {} present",
            bytes.len() - HEADER_LEN
        )));
    }
    Ok(len)
}

fn encode_stream<T: Serialize>(magic: &[u8; 5], body: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(body)
        .map_err(|e| Error::MalformedArtifact(format!("failed to encode body: {e}")))?;
    let len = u32::try_from(json.len())
        .map_err(|_| Error::MalformedArtifact("body too large".to_string()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + json.len());
    out.extend_from_slice(magic);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

fn decode_stream<T: for<'de> Deserialize<'de>>(magic: &[u8; 5], bytes: &[u8]) -> Result<T> {
    read_header(bytes, magic)?;
    serde_json::from_slice(&bytes[HEADER_LEN..])
        .map_err(|e| Error::MalformedArtifact(format!("failed to decode body: {e}")))
}

#[cfg(test)]
#[path = "artifact_tests.rs"]
mod tests;
