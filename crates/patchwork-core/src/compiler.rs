//! On-demand plugin compilation
//!
//! The service turns plugin source files into [`CompiledArtifact`]s through a
//! pluggable [`Toolchain`]. Toolchains only accept on-disk references, so
//! in-memory reference binaries are staged into a temporary directory first.

use crate::artifact::CompiledArtifact;
use crate::config::CompilerConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Leading bytes of a PE image
const PE_MAGIC: &[u8] = b"MZ";
/// Metadata root signature of a portable PDB
const PORTABLE_PDB_MAGIC: &[u8] = b"BSJB";

/// A single compiler diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub code: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            file: None,
            line: None,
            column: None,
            code: None,
            message: message.into(),
        }
    }

    /// Parse `file(line,col): error CODE: message`.
    ///
    /// Returns `None` for lines that are not errors (warnings, banners).
    pub fn parse_error_line(line: &str) -> Option<Self> {
        let (head, rest) = line.split_once(": error ")?;
        let (code, message) = match rest.split_once(": ") {
            Some((code, message)) if !code.contains(' ') => (Some(code.to_string()), message),
            _ => (None, rest),
        };

        let (file, line_no, column) = match head.rfind('(') {
            Some(open) if head.ends_with(')') => {
                let mut coords = head[open + 1..head.len() - 1].split(',');
                let line_no = coords.next().and_then(|s| s.trim().parse().ok());
                let column = coords.next().and_then(|s| s.trim().parse().ok());
                (Some(head[..open].trim().to_string()), line_no, column)
            }
            _ => (Some(head.trim().to_string()).filter(|s| !s.is_empty()), None, None),
        };

        Some(Self {
            file,
            line: line_no,
            column,
            code,
            message: message.trim().to_string(),
        })
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{file}")?;
            if let (Some(line), Some(col)) = (self.line, self.column) {
                write!(f, "({line},{col})")?;
            }
            write!(f, ": ")?;
        }
        if let Some(code) = &self.code {
            write!(f, "{code}: ")?;
        }
        write!(f, "{}", self.message)
    }
}

/// Whether sources are compiled together or one artifact per file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileMode {
    #[default]
    Combined,
    PerSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub mode: CompileMode,
    /// Keep the debug symbol stream; required for source locations in reports
    pub emit_debug_symbols: bool,
}

impl CompileOptions {
    pub fn for_analysis() -> Self {
        Self {
            mode: CompileMode::Combined,
            emit_debug_symbols: true,
        }
    }

    pub fn for_loading() -> Self {
        Self {
            mode: CompileMode::Combined,
            emit_debug_symbols: false,
        }
    }
}

/// A reference binary held in memory, such as an embedded host dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryReference {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSet {
    pub paths: Vec<PathBuf>,
    pub blobs: Vec<InMemoryReference>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    pub fn with_blob(mut self, file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.blobs.push(InMemoryReference {
            file_name: file_name.into(),
            bytes,
        });
        self
    }

    /// Digest over blob names and contents; identifies a staging directory
    pub fn blob_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for blob in &self.blobs {
            hasher.update(blob.file_name.as_bytes());
            hasher.update((blob.bytes.len() as u64).to_le_bytes());
            hasher.update(&blob.bytes);
        }
        hex::encode(hasher.finalize())
    }
}

/// One call into a toolchain: compile `sources` into `output`
#[derive(Debug, Clone)]
pub struct ToolchainInvocation {
    pub assembly_name: String,
    pub sources: Vec<PathBuf>,
    pub references: Vec<PathBuf>,
    pub output: PathBuf,
    pub symbols_output: Option<PathBuf>,
}

/// Outcome of a toolchain call. Errors are data, not `Err`.
#[derive(Debug, Clone, Default)]
pub struct ToolchainOutput {
    pub success: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// The compiler backend
pub trait Toolchain: Send + Sync {
    fn name(&self) -> &str;

    fn compile(&self, invocation: &ToolchainInvocation) -> Result<ToolchainOutput>;
}

/// Runs an external compiler front-end.
///
/// Arguments are passed as `<extra args> -out:<file> [-pdb:<file>] -r:<ref>... <sources>`.
/// The front-end takes csc-style arguments but must write a Patchwork module
/// stream (`PWMOD`) to `-out:` and a symbol stream (`PWSYM`) to `-pdb:`.
/// A raw PE image or portable PDB, as `csc` itself emits, is rejected with
/// [`Error::ForeignModule`].
#[derive(Debug, Clone)]
pub struct ExternalToolchain {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl ExternalToolchain {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(config: &CompilerConfig) -> Self {
        Self {
            program: config.program.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    fn command(&self, invocation: &ToolchainInvocation) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args);
        cmd.arg(format!("-out:{}", invocation.output.display()));
        if let Some(symbols) = &invocation.symbols_output {
            cmd.arg(format!("-pdb:{}", symbols.display()));
        }
        for reference in &invocation.references {
            cmd.arg(format!("-r:{}", reference.display()));
        }
        cmd.args(&invocation.sources);
        cmd
    }
}

impl Toolchain for ExternalToolchain {
    fn name(&self) -> &str {
        "external"
    }

    fn compile(&self, invocation: &ToolchainInvocation) -> Result<ToolchainOutput> {
        let output = self
            .command(invocation)
            .output()
            .map_err(|e| Error::ToolchainUnavailable(format!("{}: {e}", self.program.display())))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut diagnostics: Vec<Diagnostic> = stdout
            .lines()
            .chain(stderr.lines())
            .filter_map(Diagnostic::parse_error_line)
            .collect();

        if !output.status.success() && diagnostics.is_empty() {
            let detail = stderr.trim();
            diagnostics.push(Diagnostic::message(if detail.is_empty() {
                format!("compiler exited with {}", output.status)
            } else {
                detail.to_string()
            }));
        }

        Ok(ToolchainOutput {
            success: output.status.success(),
            diagnostics,
        })
    }
}

struct StagedReferences {
    digest: String,
    dir: TempDir,
    paths: Vec<PathBuf>,
}

impl StagedReferences {
    fn stage(references: &ReferenceSet) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("patchwork-refs-")
            .tempdir()
            .map_err(|e| Error::StagingFailed(e.to_string()))?;

        let mut paths = Vec::with_capacity(references.blobs.len());
        for blob in &references.blobs {
            let file_name = Path::new(&blob.file_name).file_name().ok_or_else(|| {
                Error::StagingFailed(format!("invalid file name {:?}", blob.file_name))
            })?;
            let path = dir.path().join(file_name);
            if path.exists() {
                return Err(Error::StagingFailed(format!(
                    "duplicate in-memory reference {:?}",
                    blob.file_name
                )));
            }
            fs::write(&path, &blob.bytes).map_err(|e| Error::StagingFailed(e.to_string()))?;
            paths.push(path);
        }

        debug!(dir = %dir.path().display(), count = paths.len(), "Staged in-memory references");
        Ok(Self {
            digest: references.blob_digest(),
            dir,
            paths,
        })
    }
}

/// Compiles plugin sources into analyzable artifacts
pub struct CompilationService {
    toolchain: Box<dyn Toolchain>,
    reuse_staged_references: bool,
    staged: Option<StagedReferences>,
}

impl CompilationService {
    pub fn new(toolchain: Box<dyn Toolchain>) -> Self {
        Self {
            toolchain,
            reuse_staged_references: false,
            staged: None,
        }
    }

    /// Keep staged in-memory references between calls while the blob set is
    /// unchanged. Staged files are removed by [`Self::cleanup`] or on drop.
    pub fn with_reference_reuse(mut self, reuse: bool) -> Self {
        self.reuse_staged_references = reuse;
        self
    }

    pub fn staged_reference_dir(&self) -> Option<&Path> {
        self.staged.as_ref().map(|s| s.dir.path())
    }

    /// Remove any staged reference files
    pub fn cleanup(&mut self) {
        if let Some(staged) = self.staged.take() {
            let path = staged.dir.path().to_path_buf();
            if let Err(e) = staged.dir.close() {
                warn!(error = %e, dir = %path.display(), "Failed to remove staged references");
            }
        }
    }

    /// Compile `sources` against `references`.
    ///
    /// In [`CompileMode::Combined`] exactly one artifact is returned; in
    /// [`CompileMode::PerSource`] one per source, in input order. Any failing
    /// unit fails the whole call with every collected diagnostic.
    pub fn compile(
        &mut self,
        sources: &[PathBuf],
        references: &ReferenceSet,
        options: CompileOptions,
    ) -> Result<Vec<CompiledArtifact>> {
        if sources.is_empty() {
            return Err(Error::InvalidInput("no source files to compile".to_string()));
        }

        let reference_paths = self.reference_paths(references)?;
        let result = self.compile_units(sources, &reference_paths, options);

        if !self.reuse_staged_references {
            self.cleanup();
        }
        result
    }

    fn reference_paths(&mut self, references: &ReferenceSet) -> Result<Vec<PathBuf>> {
        let mut paths = references.paths.clone();
        if references.blobs.is_empty() {
            return Ok(paths);
        }

        let digest = references.blob_digest();
        let reusable = self
            .staged
            .as_ref()
            .is_some_and(|s| s.digest == digest && s.dir.path().exists());
        if !reusable {
            self.cleanup();
            self.staged = Some(StagedReferences::stage(references)?);
        } else {
            debug!(digest = %digest, "Reusing staged references");
        }

        if let Some(staged) = &self.staged {
            paths.extend(staged.paths.iter().cloned());
        }
        Ok(paths)
    }

    fn compile_units(
        &self,
        sources: &[PathBuf],
        references: &[PathBuf],
        options: CompileOptions,
    ) -> Result<Vec<CompiledArtifact>> {
        let out_dir = tempfile::Builder::new()
            .prefix("patchwork-out-")
            .tempdir()
            .map_err(Error::Io)?;

        let units: Vec<Vec<PathBuf>> = match options.mode {
            CompileMode::Combined => vec![sources.to_vec()],
            CompileMode::PerSource => sources.iter().map(|s| vec![s.clone()]).collect(),
        };

        let mut artifacts = Vec::with_capacity(units.len());
        let mut diagnostics = Vec::new();
        let mut taken = HashSet::new();

        for unit in units {
            let assembly_name = unique_name(unit_name(&unit), &mut taken);
            let output = out_dir.path().join(format!("{assembly_name}.pwmod"));
            let symbols_output = options
                .emit_debug_symbols
                .then(|| out_dir.path().join(format!("{assembly_name}.pwsym")));

            let invocation = ToolchainInvocation {
                assembly_name: assembly_name.clone(),
                sources: unit,
                references: references.to_vec(),
                output: output.clone(),
                symbols_output: symbols_output.clone(),
            };

            let result = self.toolchain.compile(&invocation)?;
            if !result.success {
                warn!(
                    assembly = %assembly_name,
                    errors = result.diagnostics.len(),
                    "Compilation failed"
                );
                diagnostics.extend(result.diagnostics);
                continue;
            }

            let module = fs::read(&output).map_err(|e| {
                Error::MalformedArtifact(format!(
                    "toolchain produced no module for {assembly_name}: {e}"
                ))
            })?;
            if module.starts_with(PE_MAGIC) {
                return Err(Error::ForeignModule(format!(
                    "{assembly_name} was written as a PE image"
                )));
            }
            let symbols = match &symbols_output {
                Some(path) if path.is_file() => {
                    let bytes = fs::read(path)?;
                    if bytes.starts_with(PORTABLE_PDB_MAGIC) {
                        return Err(Error::ForeignModule(format!(
                            "symbols for {assembly_name} were written as a portable PDB"
                        )));
                    }
                    Some(bytes)
                }
                _ => None,
            };

            let artifact = CompiledArtifact::from_bytes(assembly_name.clone(), module, symbols)?;
            info!(
                assembly = %assembly_name,
                toolchain = self.toolchain.name(),
                symbols = artifact.has_symbols(),
                "Plugin compiled"
            );
            artifacts.push(artifact);
        }

        if !diagnostics.is_empty() {
            return Err(Error::CompileFailed(diagnostics));
        }
        Ok(artifacts)
    }
}

impl Drop for CompilationService {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Suffix `-2`, `-3`, ... onto names already used in this call
fn unique_name(base: String, taken: &mut HashSet<String>) -> String {
    let mut name = base.clone();
    let mut n = 1;
    while !taken.insert(name.clone()) {
        n += 1;
        name = format!("{base}-{n}");
    }
    name
}

fn unit_name(unit: &[PathBuf]) -> String {
    let stem = unit
        .first()
        .and_then(|p| p.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plugin".to_string());
    if unit.len() > 1 {
        format!("{stem}+{}", unit.len() - 1)
    } else {
        stem
    }
}

#[cfg(test)]
#[path = "compiler_tests.rs"]
mod tests;
