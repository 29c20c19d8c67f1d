//! Compiler module tests

use super::*;
use crate::artifact::{AssemblyImage, DebugSymbols, ModuleDef};
use std::sync::{Arc, Mutex};

/// Writes an empty module for every invocation; fails units whose first
/// source is named `broken.cs`.
#[derive(Clone, Default)]
struct FakeToolchain {
    calls: Arc<Mutex<Vec<ToolchainInvocation>>>,
}

impl Toolchain for FakeToolchain {
    fn name(&self) -> &str {
        "fake"
    }

    fn compile(&self, invocation: &ToolchainInvocation) -> Result<ToolchainOutput> {
        self.calls.lock().expect("lock").push(invocation.clone());

        // Every reference must exist on disk while the toolchain runs
        for reference in &invocation.references {
            assert!(reference.is_file(), "missing reference {}", reference.display());
        }

        if invocation.sources.iter().any(|s| s.ends_with("broken.cs")) {
            return Ok(ToolchainOutput {
                success: false,
                diagnostics: vec![Diagnostic::message("syntax error")],
            });
        }

        let image = AssemblyImage {
            name: invocation.assembly_name.clone(),
            modules: vec![ModuleDef {
                name: format!("{}.dll", invocation.assembly_name),
                types: Vec::new(),
            }],
        };
        let artifact = CompiledArtifact::from_image(&image, Some(&DebugSymbols::default()))?;
        fs::write(&invocation.output, artifact.module_bytes())?;
        if let (Some(path), Some(bytes)) = (&invocation.symbols_output, artifact.symbol_bytes()) {
            fs::write(path, bytes)?;
        }

        Ok(ToolchainOutput {
            success: true,
            diagnostics: Vec::new(),
        })
    }
}

fn sources(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(PathBuf::from).collect()
}

#[test]
fn test_combined_mode_produces_one_artifact() {
    let toolchain = FakeToolchain::default();
    let mut service = CompilationService::new(Box::new(toolchain.clone()));

    let artifacts = service
        .compile(&sources(&["a.cs", "b.cs"]), &ReferenceSet::new(), CompileOptions::for_analysis())
        .expect("compile");

    assert_eq!(artifacts.len(), 1);
    assert!(artifacts[0].has_symbols());
    let calls = toolchain.calls.lock().expect("lock");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].sources.len(), 2);
}

#[test]
fn test_per_source_mode_produces_one_artifact_each() {
    let mut service = CompilationService::new(Box::new(FakeToolchain::default()));
    let options = CompileOptions {
        mode: CompileMode::PerSource,
        emit_debug_symbols: false,
    };

    let artifacts = service
        .compile(&sources(&["a.cs", "b.cs", "c.cs"]), &ReferenceSet::new(), options)
        .expect("compile");

    let names: Vec<&str> = artifacts.iter().map(|a| a.name()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert!(artifacts.iter().all(|a| !a.has_symbols()));
}

#[test]
fn test_compile_failure_reports_diagnostics() {
    let mut service = CompilationService::new(Box::new(FakeToolchain::default()));
    let err = service
        .compile(&sources(&["broken.cs"]), &ReferenceSet::new(), CompileOptions::for_analysis())
        .unwrap_err();

    match err {
        Error::CompileFailed(diagnostics) => {
            assert_eq!(diagnostics.len(), 1);
            assert_eq!(diagnostics[0].message, "syntax error");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_empty_source_list_is_rejected() {
    let mut service = CompilationService::new(Box::new(FakeToolchain::default()));
    let err = service
        .compile(&[], &ReferenceSet::new(), CompileOptions::for_loading())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[test]
fn test_in_memory_references_are_staged_and_cleaned_up() {
    let toolchain = FakeToolchain::default();
    let mut service = CompilationService::new(Box::new(toolchain.clone()));
    let refs = ReferenceSet::new().with_blob("Host.dll", vec![1, 2, 3]);

    service
        .compile(&sources(&["a.cs"]), &refs, CompileOptions::for_loading())
        .expect("compile");

    let staged = toolchain.calls.lock().expect("lock")[0].references[0].clone();
    assert!(staged.ends_with("Host.dll"));
    assert!(!staged.exists(), "staged reference should be removed");
    assert!(service.staged_reference_dir().is_none());
}

#[test]
fn test_reference_reuse_keeps_staging_between_calls() {
    let toolchain = FakeToolchain::default();
    let mut service =
        CompilationService::new(Box::new(toolchain.clone())).with_reference_reuse(true);
    let refs = ReferenceSet::new().with_blob("Host.dll", vec![9; 16]);

    for _ in 0..2 {
        service
            .compile(&sources(&["a.cs"]), &refs, CompileOptions::for_loading())
            .expect("compile");
    }

    let calls = toolchain.calls.lock().expect("lock");
    assert_eq!(calls[0].references, calls[1].references);
    assert!(calls[0].references[0].exists());

    let dir = service.staged_reference_dir().expect("staged").to_path_buf();
    drop(calls);
    service.cleanup();
    assert!(!dir.exists());
}

#[test]
fn test_changed_blobs_are_restaged() {
    let toolchain = FakeToolchain::default();
    let mut service =
        CompilationService::new(Box::new(toolchain.clone())).with_reference_reuse(true);

    service
        .compile(
            &sources(&["a.cs"]),
            &ReferenceSet::new().with_blob("One.dll", vec![1]),
            CompileOptions::for_loading(),
        )
        .expect("compile");
    service
        .compile(
            &sources(&["a.cs"]),
            &ReferenceSet::new().with_blob("Two.dll", vec![2]),
            CompileOptions::for_loading(),
        )
        .expect("compile");

    let calls = toolchain.calls.lock().expect("lock");
    assert!(!calls[0].references[0].exists());
    assert!(calls[1].references[0].ends_with("Two.dll"));
}

#[test]
fn test_blob_digest_is_content_sensitive() {
    let a = ReferenceSet::new().with_blob("A.dll", vec![1]);
    let b = ReferenceSet::new().with_blob("A.dll", vec![2]);
    assert_ne!(a.blob_digest(), b.blob_digest());
    assert_eq!(a.blob_digest(), a.clone().blob_digest());
}

/// Behaves like raw `csc`: a PE image and a portable PDB. With
/// `symbols_only`, the module is a proper stream and only the PDB is foreign.
struct CscLikeToolchain {
    symbols_only: bool,
}

impl Toolchain for CscLikeToolchain {
    fn name(&self) -> &str {
        "csc-like"
    }

    fn compile(&self, invocation: &ToolchainInvocation) -> Result<ToolchainOutput> {
        if self.symbols_only {
            let image = AssemblyImage {
                name: invocation.assembly_name.clone(),
                modules: Vec::new(),
            };
            let artifact = CompiledArtifact::from_image(&image, None)?;
            fs::write(&invocation.output, artifact.module_bytes())?;
        } else {
            fs::write(&invocation.output, b"MZ\x90\x00\x03\x00\x00\x00")?;
        }
        if let Some(path) = &invocation.symbols_output {
            fs::write(path, b"BSJB\x01\x00\x01\x00")?;
        }
        Ok(ToolchainOutput {
            success: true,
            diagnostics: Vec::new(),
        })
    }
}

#[test]
fn test_pe_image_output_is_rejected() {
    let mut service =
        CompilationService::new(Box::new(CscLikeToolchain { symbols_only: false }));
    let err = service
        .compile(&sources(&["a.cs"]), &ReferenceSet::new(), CompileOptions::for_analysis())
        .unwrap_err();

    assert!(matches!(err, Error::ForeignModule(ref m) if m.contains("PE image")));
    assert_eq!(err.code(), "E103");
    assert!(err.suggestion().is_some_and(|s| s.contains("patchwork-csc")));
}

#[test]
fn test_portable_pdb_output_is_rejected() {
    let mut service = CompilationService::new(Box::new(CscLikeToolchain { symbols_only: true }));
    let err = service
        .compile(&sources(&["a.cs"]), &ReferenceSet::new(), CompileOptions::for_analysis())
        .unwrap_err();
    assert!(matches!(err, Error::ForeignModule(ref m) if m.contains("portable PDB")));

    // Without symbols requested the module stream alone is accepted
    let artifacts = service
        .compile(&sources(&["a.cs"]), &ReferenceSet::new(), CompileOptions::for_loading())
        .expect("compile");
    assert_eq!(artifacts.len(), 1);
}

#[test]
fn test_duplicate_blob_names_are_rejected() {
    let toolchain = FakeToolchain::default();
    let mut service = CompilationService::new(Box::new(toolchain.clone()));
    let refs = ReferenceSet::new()
        .with_blob("Host.dll", vec![1])
        .with_blob("nested/Host.dll", vec![2]);

    let err = service
        .compile(&sources(&["a.cs"]), &refs, CompileOptions::for_loading())
        .unwrap_err();
    assert!(matches!(err, Error::StagingFailed(ref m) if m.contains("duplicate")));
    assert!(toolchain.calls.lock().expect("lock").is_empty());
}

#[test]
fn test_per_source_names_are_unique() {
    let toolchain = FakeToolchain::default();
    let mut service = CompilationService::new(Box::new(toolchain.clone()));
    let options = CompileOptions {
        mode: CompileMode::PerSource,
        emit_debug_symbols: false,
    };

    let artifacts = service
        .compile(
            &sources(&["zoom/plugin.cs", "camera/plugin.cs", "other/plugin.cs"]),
            &ReferenceSet::new(),
            options,
        )
        .expect("compile");

    let names: Vec<&str> = artifacts.iter().map(|a| a.name()).collect();
    assert_eq!(names, vec!["plugin", "plugin-2", "plugin-3"]);
    let calls = toolchain.calls.lock().expect("lock");
    assert_ne!(calls[0].output, calls[1].output);
}

#[test]
fn test_parse_error_line() {
    let d = Diagnostic::parse_error_line("Plugin.cs(12,5): error CS0103: The name 'x' does not exist")
        .expect("error line");
    assert_eq!(d.file.as_deref(), Some("Plugin.cs"));
    assert_eq!(d.line, Some(12));
    assert_eq!(d.column, Some(5));
    assert_eq!(d.code.as_deref(), Some("CS0103"));
    assert_eq!(d.message, "The name 'x' does not exist");
    assert_eq!(d.to_string(), "Plugin.cs(12,5): CS0103: The name 'x' does not exist");
}

#[test]
fn test_parse_error_line_ignores_warnings() {
    assert!(Diagnostic::parse_error_line("Plugin.cs(1,1): warning CS0168: unused").is_none());
    assert!(Diagnostic::parse_error_line("Compiler version 4.0").is_none());
}

#[test]
fn test_external_toolchain_missing_program() {
    let toolchain = ExternalToolchain::new("/nonexistent/patchwork-compiler");
    let invocation = ToolchainInvocation {
        assembly_name: "a".to_string(),
        sources: sources(&["a.cs"]),
        references: Vec::new(),
        output: PathBuf::from("a.pwmod"),
        symbols_output: None,
    };
    let err = toolchain.compile(&invocation).unwrap_err();
    assert!(matches!(err, Error::ToolchainUnavailable(_)));
}
