//! CLI integration tests for patchwork
//!
//! Tests the patchwork CLI commands end-to-end using assert_cmd.

use assert_cmd::Command;
use patchwork_core::artifact::{
    AssemblyImage, CompiledArtifact, Instruction, MethodDef, MethodRef, ModuleDef, Operand,
    TypeDef, TypeRef,
};
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Command isolated from the user's configuration and data
#[allow(deprecated)]
fn patchwork_cmd(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("patchwork").unwrap();
    cmd.env("PATCHWORK_CONFIG_DIR", home.path().join("config"));
    cmd.env("PATCHWORK_DATA_DIR", home.path().join("data"));
    cmd.env_remove("PATCHWORK_PLUGIN_DIR");
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Write a module whose single method calls `owner::name`
fn write_module(dir: &Path, file: &str, owner: &str, name: &str) {
    let image = AssemblyImage {
        name: "Sample".to_string(),
        modules: vec![ModuleDef {
            name: "Sample.pwmod".to_string(),
            types: vec![TypeDef {
                namespace: "Mods".to_string(),
                name: "Sample".to_string(),
                base_type: Some(TypeRef::parse("Patchwork.Plugin")),
                is_abstract: false,
                is_interface: false,
                annotations: Vec::new(),
                fields: Vec::new(),
                methods: vec![MethodDef {
                    token: 1,
                    name: "PrePatch".to_string(),
                    return_type: TypeRef::parse("System.Void"),
                    parameters: Vec::new(),
                    annotations: Vec::new(),
                    locals: Vec::new(),
                    body: vec![Instruction {
                        offset: 0,
                        opcode: "call".to_string(),
                        operand: Operand::Method(MethodRef {
                            declaring_type: TypeRef::parse(owner),
                            name: name.to_string(),
                            return_type: TypeRef::parse("System.String"),
                            parameters: vec![TypeRef::parse("System.String")],
                            generic_arguments: Vec::new(),
                        }),
                    }],
                }],
            }],
        }],
    };
    let artifact = CompiledArtifact::from_image(&image, None).unwrap();
    fs::write(dir.join(file), artifact.module_bytes()).unwrap();
}

#[test]
fn test_tiers_lists_reference_policy() {
    let home = TempDir::new().unwrap();
    patchwork_cmd(&home)
        .arg("tiers")
        .assert()
        .success()
        .stdout(predicate::str::contains("Tier 1: Trusted"))
        .stdout(predicate::str::contains("Tier 4: Minimal"));
}

#[test]
fn test_tiers_json_output() {
    let home = TempDir::new().unwrap();
    let output = patchwork_cmd(&home)
        .args(["tiers", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let tiers = value["tier"].as_array().unwrap();
    assert_eq!(tiers.len(), 4);
    assert_eq!(tiers[2]["name"], "Sandboxed");
}

#[test]
fn test_tiers_with_custom_policy() {
    let home = TempDir::new().unwrap();
    let policy = home.path().join("policy.toml");
    fs::write(
        &policy,
        "[[tier]]\nrank = 7\nname = \"Custom\"\nrestricted_namespaces = [\"Game.Internal\"]\n",
    )
    .unwrap();

    patchwork_cmd(&home)
        .args(["tiers", "--policy"])
        .arg(&policy)
        .assert()
        .success()
        .stdout(predicate::str::contains("Tier 7: Custom"))
        .stdout(predicate::str::contains("restricted: 1 namespace(s)"));
}

#[test]
fn test_inspect_module() {
    let home = TempDir::new().unwrap();
    write_module(home.path(), "sample.pwmod", "System.Math", "Abs");

    patchwork_cmd(&home)
        .arg("inspect")
        .arg(home.path().join("sample.pwmod"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Module: sample"))
        .stdout(predicate::str::contains("type Mods.Sample : Patchwork.Plugin"))
        .stdout(predicate::str::contains("PrePatch (1 instructions)"))
        .stdout(predicate::str::contains("Debug symbols: no"));
}

#[test]
fn test_inspect_rejects_bad_header() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("bad.pwmod");
    fs::write(&path, b"not a module at all").unwrap();

    patchwork_cmd(&home)
        .arg("inspect")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read module"));
}

#[test]
fn test_verify_binary_reports_highest_tier() {
    let home = TempDir::new().unwrap();
    let plugins = home.path().join("plugins");
    fs::create_dir_all(&plugins).unwrap();
    write_module(&plugins, "io.pwmod", "System.IO.File", "ReadAllText");

    patchwork_cmd(&home)
        .args(["verify", "--root"])
        .arg(&plugins)
        .arg(&plugins)
        .assert()
        .success()
        .stdout(predicate::str::contains("io.pwmod: passes tier 2"))
        .stdout(predicate::str::contains("[FAIL] tier 3 (Sandboxed)"))
        .stdout(predicate::str::contains("System.IO.File at Mods.Sample::PrePatch IL_0000"));
}

#[test]
fn test_verify_require_tier_fails_below() {
    let home = TempDir::new().unwrap();
    write_module(home.path(), "io.pwmod", "System.IO.File", "ReadAllText");

    patchwork_cmd(&home)
        .args(["--quiet", "verify", "--require-tier", "3", "--root"])
        .arg(home.path())
        .arg(home.path().join("io.pwmod"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("did not pass tier 3: io.pwmod"));
}

#[test]
fn test_verify_json_output() {
    let home = TempDir::new().unwrap();
    write_module(home.path(), "math.pwmod", "System.Math", "Abs");

    let output = patchwork_cmd(&home)
        .args(["verify", "--format", "json", "--root"])
        .arg(home.path())
        .arg(home.path().join("math.pwmod"))
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["result"], "Success");
    let tiers = value["plugins"]["math.pwmod"]["compliance"]["tiers"]
        .as_array()
        .unwrap();
    assert_eq!(tiers.len(), 4);
    assert!(tiers.iter().all(|t| t["passed"] == true));
}

#[test]
fn test_verify_missing_path_fails() {
    let home = TempDir::new().unwrap();
    patchwork_cmd(&home)
        .args(["verify"])
        .arg(home.path().join("nope.cs"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("No such plugin file or directory"));
}

#[test]
fn test_config_list_defaults() {
    let home = TempDir::new().unwrap();
    patchwork_cmd(&home)
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("compiler.program = patchwork-csc"))
        .stdout(predicate::str::contains("compiler.reuse_staged_references = true"));
}

#[test]
fn test_config_set_then_get() {
    let home = TempDir::new().unwrap();
    patchwork_cmd(&home)
        .args(["config", "set", "compiler.program", "mcs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set compiler.program = mcs"));

    assert!(home.path().join("config").join("config.toml").exists());

    patchwork_cmd(&home)
        .args(["config", "get", "compiler.program"])
        .assert()
        .success()
        .stdout(predicate::str::diff("mcs\n"));
}

#[test]
fn test_config_unknown_key_fails() {
    let home = TempDir::new().unwrap();
    patchwork_cmd(&home)
        .args(["config", "get", "compiler.nope"])
        .assert()
        .failure();
}

#[test]
fn test_savedata_show() {
    let home = TempDir::new().unwrap();
    let savedata = home.path().join("data").join("savedata").join("mods");
    fs::create_dir_all(&savedata).unwrap();
    fs::write(savedata.join("zoom.cs.toml"), "[Savedata]\nlevel = 3\n").unwrap();

    patchwork_cmd(&home)
        .args(["savedata", "mods/zoom.cs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("level = 3"));

    patchwork_cmd(&home)
        .args(["savedata", "mods/other.cs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No savedata for mods/other.cs"));
}
