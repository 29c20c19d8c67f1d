//! Config module tests

use crate::config::{CompilerConfig, Config, DEFAULT_COMPILER, PolicyConfig};
use std::path::PathBuf;

#[test]
fn test_config_default() {
    let config = Config::default();

    assert_eq!(config.compiler.program, PathBuf::from(DEFAULT_COMPILER));
    assert!(!config.compiler.extra_args.iter().any(|a| a.starts_with("-debug")));
    assert!(config.compiler.emit_debug_symbols);
    assert!(config.compiler.reuse_staged_references);
    assert!(config.compiler.references.is_empty());
    assert!(config.policy.path.is_none());
    assert!(config.plugins.source_dir.is_none());
}

#[test]
fn test_config_toml_roundtrip() {
    let mut config = Config::default();
    config.compiler.references = vec![PathBuf::from("/opt/host/Host.dll")];
    config.policy.path = Some(PathBuf::from("/etc/patchwork/policy.toml"));

    let serialized = toml::to_string_pretty(&config).expect("Should serialize");
    let deserialized = Config::from_toml_str(&serialized).expect("Should deserialize");

    assert_eq!(deserialized.compiler.references, config.compiler.references);
    assert_eq!(deserialized.policy.path, config.policy.path);
}

#[test]
fn test_config_partial_toml_uses_defaults() {
    let config = Config::from_toml_str("[policy]\npath = \"tiers.toml\"\n").expect("parse");
    assert_eq!(config.policy.path, Some(PathBuf::from("tiers.toml")));
    assert_eq!(config.compiler.program, PathBuf::from(DEFAULT_COMPILER));
}

#[test]
fn test_config_rejects_empty_program() {
    let mut config = Config::default();
    config.compiler = CompilerConfig {
        program: PathBuf::new(),
        ..CompilerConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_config_get_set() {
    let mut config = Config::default();

    config.set("compiler.program", "/usr/bin/mcs").expect("set program");
    assert_eq!(config.get("compiler.program").expect("get"), "/usr/bin/mcs");

    config
        .set("compiler.references", "A.dll, B.dll,,")
        .expect("set references");
    assert_eq!(config.compiler.references.len(), 2);

    config
        .set("compiler.emit_debug_symbols", "off")
        .expect("set bool");
    assert!(!config.compiler.emit_debug_symbols);

    config.set("policy.path", "").expect("clear policy");
    assert!(config.policy.path.is_none());
    assert_eq!(
        config.get("policy.path").expect("get"),
        "(built-in reference policy)"
    );
}

#[test]
fn test_config_set_invalid_values() {
    let mut config = Config::default();
    assert!(config.set("compiler.program", "  ").is_err());
    assert!(config.set("compiler.emit_debug_symbols", "maybe").is_err());
    assert!(config.set("nope", "1").is_err());
    assert!(config.get("nope").is_err());
}

#[test]
fn test_config_list_covers_all_keys() {
    let config = Config::default();
    let entries = config.list().expect("list");
    assert_eq!(entries.len(), 8);
    assert!(entries.iter().any(|(k, _)| k == "plugins.savedata_dir"));
}

#[test]
fn test_policy_config_defaults_to_reference_policy() {
    let policy = PolicyConfig::default().load_policy().expect("policy");
    assert_eq!(policy.tiers().len(), 4);
}

#[test]
fn test_policy_config_loads_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("policy.toml");
    std::fs::write(&path, "[[tier]]\nrank = 1\nname = \"Only\"\n").expect("write");

    let policy = PolicyConfig { path: Some(path) }
        .load_policy()
        .expect("policy");
    assert_eq!(policy.tiers().len(), 1);
    assert_eq!(policy.tiers()[0].name(), "Only");
}

#[test]
fn test_policy_config_missing_file() {
    let result = PolicyConfig {
        path: Some(PathBuf::from("/nonexistent/policy.toml")),
    }
    .load_policy();
    assert!(result.is_err());
}
