//! CLI tests

use crate::{Cli, Commands, ConfigAction, OutputFormat, collect_plugins};
use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[test]
fn test_verify_args_parsing() {
    let cli = Cli::try_parse_from([
        "patchwork",
        "--format",
        "json",
        "verify",
        "mods/a.cs",
        "mods/b.pwmod",
        "-r",
        "Host.dll",
        "--require-tier",
        "3",
    ])
    .expect("parse");

    assert_eq!(cli.format, OutputFormat::Json);
    match cli.command {
        Commands::Verify {
            paths,
            references,
            require_tier,
            policy,
            ..
        } => {
            assert_eq!(paths, [PathBuf::from("mods/a.cs"), PathBuf::from("mods/b.pwmod")]);
            assert_eq!(references, [PathBuf::from("Host.dll")]);
            assert_eq!(require_tier, Some(3));
            assert!(policy.is_none());
        }
        _ => panic!("expected verify"),
    }
}

#[test]
fn test_verify_requires_paths() {
    assert!(Cli::try_parse_from(["patchwork", "verify"]).is_err());
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from(["patchwork", "tiers", "--quiet", "--format", "json"])
        .expect("parse");
    assert!(cli.quiet);
    assert_eq!(cli.format, OutputFormat::Json);
}

#[test]
fn test_config_action_parsing() {
    let cli = Cli::try_parse_from(["patchwork", "config", "set", "compiler.program", "mcs"])
        .expect("parse");
    assert!(matches!(
        cli.command,
        Commands::Config {
            action: ConfigAction::Set { ref key, ref value }
        } if key == "compiler.program" && value == "mcs"
    ));
}

#[test]
fn test_collect_plugins_walks_directories_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("b")).expect("mkdir");
    fs::write(dir.path().join("b/z.cs"), "").expect("write");
    fs::write(dir.path().join("a.pwmod"), "").expect("write");
    fs::write(dir.path().join("notes.txt"), "").expect("write");

    let found = collect_plugins(&[dir.path().to_path_buf()]).expect("collect");
    assert_eq!(found, [dir.path().join("a.pwmod"), dir.path().join("b/z.cs")]);

    assert!(collect_plugins(&[dir.path().join("missing.cs")]).is_err());
}
