//! Patchwork CLI - vet and inspect host plugins

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use patchwork_core::artifact::CompiledArtifact;
use patchwork_core::compiler::{
    CompilationService, CompileMode, CompileOptions, ExternalToolchain, ReferenceSet,
};
use patchwork_core::config::Config;
use patchwork_core::policy::PermissionPolicy;
use patchwork_core::verifier::{MODULE_EXTENSION, PluginComplianceReport, PluginInput, Verifier};
use patchwork_plugins::report::aggregate;
use patchwork_plugins::savedata::{SavedataStore, TomlSavedataStore};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Extension of plugin source files picked up from directories
const SOURCE_EXTENSION: &str = "cs";

#[derive(Parser)]
#[command(name = "patchwork")]
#[command(author, version, about = "Vet and inspect host plugins", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify plugins against every tier of the policy
    Verify {
        /// Plugin sources, modules, or directories containing them
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Root that plugin identities are relative to
        #[arg(long)]
        root: Option<PathBuf>,
        /// Policy file (defaults to the configured or built-in policy)
        #[arg(short, long)]
        policy: Option<PathBuf>,
        /// Additional reference binary
        #[arg(short, long = "reference")]
        references: Vec<PathBuf>,
        /// Fail unless every plugin passes at least this tier
        #[arg(long)]
        require_tier: Option<u8>,
    },

    /// Compile plugin sources into loadable modules
    Compile {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        /// Output directory
        #[arg(short, long)]
        out: PathBuf,
        /// One module per source instead of one combined module
        #[arg(long)]
        per_source: bool,
        #[arg(short, long = "reference")]
        references: Vec<PathBuf>,
    },

    /// Show the contents of a compiled module
    Inspect {
        /// Module file (.pwmod)
        artifact: PathBuf,
    },

    /// List the tiers of the active policy
    Tiers {
        #[arg(short, long)]
        policy: Option<PathBuf>,
    },

    /// Show a plugin's persisted savedata
    Savedata {
        /// Plugin identity (relative source path)
        identity: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("patchwork=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Verify {
            paths,
            root,
            policy,
            references,
            require_tier,
        } => cmd_verify(
            &paths,
            root.as_deref(),
            policy.as_deref(),
            references,
            require_tier,
            cli.format,
            cli.quiet,
        ),

        Commands::Compile {
            sources,
            out,
            per_source,
            references,
        } => cmd_compile(&sources, &out, per_source, references, cli.quiet),

        Commands::Inspect { artifact } => cmd_inspect(&artifact, cli.format),

        Commands::Tiers { policy } => cmd_tiers(policy.as_deref(), cli.format),

        Commands::Savedata { identity } => cmd_savedata(&identity, cli.format),

        Commands::Config { action } => cmd_config(action, cli.quiet),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn load_policy(config: &Config, path: Option<&Path>) -> anyhow::Result<PermissionPolicy> {
    match path {
        Some(path) => PermissionPolicy::load(path)
            .with_context(|| format!("Failed to load policy file: {}", path.display())),
        None => config.policy.load_policy(),
    }
}

fn compilation_service(config: &Config) -> CompilationService {
    CompilationService::new(Box::new(ExternalToolchain::from_config(&config.compiler)))
        .with_reference_reuse(config.compiler.reuse_staged_references)
}

fn reference_set(config: &Config, extra: Vec<PathBuf>) -> ReferenceSet {
    config
        .compiler
        .references
        .iter()
        .cloned()
        .chain(extra)
        .fold(ReferenceSet::new(), |set, path| set.with_path(path))
}

/// Expand directories into the plugin files they contain, sorted by path
fn collect_plugins(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for path in paths {
        if path.is_dir() {
            walk(path, &mut found)?;
        } else if path.is_file() {
            found.push(path.clone());
        } else {
            bail!("No such plugin file or directory: {}", path.display());
        }
    }
    Ok(found)
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.path());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, found)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == SOURCE_EXTENSION || ext == MODULE_EXTENSION)
        {
            found.push(path);
        }
    }
    Ok(())
}

fn cmd_verify(
    paths: &[PathBuf],
    root: Option<&Path>,
    policy_path: Option<&Path>,
    references: Vec<PathBuf>,
    require_tier: Option<u8>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let policy = load_policy(&config, policy_path)?;
    if let Some(rank) = require_tier {
        policy.tier(rank)?;
    }

    let default_root = config.plugins.resolved_source_dir().ok();
    let root = root.map(Path::to_path_buf).or(default_root);
    let inputs: Vec<PluginInput> = collect_plugins(paths)?
        .iter()
        .map(|p| PluginInput::from_path(root.as_deref(), p))
        .collect();
    info!(plugins = inputs.len(), tiers = policy.tiers().len(), "Verifying plugins");

    let mut compiler = compilation_service(&config);
    let reports = Verifier::new(&policy, &mut compiler, reference_set(&config, references))
        .verify_all(&inputs);

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&aggregate(&reports, None))?);
        }
        OutputFormat::Text => {
            for report in &reports {
                print_compliance(report, &policy, quiet);
            }
        }
    }

    if let Some(rank) = require_tier {
        let below: Vec<&str> = reports
            .iter()
            .filter(|r| !r.tier(rank).is_some_and(|t| t.passed))
            .map(|r| r.identity.as_str())
            .collect();
        if !below.is_empty() {
            bail!("{} plugin(s) did not pass tier {rank}: {}", below.len(), below.join(", "));
        }
    }
    Ok(())
}

fn print_compliance(report: &PluginComplianceReport, policy: &PermissionPolicy, quiet: bool) {
    let summary = match report.highest_passed_tier() {
        _ if report.is_untested() => "untested".to_string(),
        Some(rank) => format!("passes tier {rank}"),
        None => "passes no tier".to_string(),
    };
    println!("{}: {}", report.identity, summary);
    if quiet {
        return;
    }

    for diagnostic in &report.compile_errors {
        println!("  error: {diagnostic}");
    }
    if let Some(error) = &report.load_error {
        println!("  load error: {error}");
    }
    for result in report.tiers.iter().filter(|t| t.tested) {
        let name = policy.tier(result.tier).map(|t| t.name()).unwrap_or("?");
        let status = if result.passed { "PASS" } else { "FAIL" };
        println!("  [{status}] tier {} ({name})", result.tier);
        for violation in &result.violations {
            let generic = if violation.is_generic_argument {
                " [generic argument]"
            } else {
                ""
            };
            println!(
                "    - {} at {}{generic}",
                violation.offending_name, violation.location
            );
        }
    }
}

fn cmd_compile(
    sources: &[PathBuf],
    out: &Path,
    per_source: bool,
    references: Vec<PathBuf>,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let options = CompileOptions {
        mode: if per_source {
            CompileMode::PerSource
        } else {
            CompileMode::Combined
        },
        emit_debug_symbols: config.compiler.emit_debug_symbols,
    };

    let mut compiler = compilation_service(&config);
    let artifacts = compiler
        .compile(sources, &reference_set(&config, references), options)
        .map_err(|e| {
            if let patchwork_core::Error::CompileFailed(diagnostics) = &e {
                for diagnostic in diagnostics {
                    eprintln!("error: {diagnostic}");
                }
            }
            anyhow::Error::new(e)
        })?;

    fs::create_dir_all(out)
        .with_context(|| format!("Failed to create output directory: {}", out.display()))?;
    for artifact in &artifacts {
        let module_path = out.join(format!("{}.{MODULE_EXTENSION}", artifact.name()));
        fs::write(&module_path, artifact.module_bytes())?;
        if let Some(symbols) = artifact.symbol_bytes() {
            fs::write(module_path.with_extension("pwsym"), symbols)?;
        }
        debug!(module = %module_path.display(), "Module written");
        if !quiet {
            println!("Wrote {}", module_path.display());
        }
    }
    Ok(())
}

fn cmd_inspect(path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let artifact = CompiledArtifact::read(path)
        .with_context(|| format!("Failed to read module: {}", path.display()))?;
    let image = artifact.image()?;

    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "name": artifact.name(),
                "fingerprint": artifact.fingerprint(),
                "has_symbols": artifact.has_symbols(),
                "image": image,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            println!("Module: {}", artifact.name());
            println!("  Fingerprint: {}", artifact.fingerprint());
            println!(
                "  Debug symbols: {}",
                if artifact.has_symbols() { "yes" } else { "no" }
            );
            for ty in image.types() {
                let base = ty
                    .base_type
                    .as_ref()
                    .map(|b| format!(" : {b}"))
                    .unwrap_or_default();
                println!("  type {}{base}", ty.full_name());
                for method in &ty.methods {
                    println!(
                        "    {} ({} instructions)",
                        method.name,
                        method.body.len()
                    );
                }
            }
        }
    }
    Ok(())
}

fn cmd_tiers(policy_path: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let config = Config::load()?;
    let policy = load_policy(&config, policy_path)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&policy)?),
        OutputFormat::Text => {
            for tier in policy.tiers() {
                println!("Tier {}: {}", tier.rank(), tier.name());
                println!(
                    "  restricted: {} namespace(s), {} type(s), {} method(s)",
                    tier.restricted_namespaces().len(),
                    tier.restricted_types().len(),
                    tier.restricted_methods().len()
                );
                println!(
                    "  whitelisted: {} namespace(s), {} type(s)",
                    tier.whitelisted_namespaces().len(),
                    tier.whitelisted_types().len()
                );
            }
        }
    }
    Ok(())
}

fn cmd_savedata(identity: &str, format: OutputFormat) -> anyhow::Result<()> {
    let config = Config::load()?;
    let store = TomlSavedataStore::new(config.plugins.resolved_savedata_dir()?);
    let document = store.load(identity)?;

    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "identity": identity,
                "exists": !document.created,
                "savedata": document.savedata,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            if document.created {
                println!("No savedata for {identity}");
            } else {
                print!("{}", toml_display(&document.savedata)?);
            }
        }
    }
    Ok(())
}

fn toml_display(savedata: &patchwork_plugins::savedata::Savedata) -> anyhow::Result<String> {
    let mut root = toml::Table::new();
    root.insert(
        "Savedata".to_string(),
        toml::Value::Table(savedata.as_table().clone()),
    );
    Ok(toml::to_string_pretty(&root)?)
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod main_tests;
