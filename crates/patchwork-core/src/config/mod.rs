//! Configuration management with file persistence

use crate::policy::PermissionPolicy;
use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Compiler front-end that emits Patchwork module and symbol streams
pub const DEFAULT_COMPILER: &str = "patchwork-csc";

/// Patchwork configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Compiler front-end invoked for plugin sources. It must write a
    /// `PWMOD` stream to `-out:` and a `PWSYM` stream to `-pdb:`.
    pub program: PathBuf,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Host binaries every plugin is compiled against
    #[serde(default)]
    pub references: Vec<PathBuf>,
    pub emit_debug_symbols: bool,
    pub reuse_staged_references: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// TOML policy file; the built-in reference policy is used when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    pub source_dir: Option<PathBuf>,
    pub savedata_dir: Option<PathBuf>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_COMPILER),
            extra_args: vec!["-nologo".to_string()],
            references: Vec::new(),
            emit_debug_symbols: true,
            reuse_staged_references: true,
        }
    }
}

impl PluginsConfig {
    /// Root that plugin identities are made relative to
    pub fn resolved_source_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.source_dir {
            return Ok(dir.clone());
        }
        if let Ok(dir) = env::var("PATCHWORK_PLUGIN_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(Config::data_dir()?.join("plugins"))
    }

    /// Directory holding per-plugin savedata documents
    pub fn resolved_savedata_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.savedata_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Config::data_dir()?.join("savedata")),
        }
    }
}

impl PolicyConfig {
    pub fn load_policy(&self) -> anyhow::Result<PermissionPolicy> {
        match &self.path {
            Some(path) => PermissionPolicy::load(path)
                .with_context(|| format!("Failed to load policy file: {}", path.display())),
            None => Ok(PermissionPolicy::reference()),
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("PATCHWORK_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("patchwork")
        };
        Ok(dir)
    }

    /// Get the data directory path (plugins, savedata)
    pub fn data_dir() -> anyhow::Result<PathBuf> {
        if let Ok(custom_dir) = env::var("PATCHWORK_DATA_DIR") {
            return Ok(PathBuf::from(custom_dir));
        }
        Ok(dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?
            .join("patchwork"))
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or fall back to defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.compiler.program.as_os_str().is_empty() {
            return Err(anyhow!("compiler.program cannot be empty"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "compiler.program" => Ok(self.compiler.program.display().to_string()),
            "compiler.extra_args" => Ok(self.compiler.extra_args.join(" ")),
            "compiler.references" => Ok(join_paths(&self.compiler.references)),
            "compiler.emit_debug_symbols" => Ok(self.compiler.emit_debug_symbols.to_string()),
            "compiler.reuse_staged_references" => {
                Ok(self.compiler.reuse_staged_references.to_string())
            }

            "policy.path" => Ok(display_optional(&self.policy.path, "(built-in reference policy)")),

            "plugins.source_dir" => Ok(display_optional(&self.plugins.source_dir, "(default)")),
            "plugins.savedata_dir" => Ok(display_optional(&self.plugins.savedata_dir, "(default)")),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `patchwork config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "compiler.program" => {
                if value.trim().is_empty() {
                    return Err(anyhow!("compiler.program cannot be empty"));
                }
                self.compiler.program = PathBuf::from(value);
            }
            "compiler.extra_args" => {
                self.compiler.extra_args = value.split_whitespace().map(str::to_string).collect();
            }
            "compiler.references" => {
                self.compiler.references = split_list(value).map(PathBuf::from).collect();
            }
            "compiler.emit_debug_symbols" => {
                self.compiler.emit_debug_symbols = parse_bool(key, value)?;
            }
            "compiler.reuse_staged_references" => {
                self.compiler.reuse_staged_references = parse_bool(key, value)?;
            }

            "policy.path" => self.policy.path = optional_path(value),

            "plugins.source_dir" => self.plugins.source_dir = optional_path(value),
            "plugins.savedata_dir" => self.plugins.savedata_dir = optional_path(value),

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `patchwork config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "compiler.program",
            "compiler.extra_args",
            "compiler.references",
            "compiler.emit_debug_symbols",
            "compiler.reuse_staged_references",
            "policy.path",
            "plugins.source_dir",
            "plugins.savedata_dir",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("Invalid boolean for {}: {}", key, value)),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn optional_path(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

fn display_optional(path: &Option<PathBuf>, fallback: &str) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
