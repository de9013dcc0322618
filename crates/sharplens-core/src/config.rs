use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Default command for the external C# analysis server.
pub const DEFAULT_SERVER_COMMAND: &str = "Microsoft.CodeAnalysis.LanguageServer";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct SharplensConfig {
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub readiness: Option<ReadinessConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Command to start the analysis server.
    #[serde(default)]
    pub command: Option<String>,
    /// Extra arguments appended after the standard stdio/log flags.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    #[serde(alias = "logLevel")]
    pub log_level: Option<String>,
    #[serde(default)]
    #[serde(alias = "logDirectory")]
    pub log_directory: Option<PathBuf>,
    /// Deadline for the `initialize` round trip. Generous by default: the
    /// server may restore dependencies on first load.
    #[serde(default)]
    pub initialize_timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Responses for server-initiated `workspace/configuration` requests,
    /// keyed by the requested `section`.
    #[serde(default)]
    #[serde(alias = "workspaceConfiguration")]
    pub workspace_configuration: Option<HashMap<String, JsonValue>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct ReadinessConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub min_attempts: Option<u32>,
    #[serde(default)]
    pub settle_threshold: Option<u32>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Substring identifying results that still resolve inside the server's
    /// transient placeholder project. Server-version-dependent.
    #[serde(default)]
    pub placeholder_fingerprint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: SharplensConfig,
    pub workspace_root: PathBuf,
    pub source: ConfigSource,
}

#[derive(Debug, Clone)]
pub enum ConfigSource {
    None,
    Path(PathBuf),
    Env(PathBuf),
    Workspace(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub log_level: String,
    pub log_directory: Option<PathBuf>,
    pub initialize_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub workspace_configuration: HashMap<String, JsonValue>,
    pub readiness: ResolvedReadinessConfig,
}

#[derive(Debug, Clone)]
pub struct ResolvedReadinessConfig {
    pub max_attempts: u32,
    pub min_attempts: u32,
    pub settle_threshold: u32,
    pub poll_interval_ms: u64,
    pub placeholder_fingerprint: String,
}

pub fn load_config(
    cli_config_path: Option<&Path>,
    cli_workspace_root: Option<&Path>,
) -> Result<LoadedConfig> {
    if let Some(path) = cli_config_path {
        let config = read_config_file(path)?;
        let workspace_root =
            resolve_workspace_root(cli_workspace_root, config.workspace_root.as_deref())?;
        return Ok(LoadedConfig {
            config,
            workspace_root,
            source: ConfigSource::Path(path.to_path_buf()),
        });
    }

    if let Ok(path) = std::env::var("SHARPLENS_CONFIG_PATH")
        && !path.trim().is_empty()
    {
        let path = PathBuf::from(path);
        let config = read_config_file(&path)?;
        let workspace_root =
            resolve_workspace_root(cli_workspace_root, config.workspace_root.as_deref())?;
        return Ok(LoadedConfig {
            config,
            workspace_root,
            source: ConfigSource::Env(path),
        });
    }

    let fallback_root = cli_workspace_root
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let workspace_root = fallback_root.canonicalize().unwrap_or(fallback_root);

    for candidate in workspace_config_candidates(&workspace_root) {
        if candidate.exists() {
            let config = read_config_file(&candidate)?;
            let effective_root =
                resolve_workspace_root(Some(&workspace_root), config.workspace_root.as_deref())?;
            return Ok(LoadedConfig {
                config,
                workspace_root: effective_root,
                source: ConfigSource::Workspace(candidate),
            });
        }
    }

    Ok(LoadedConfig {
        config: SharplensConfig::default(),
        workspace_root,
        source: ConfigSource::None,
    })
}

pub fn resolve_server(config: &SharplensConfig) -> ResolvedServerConfig {
    let server = config.server.clone().unwrap_or_default();
    let readiness = config.readiness.clone().unwrap_or_default();

    let command = std::env::var("SHARPLENS_SERVER_COMMAND")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or(server.command)
        .unwrap_or_else(|| DEFAULT_SERVER_COMMAND.to_string());

    ResolvedServerConfig {
        command,
        args: server.args.unwrap_or_default(),
        log_level: server.log_level.unwrap_or_else(|| "Information".to_string()),
        log_directory: server.log_directory,
        initialize_timeout_ms: server.initialize_timeout_ms.unwrap_or(60_000),
        request_timeout_ms: server.request_timeout_ms.unwrap_or(30_000),
        workspace_configuration: server.workspace_configuration.unwrap_or_default(),
        readiness: ResolvedReadinessConfig {
            max_attempts: readiness.max_attempts.unwrap_or(40),
            min_attempts: readiness.min_attempts.unwrap_or(5),
            settle_threshold: readiness.settle_threshold.unwrap_or(3),
            poll_interval_ms: readiness.poll_interval_ms.unwrap_or(500),
            placeholder_fingerprint: readiness
                .placeholder_fingerprint
                .unwrap_or_else(|| "miscellaneousfiles".to_string()),
        },
    }
}

fn resolve_workspace_root(cli: Option<&Path>, from_config: Option<&Path>) -> Result<PathBuf> {
    if let Some(cli) = cli {
        return cli
            .canonicalize()
            .with_context(|| format!("failed to canonicalize workspace_root: {cli:?}"));
    }
    if let Some(cfg) = from_config {
        return cfg
            .canonicalize()
            .with_context(|| format!("failed to canonicalize workspace_root: {cfg:?}"));
    }
    let cwd = std::env::current_dir().context("failed to get current_dir")?;
    Ok(cwd.canonicalize().unwrap_or(cwd))
}

fn workspace_config_candidates(workspace_root: &Path) -> Vec<PathBuf> {
    vec![
        workspace_root.join(".sharplens").join("config.toml"),
        workspace_root.join("sharplens.toml"),
    ]
}

fn read_config_file(path: &Path) -> Result<SharplensConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    match path.extension().and_then(OsStr::to_str) {
        Some("json") => serde_json::from_str(&text)
            .with_context(|| format!("failed to parse JSON config: {}", path.display())),
        _ => toml::from_str(&text)
            .with_context(|| format!("failed to parse TOML config: {}", path.display())),
    }
}
