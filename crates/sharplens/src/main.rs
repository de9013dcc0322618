use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sharplens_core::config::{ConfigSource, load_config, resolve_server};
use sharplens_lsp::{
    LspPosition, ReadinessPolicy, RoslynClient, RoslynClientOptions, SymbolQueryOptions,
};

/// Resolve the type under a cursor position and list its members.
#[derive(Debug, Parser)]
#[command(name = "sharplens", version, about)]
struct Cli {
    /// C# source file to query.
    file: PathBuf,

    /// Zero-based line of the cursor position.
    #[arg(long)]
    line: u32,

    /// Zero-based character of the cursor position.
    #[arg(long)]
    character: u32,

    /// Keep only symbols of this kind (Method, Property, Field, Event,
    /// Class, Interface, Enum). Method includes constructors.
    #[arg(long)]
    kind: Option<String>,

    /// Emit signatures only, without source ranges.
    #[arg(long)]
    signature_only: bool,

    /// Explicit config file; otherwise SHARPLENS_CONFIG_PATH or the
    /// workspace's .sharplens/config.toml / sharplens.toml is used.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Workspace root handed to the analysis server. Defaults to the
    /// current directory.
    #[arg(long)]
    workspace_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let loaded = load_config(cli.config.as_deref(), cli.workspace_root.as_deref())
        .context("failed to load configuration")?;
    match &loaded.source {
        ConfigSource::None => debug!("no config file found, using defaults"),
        ConfigSource::Path(path) | ConfigSource::Env(path) | ConfigSource::Workspace(path) => {
            debug!("loaded config from {}", path.display());
        }
    }

    let server = resolve_server(&loaded.config);
    let options = RoslynClientOptions {
        command: server.command,
        args: server.args,
        root: loaded.workspace_root,
        log_level: server.log_level,
        log_directory: server.log_directory,
        initialize_timeout: Duration::from_millis(server.initialize_timeout_ms),
        request_timeout: Duration::from_millis(server.request_timeout_ms),
        readiness: ReadinessPolicy {
            max_attempts: server.readiness.max_attempts,
            min_attempts: server.readiness.min_attempts,
            settle_threshold: server.readiness.settle_threshold,
            poll_interval: Duration::from_millis(server.readiness.poll_interval_ms),
            placeholder_fingerprint: server.readiness.placeholder_fingerprint,
        },
        workspace_configuration: server.workspace_configuration,
    };

    info!("starting analysis server `{}`", options.command);
    let client = RoslynClient::start(options).await?;

    let query = SymbolQueryOptions {
        kind_filter: cli.kind,
        signature_only: cli.signature_only,
    };
    let position = LspPosition {
        line: cli.line,
        character: cli.character,
    };

    // Always tear the server down, even when the query fails.
    let outcome = client.get_symbols_for(&cli.file, position, &query).await;
    client.shutdown().await?;

    let report = outcome?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
