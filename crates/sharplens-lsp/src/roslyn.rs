use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::client::{LspClient, LspClientOptions};
use crate::protocol::{LspDiagnostic, LspPosition, path_to_uri};
use crate::readiness::{ReadinessPolicy, wait_for_project_load};
use crate::symbols::{
    SymbolQueryOptions, SymbolReport, filter_symbols_by_kind, format_symbols,
    parse_location_results, parse_symbols,
};

pub const DEFAULT_SERVER_COMMAND: &str = "Microsoft.CodeAnalysis.LanguageServer";

#[derive(Debug, Clone)]
pub struct RoslynClientOptions {
    pub command: String,
    /// Extra arguments appended after the standard stdio/log flags.
    pub args: Vec<String>,
    pub root: PathBuf,
    pub log_level: String,
    pub log_directory: Option<PathBuf>,
    pub initialize_timeout: Duration,
    pub request_timeout: Duration,
    pub readiness: ReadinessPolicy,
    pub workspace_configuration: HashMap<String, Value>,
}

impl Default for RoslynClientOptions {
    fn default() -> Self {
        Self {
            command: DEFAULT_SERVER_COMMAND.to_string(),
            args: Vec::new(),
            root: PathBuf::from("."),
            log_level: "Information".to_string(),
            log_directory: None,
            initialize_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            readiness: ReadinessPolicy::default(),
            workspace_configuration: HashMap::new(),
        }
    }
}

impl RoslynClientOptions {
    fn server_args(&self) -> Vec<String> {
        let mut args = vec!["--stdio".to_string(), "--logLevel".to_string(), self.log_level.clone()];
        if let Some(dir) = &self.log_directory {
            args.push("--extensionLogDirectory".to_string());
            args.push(dir.to_string_lossy().into_owned());
        }
        args.push("--autoLoadProjects".to_string());
        args.extend(self.args.iter().cloned());
        args
    }
}

/// High-level client for the Roslyn analysis server: owns the session and
/// turns "what are the members of the type under this cursor" into the
/// open/readiness/resolve/symbol round trips the server actually needs.
pub struct RoslynClient {
    lsp: LspClient,
    readiness: ReadinessPolicy,
}

impl RoslynClient {
    pub async fn start(options: RoslynClientOptions) -> Result<Self> {
        if let Some(dir) = &options.log_directory {
            if let Err(err) = tokio::fs::create_dir_all(dir).await {
                warn!("failed to create server log directory {dir:?}: {err}");
            }
        }

        let readiness = options.readiness.clone();
        let lsp = LspClient::start(LspClientOptions {
            command: options.command.clone(),
            args: options.server_args(),
            root: options.root.clone(),
            initialize_timeout: options.initialize_timeout,
            request_timeout: options.request_timeout,
            workspace_configuration: options.workspace_configuration,
        })
        .await?;

        Ok(Self { lsp, readiness })
    }

    /// Wraps an already-initialized session; used by tests with in-memory
    /// streams.
    pub fn from_client(lsp: LspClient, readiness: ReadinessPolicy) -> Self {
        Self { lsp, readiness }
    }

    pub async fn open_document(&self, path: &Path) -> Result<PathBuf> {
        self.lsp.open_document(path).await
    }

    pub async fn close_document(&self, path: &Path) -> Result<()> {
        self.lsp.close_document(path).await
    }

    pub async fn cached_diagnostics(&self, uri: &str) -> Vec<LspDiagnostic> {
        self.lsp.cached_diagnostics(uri).await
    }

    pub async fn shutdown(self) -> Result<()> {
        self.lsp.shutdown().await
    }

    /// Resolves the type under `position` and returns its members.
    ///
    /// The readiness wait uses the caller's own typeDefinition query as the
    /// probe, so a REAL result doubles as the answer. An empty settled result
    /// falls back to one definition query (the cursor may sit on the member
    /// itself rather than a type name); if that is also empty the report is
    /// empty, not an error.
    pub async fn get_symbols_for(
        &self,
        path: &Path,
        position: LspPosition,
        options: &SymbolQueryOptions,
    ) -> Result<SymbolReport> {
        let abs = self.lsp.open_document(path).await?;
        let uri = path_to_uri(&abs)?;

        let lsp = &self.lsp;
        let settled = wait_for_project_load(&self.readiness, {
            let uri = uri.clone();
            let position = position.clone();
            move || {
                let uri = uri.clone();
                let position = position.clone();
                async move {
                    let result = lsp.type_definition(&uri, &position).await?;
                    parse_location_results(result)
                }
            }
        })
        .await
        .context("workspace never became ready for symbol resolution")?;

        let mut locations = settled.locations;
        if locations.is_empty() {
            debug!("typeDefinition empty after {} attempt(s), trying definition", settled.attempts);
            let result = lsp.definition(&uri, &position).await?;
            locations = parse_location_results(result)?;
        }

        let Some(target) = locations.first() else {
            return Ok(SymbolReport::default());
        };

        let response = lsp.document_symbols(&target.uri).await?;
        let mut symbols = parse_symbols(response)?;
        if let Some(filter) = &options.kind_filter {
            symbols = filter_symbols_by_kind(symbols, filter);
        }

        Ok(SymbolReport {
            source_uri: Some(target.uri.clone()),
            symbols: format_symbols(symbols, options.signature_only),
        })
    }
}
