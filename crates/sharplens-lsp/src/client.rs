use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::protocol::{
    LspDiagnostic, LspDidOpenTextDocumentParams, LspPosition, LspTextDocumentItem, path_to_uri,
};
use crate::rpc::{ReverseConfig, RpcSession};

#[derive(Debug, Clone)]
pub struct LspClientOptions {
    pub command: String,
    pub args: Vec<String>,
    pub root: PathBuf,
    pub initialize_timeout: Duration,
    pub request_timeout: Duration,
    pub workspace_configuration: HashMap<String, Value>,
}

/// Session lifecycle around one analysis-server process: spawn, handshake,
/// open-document tracking, steady-state queries, teardown.
pub struct LspClient {
    rpc: RpcSession,
    child: Option<Child>,
    root_uri: String,
    default_request_timeout: Duration,
    open_docs: Mutex<HashMap<PathBuf, i32>>,
}

impl LspClient {
    pub async fn start(options: LspClientOptions) -> Result<Self> {
        let root = options
            .root
            .canonicalize()
            .with_context(|| format!("failed to canonicalize root: {:?}", options.root))?;

        let mut command = Command::new(&options.command);
        command
            .args(&options.args)
            .current_dir(&root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            Error::Startup(format!(
                "failed to spawn analysis server `{}`: {err}",
                options.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Startup("failed to capture server stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Startup("failed to capture server stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Startup("failed to capture server stderr".to_string()))?;

        spawn_stderr_logger(stderr);

        let rpc = RpcSession::spawn(
            stdout,
            stdin,
            ReverseConfig {
                overrides: options.workspace_configuration,
            },
        );
        let root_uri = Url::from_directory_path(&root)
            .map_err(|_| anyhow!("failed to build rootUri for {root:?}"))?
            .to_string();

        let client = Self {
            rpc,
            child: Some(child),
            root_uri,
            default_request_timeout: options.request_timeout,
            open_docs: Mutex::new(HashMap::new()),
        };

        client
            .handshake(options.initialize_timeout)
            .await
            .context("failed to initialize analysis server")?;

        Ok(client)
    }

    /// Builds a session over arbitrary streams instead of a spawned process.
    /// The caller still drives [`LspClient::handshake`].
    pub fn from_streams<R, W>(
        reader: R,
        writer: W,
        root_uri: impl Into<String>,
        request_timeout: Duration,
        reverse: ReverseConfig,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            rpc: RpcSession::spawn(reader, writer, reverse),
            child: None,
            root_uri: root_uri.into(),
            default_request_timeout: request_timeout,
            open_docs: Mutex::new(HashMap::new()),
        }
    }

    /// `initialize`/`initialized` round trip. The deadline is deliberately
    /// generous: on first load the server may restore dependencies.
    pub async fn handshake(&self, initialize_timeout: Duration) -> Result<()> {
        let params = json!({
            "processId": std::process::id(),
            "rootUri": self.root_uri,
            "capabilities": {
                "textDocument": {
                    "hover": { "contentFormat": ["plaintext", "markdown"] },
                    "definition": { "linkSupport": true },
                    "typeDefinition": { "linkSupport": true },
                    "documentSymbol": { "hierarchicalDocumentSymbolSupport": true }
                },
                "workspace": { "configuration": true, "workspaceFolders": true }
            },
            "workspaceFolders": [
                { "uri": self.root_uri, "name": "workspace" }
            ]
        });

        if let Err(err) = self
            .rpc
            .send_request("initialize", &params, initialize_timeout)
            .await
        {
            if matches!(
                err.downcast_ref::<Error>(),
                Some(Error::RequestTimeout { .. })
            ) {
                return Err(Error::InitializeTimeout(initialize_timeout).into());
            }
            return Err(err);
        }

        self.rpc.send_notification("initialized", &json!({})).await
    }

    /// Idempotent: a uri already in the open set is not re-opened. Returns
    /// the canonical path used as the tracking key.
    pub async fn open_document(&self, path: &Path) -> Result<PathBuf> {
        let abs = path
            .canonicalize()
            .with_context(|| format!("failed to canonicalize file path: {path:?}"))?;

        {
            let open = self.open_docs.lock().await;
            if open.contains_key(&abs) {
                return Ok(abs);
            }
        }

        let text = tokio::fs::read_to_string(&abs)
            .await
            .with_context(|| format!("failed to read file: {abs:?}"))?;
        let params = LspDidOpenTextDocumentParams {
            text_document: LspTextDocumentItem {
                uri: path_to_uri(&abs)?,
                language_id: "csharp".to_string(),
                version: 1,
                text,
            },
        };

        {
            let mut open = self.open_docs.lock().await;
            if !open.contains_key(&abs) {
                debug!("didOpen {:?}", abs);
                self.rpc
                    .send_notification("textDocument/didOpen", &params)
                    .await?;
                open.insert(abs.clone(), 1);
            }
        }

        // Let the server's own tasks pick the document up before we query it.
        tokio::task::yield_now().await;
        Ok(abs)
    }

    pub async fn close_document(&self, path: &Path) -> Result<()> {
        let abs = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        {
            let mut open = self.open_docs.lock().await;
            if open.remove(&abs).is_none() {
                return Ok(());
            }
        }
        debug!("didClose {:?}", abs);
        let params = json!({ "textDocument": { "uri": path_to_uri(&abs)? } });
        self.rpc
            .send_notification("textDocument/didClose", &params)
            .await
    }

    pub async fn type_definition(&self, uri: &str, position: &LspPosition) -> Result<Value> {
        let params = json!({ "textDocument": { "uri": uri }, "position": position });
        self.rpc
            .send_request(
                "textDocument/typeDefinition",
                &params,
                self.default_request_timeout,
            )
            .await
    }

    pub async fn definition(&self, uri: &str, position: &LspPosition) -> Result<Value> {
        let params = json!({ "textDocument": { "uri": uri }, "position": position });
        self.rpc
            .send_request(
                "textDocument/definition",
                &params,
                self.default_request_timeout,
            )
            .await
    }

    pub async fn document_symbols(&self, uri: &str) -> Result<Value> {
        let params = json!({ "textDocument": { "uri": uri } });
        self.rpc
            .send_request(
                "textDocument/documentSymbol",
                &params,
                self.default_request_timeout,
            )
            .await
    }

    pub async fn cached_diagnostics(&self, uri: &str) -> Vec<LspDiagnostic> {
        self.rpc.cached_diagnostics(uri).await
    }

    /// Best-effort graceful shutdown, then kill as fallback so the child
    /// never outlives the session.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self
            .rpc
            .send_request("shutdown", &Value::Null, Duration::from_secs(2))
            .await;
        let _ = self.rpc.send_notification("exit", &Value::Null).await;

        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        Ok(())
    }
}

fn spawn_stderr_logger(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if trimmed.is_empty() || is_trace_noise(trimmed) {
                        continue;
                    }
                    debug!(target: "server.stderr", "{trimmed}");
                }
                Err(_) => break,
            }
        }
    });
}

fn is_trace_noise(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.starts_with("trce:") || lower.contains("[trace]")
}
