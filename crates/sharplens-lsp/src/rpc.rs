use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::error::Error;
use crate::protocol::{LspDiagnostic, PublishDiagnosticsParams};
use crate::transport::{FrameDecoder, encode_frame};

/// Values served back when the server issues reverse `workspace/configuration`
/// requests, keyed by the requested `section`. Sections without an override
/// fall back to [`default_configuration_value`].
#[derive(Debug, Clone, Default)]
pub struct ReverseConfig {
    pub overrides: HashMap<String, Value>,
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value, Error>>,
}

struct RpcState {
    next_id: i64,
    pending: HashMap<i64, PendingRequest>,
}

struct Shared {
    // Single exclusive write channel: frames must never interleave mid-write.
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    state: Mutex<RpcState>,
    diagnostics: Mutex<HashMap<String, Vec<LspDiagnostic>>>,
    reverse: ReverseConfig,
}

/// One JSON-RPC session over a byte stream pair. Outbound requests are
/// correlated to inbound responses purely by id; inbound notifications and
/// server-initiated requests are dispatched by a single reader task.
pub(crate) struct RpcSession {
    shared: Arc<Shared>,
}

impl RpcSession {
    pub(crate) fn spawn<R, W>(reader: R, writer: W, reverse: ReverseConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::new(writer)),
            state: Mutex::new(RpcState {
                next_id: 1,
                pending: HashMap::new(),
            }),
            diagnostics: Mutex::new(HashMap::new()),
            reverse,
        });
        tokio::spawn(read_loop(reader, Arc::clone(&shared)));
        Self { shared }
    }

    /// Sends a request and suspends until the matching response arrives or
    /// the deadline fires. On timeout the pending entry is purged first, so a
    /// late response is dropped instead of resolving a dead waiter.
    pub(crate) async fn send_request<T: Serialize>(
        &self,
        method: &str,
        params: &T,
        wait: Duration,
    ) -> Result<Value> {
        let (id, rx) = {
            let mut state = self.shared.state.lock().await;
            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    tx,
                },
            );
            (id, rx)
        };

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = write_frame(&self.shared, &request).await {
            self.shared.state.lock().await.pending.remove(&id);
            return Err(err);
        }

        match timeout(wait, rx).await {
            Err(_elapsed) => {
                self.shared.state.lock().await.pending.remove(&id);
                Err(Error::RequestTimeout {
                    method: method.to_string(),
                    timeout: wait,
                }
                .into())
            }
            Ok(Err(_closed)) => Err(Error::ChannelClosed.into()),
            Ok(Ok(outcome)) => outcome.map_err(Into::into),
        }
    }

    pub(crate) async fn send_notification<T: Serialize>(
        &self,
        method: &str,
        params: &T,
    ) -> Result<()> {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        write_frame(&self.shared, &notification).await
    }

    pub(crate) async fn cached_diagnostics(&self, uri: &str) -> Vec<LspDiagnostic> {
        self.shared
            .diagnostics
            .lock()
            .await
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }
}

async fn write_frame(shared: &Shared, message: &Value) -> Result<()> {
    let frame = encode_frame(message)?;
    let mut writer = shared.writer.lock().await;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                decoder.extend(&chunk[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(message)) => dispatch(&shared, message).await,
                        Ok(None) => break,
                        Err(err) => warn!("dropping malformed frame: {err}"),
                    }
                }
            }
            Err(err) => {
                warn!("failed to read from analysis server: {err}");
                break;
            }
        }
    }
    reject_all(&shared).await;
}

async fn dispatch(shared: &Arc<Shared>, message: Value) {
    let method = message
        .get("method")
        .and_then(|m| m.as_str())
        .map(str::to_string);
    let raw_id = message.get("id").cloned().filter(|v| !v.is_null());

    match (raw_id, method) {
        (Some(id), Some(method)) => {
            answer_reverse_request(shared, id, &method, message.get("params")).await;
        }
        (None, Some(method)) => {
            handle_notification(shared, &method, message.get("params")).await;
        }
        (Some(id), None) => complete_pending(shared, &id, &message).await,
        (None, None) => warn!("message with neither id nor method: {message}"),
    }
}

async fn complete_pending(shared: &Arc<Shared>, id: &Value, message: &Value) {
    let parsed_id = match id {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    };
    let Some(parsed_id) = parsed_id else {
        warn!("response with unusable id: {id}");
        return;
    };

    let entry = shared.state.lock().await.pending.remove(&parsed_id);
    let Some(PendingRequest { method, tx }) = entry else {
        debug!("dropping response for unknown or timed-out request id {parsed_id}");
        return;
    };

    let outcome = match message.get("error") {
        Some(err) if !err.is_null() => Err(Error::Rpc {
            method,
            code: err.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
            message: err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        }),
        _ => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = tx.send(outcome);
}

async fn answer_reverse_request(
    shared: &Arc<Shared>,
    id: Value,
    method: &str,
    params: Option<&Value>,
) {
    let result = match method {
        "workspace/configuration" => configuration_items(&shared.reverse, params),
        "client/registerCapability" | "window/workDoneProgress/create" => Value::Null,
        other => {
            // Answer anyway so the server never stalls on us.
            debug!("answering unknown server request with null: {other}");
            Value::Null
        }
    };

    let response = json!({ "jsonrpc": "2.0", "id": id, "result": result });
    if let Err(err) = write_frame(shared, &response).await {
        warn!("failed to answer server request {method}: {err:#}");
    }
}

fn configuration_items(reverse: &ReverseConfig, params: Option<&Value>) -> Value {
    let items = params
        .and_then(|p| p.get("items"))
        .and_then(|i| i.as_array())
        .cloned()
        .unwrap_or_default();

    let values: Vec<Value> = items
        .iter()
        .map(|item| {
            let section = item.get("section").and_then(|s| s.as_str()).unwrap_or("");
            reverse
                .overrides
                .get(section)
                .cloned()
                .unwrap_or_else(|| default_configuration_value(section))
        })
        .collect();
    Value::Array(values)
}

fn default_configuration_value(section: &str) -> Value {
    // The server asks for these before it will navigate into decompiled BCL
    // sources or search reference assemblies.
    if section.contains("navigate_to_decompiled_sources")
        || section.contains("search_reference_assemblies")
    {
        return Value::Bool(true);
    }
    Value::Null
}

async fn handle_notification(shared: &Arc<Shared>, method: &str, params: Option<&Value>) {
    match method {
        "window/logMessage" => {
            let level = params
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_u64())
                .unwrap_or(4);
            let text = params
                .and_then(|p| p.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("");
            match level {
                1 => error!(target: "server", "{text}"),
                2 => warn!(target: "server", "{text}"),
                3 => info!(target: "server", "{text}"),
                _ => debug!(target: "server", "{text}"),
            }
        }
        "textDocument/publishDiagnostics" => {
            let Some(params) = params else { return };
            match serde_json::from_value::<PublishDiagnosticsParams>(params.clone()) {
                Ok(p) => {
                    shared
                        .diagnostics
                        .lock()
                        .await
                        .insert(p.uri, p.diagnostics);
                }
                Err(err) => warn!("failed to parse publishDiagnostics params: {err:#}"),
            }
        }
        "$/progress" => trace!(target: "server", "progress: {params:?}"),
        other => debug!("unhandled server notification: {other}"),
    }
}

async fn reject_all(shared: &Arc<Shared>) {
    let mut state = shared.state.lock().await;
    if state.pending.is_empty() {
        return;
    }
    warn!(
        "analysis server stream closed with {} request(s) in flight",
        state.pending.len()
    );
    for (_, entry) in state.pending.drain() {
        let _ = entry.tx.send(Err(Error::ChannelClosed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex, split};

    async fn read_server_frame(stream: &mut DuplexStream, decoder: &mut FrameDecoder) -> Value {
        loop {
            if let Ok(Some(value)) = decoder.next_frame() {
                return value;
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.expect("server read failed");
            assert_ne!(n, 0, "client closed the stream mid-test");
            decoder.extend(&chunk[..n]);
        }
    }

    async fn write_server_message(stream: &mut DuplexStream, message: &Value) {
        let frame = encode_frame(message).unwrap();
        stream.write_all(&frame).await.unwrap();
    }

    fn session_pair() -> (RpcSession, DuplexStream) {
        let (client_io, server_io) = duplex(64 * 1024);
        let (reader, writer) = split(client_io);
        let session = RpcSession::spawn(reader, writer, ReverseConfig::default());
        (session, server_io)
    }

    #[tokio::test]
    async fn concurrent_requests_get_unique_ids_and_correlate_out_of_order() {
        let (session, mut server) = session_pair();

        let server_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let first = read_server_frame(&mut server, &mut decoder).await;
            let second = read_server_frame(&mut server, &mut decoder).await;
            assert_ne!(first["id"], second["id"]);

            // Answer in reverse submission order.
            write_server_message(
                &mut server,
                &json!({ "jsonrpc": "2.0", "id": second["id"], "result": second["method"] }),
            )
            .await;
            write_server_message(
                &mut server,
                &json!({ "jsonrpc": "2.0", "id": first["id"], "result": first["method"] }),
            )
            .await;
            server
        });

        let params = json!({});
        let (one, two) = tokio::join!(
            session.send_request("probe/one", &params, Duration::from_secs(5)),
            session.send_request("probe/two", &params, Duration::from_secs(5)),
        );
        assert_eq!(one.unwrap(), json!("probe/one"));
        assert_eq!(two.unwrap(), json!("probe/two"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_dropped() {
        let (session, mut server) = session_pair();

        let server_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let slow = read_server_frame(&mut server, &mut decoder).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            write_server_message(
                &mut server,
                &json!({ "jsonrpc": "2.0", "id": slow["id"], "result": "too late" }),
            )
            .await;

            // The session must still be usable afterwards.
            let fast = read_server_frame(&mut server, &mut decoder).await;
            write_server_message(
                &mut server,
                &json!({ "jsonrpc": "2.0", "id": fast["id"], "result": "on time" }),
            )
            .await;
            server
        });

        let err = session
            .send_request("probe/slow", &json!({}), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::RequestTimeout { .. })
        ));

        // Give the late response time to arrive and be discarded.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let value = session
            .send_request("probe/fast", &json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, json!("on time"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn reverse_configuration_request_is_answered_per_item() {
        let (client_io, mut server) = duplex(64 * 1024);
        let (reader, writer) = split(client_io);
        let mut overrides = HashMap::new();
        overrides.insert("custom|section".to_string(), json!("tuned"));
        let _session = RpcSession::spawn(reader, writer, ReverseConfig { overrides });

        write_server_message(
            &mut server,
            &json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "workspace/configuration",
                "params": { "items": [
                    { "section": "csharp|navigation.dotnet_navigate_to_decompiled_sources" },
                    { "section": "csharp|symbol_search.dotnet_search_reference_assemblies" },
                    { "section": "custom|section" },
                    { "section": "unrelated|thing" }
                ] }
            }),
        )
        .await;

        let mut decoder = FrameDecoder::new();
        let response = read_server_frame(&mut server, &mut decoder).await;
        assert_eq!(response["id"], json!(7));
        assert_eq!(response["result"], json!([true, true, "tuned", null]));
    }

    #[tokio::test]
    async fn unknown_reverse_request_is_answered_with_null() {
        let (_session, mut server) = session_pair();

        write_server_message(
            &mut server,
            &json!({ "jsonrpc": "2.0", "id": 9, "method": "server/unknownThing", "params": {} }),
        )
        .await;

        let mut decoder = FrameDecoder::new();
        let response = read_server_frame(&mut server, &mut decoder).await;
        assert_eq!(response["id"], json!(9));
        assert_eq!(response["result"], json!(null));
    }

    #[tokio::test]
    async fn pending_requests_are_rejected_when_the_stream_closes() {
        let (session, mut server) = session_pair();

        let server_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let _request = read_server_frame(&mut server, &mut decoder).await;
            drop(server);
        });

        let err = session
            .send_request("probe/abandoned", &json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ChannelClosed)
        ));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn publish_diagnostics_notifications_are_cached_per_uri() {
        let (session, mut server) = session_pair();

        write_server_message(
            &mut server,
            &json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": {
                    "uri": "file:///work/Program.cs",
                    "diagnostics": [{
                        "range": {
                            "start": { "line": 1, "character": 0 },
                            "end": { "line": 1, "character": 5 }
                        },
                        "severity": 2,
                        "message": "unused variable"
                    }]
                }
            }),
        )
        .await;

        // The reader task races this assertion; poll briefly.
        let mut diags = Vec::new();
        for _ in 0..50 {
            diags = session.cached_diagnostics("file:///work/Program.cs").await;
            if !diags.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "unused variable");
    }
}
