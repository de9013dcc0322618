use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for a session with the analysis server.
///
/// Public APIs return `anyhow::Result`; these variants ride along so callers
/// can `downcast_ref` when the distinction matters.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to start analysis server: {0}")]
    Startup(String),

    #[error("analysis server did not answer initialize within {0:?}")]
    InitializeTimeout(Duration),

    #[error("request timed out: {method} after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    #[error("workspace never left the placeholder project after {attempts} attempts")]
    ReadinessTimeout { attempts: u32 },

    #[error("malformed frame on the wire: {reason}")]
    MalformedFrame { reason: String },

    #[error("analysis server exited with requests in flight")]
    ChannelClosed,

    #[error("analysis server returned an error for {method} (code {code}): {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
}
