//! Client library for the Roslyn C# analysis server: length-prefixed
//! JSON-RPC transport, a correlated request/response session, process
//! lifecycle management, workspace-readiness detection, and a symbol
//! query pipeline on top.

mod client;
mod error;
mod protocol;
mod readiness;
mod roslyn;
mod rpc;
mod symbols;
pub mod transport;

pub use client::{LspClient, LspClientOptions};
pub use error::Error;
pub use protocol::{
    LspDiagnostic, LspDocumentSymbol, LspLocation, LspPosition, LspRange, LspSymbolInformation,
    path_to_uri, symbol_kind, symbol_kind_name,
};
pub use readiness::{Classification, ReadinessPolicy, Settled, wait_for_project_load};
pub use roslyn::{DEFAULT_SERVER_COMMAND, RoslynClient, RoslynClientOptions};
pub use rpc::ReverseConfig;
pub use symbols::{
    FlatSymbol, SymbolDescriptor, SymbolQueryOptions, SymbolReport, filter_kind_set,
    filter_symbols_by_kind, format_symbols,
};
