//! Bidirectional RPC bridge between the engine and step runtimes.
//!
//! Messages are newline-delimited JSON objects discriminated by `type`
//! (`rpc_request` / `rpc_response`). A [`Transport`] moves lines over a byte
//! stream or a child's stdio; an [`RpcSession`] layers handler dispatch,
//! id correlation, call timeouts, and close tracking on top.

pub mod error;
pub mod handlers;
pub mod process;
pub mod session;
pub mod transport;

pub use error::RpcError;
pub use handlers::{RpcHandler, raw_handler, typed_handler};
pub use process::spawn_child;
pub use session::{
    CloseReason, DEFAULT_CALL_TIMEOUT, MessageObserver, PendingCall, RpcSession, RpcSessionBuilder, WeakRpcSession,
};
pub use transport::{Transport, TransportEvent};
