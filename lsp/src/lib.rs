//! Protocol bridge between an editor and a language server.
//!
//! A [`Session`] owns one server connection. The editor drives it with
//! document events and [`EditorCommand`]s and receives [`EditorEvent`]s on a
//! channel: diagnostics as they are published, server messages and progress,
//! and a single [`EditorEvent::ServerUnavailable`] if the server goes away.

pub mod codec;
pub mod config;
pub mod error;
pub mod types;

pub(crate) mod dispatcher;
pub(crate) mod document;
pub(crate) mod handlers;
pub(crate) mod protocol;
pub(crate) mod tracker;
pub(crate) mod transport;

mod session;

pub use config::{BridgeConfig, CallClass, ServerConfig, Timeouts};
pub use error::{BridgeError, Result};
pub use protocol::{canonical_uri, path_to_file_uri};
pub use session::Session;
pub use types::{
    Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot, EditorCommand, EditorEvent,
    MessageSeverity, Position, ProgressPhase, Range,
};
