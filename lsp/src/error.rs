//! Error taxonomy for the bridge.
//!
//! Only [`BridgeError::TransportClosed`] is session-fatal. Everything else is
//! local to one message or one call.

use std::time::Duration;

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// One inbound message failed to decode. The inbound loop skips it.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("cannot encode message: {0}")]
    Encoding(String),

    #[error("request '{method}' timed out after {}ms", .after.as_millis())]
    RequestTimeout { method: String, after: Duration },

    /// The server connection is gone.
    #[error("language server unavailable")]
    TransportClosed,

    /// A well-formed error response. The server's message is kept verbatim.
    #[error("{message}")]
    Application { code: i64, message: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("cannot start language server '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("invalid document URI '{0}'")]
    InvalidUri(String),

    #[error("document is not open: {0}")]
    DocumentNotOpen(String),

    #[error("document is already open: {0}")]
    DocumentAlreadyOpen(String),

    #[error("version {version} of {uri} is not newer than {current}")]
    StaleVersion {
        uri: String,
        version: i32,
        current: i32,
    },

    /// Contextual wrapper for a failed user command, e.g. "rename failed: ...".
    #[error("{name} failed: {source}")]
    Command {
        name: &'static str,
        #[source]
        source: Box<BridgeError>,
    },
}

impl BridgeError {
    /// Whether this error means the session is gone.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Self::TransportClosed => true,
            Self::Command { source, .. } => source.is_session_fatal(),
            _ => false,
        }
    }

    pub(crate) fn in_command(self, name: &'static str) -> Self {
        Self::Command {
            name,
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_reads_as_contextual_failure() {
        let err = BridgeError::Application {
            code: -32803,
            message: "cannot rename builtin".to_string(),
        }
        .in_command("rename");
        assert_eq!(err.to_string(), "rename failed: cannot rename builtin");
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn transport_closed_is_fatal_even_when_wrapped() {
        assert!(BridgeError::TransportClosed.is_session_fatal());
        assert!(BridgeError::TransportClosed.in_command("hover").is_session_fatal());
        assert!(
            !BridgeError::RequestTimeout {
                method: "textDocument/hover".to_string(),
                after: Duration::from_millis(5),
            }
            .is_session_fatal()
        );
    }

    #[test]
    fn timeout_message_names_method() {
        let err = BridgeError::RequestTimeout {
            method: "textDocument/definition".to_string(),
            after: Duration::from_millis(1500),
        };
        assert_eq!(
            err.to_string(),
            "request 'textDocument/definition' timed out after 1500ms"
        );
    }
}
