//! Bridge configuration.
//!
//! Every field has a default so an empty table is a valid configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_NOTIFICATION_CONCURRENCY: usize = 4;

/// Configuration for one bridge session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub timeouts: Timeouts,
    /// How many documents may have diagnostics applied at the same time.
    /// Application for a single document is always serialized.
    pub notification_concurrency: usize,
    /// Send the buffer text along with `textDocument/didSave`.
    pub include_text_on_save: bool,
    /// Answered to `workspace/configuration`, looked up by section.
    pub settings: serde_json::Value,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            timeouts: Timeouts::default(),
            notification_concurrency: DEFAULT_NOTIFICATION_CONCURRENCY,
            include_text_on_save: false,
            settings: serde_json::Value::Null,
        }
    }
}

/// How to reach the language server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Executable command (e.g. "gopls"). Resolved on `PATH`.
    pub command: String,
    pub args: Vec<String>,
    /// LSP language identifier sent with `didOpen`.
    pub language_id: String,
    /// Connect to `host:port` (or `unix:/path` on unix) instead of spawning.
    pub socket: Option<String>,
    /// Workspace root. Defaults to the current directory.
    pub root: Option<PathBuf>,
    /// Extra environment for the spawned server.
    pub env: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: String::from("gopls"),
            args: Vec::new(),
            language_id: String::from("go"),
            socket: None,
            root: None,
            env: HashMap::new(),
        }
    }
}

/// Call classes with their own timeout budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// Cheap lookups: hover, definition, references.
    Query,
    /// Analysis-heavy work: rename, formatting, executeCommand.
    Analysis,
}

/// Timeouts in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub init_ms: u64,
    pub request_ms: u64,
    pub analysis_ms: u64,
    pub shutdown_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            init_ms: 30_000,
            request_ms: 10_000,
            analysis_ms: 60_000,
            shutdown_ms: 2_000,
        }
    }
}

impl Timeouts {
    #[must_use]
    pub fn for_class(&self, class: CallClass) -> Duration {
        match class {
            CallClass::Query => Duration::from_millis(self.request_ms),
            CallClass::Analysis => Duration::from_millis(self.analysis_ms),
        }
    }

    #[must_use]
    pub fn init(&self) -> Duration {
        Duration::from_millis(self.init_ms)
    }

    #[must_use]
    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
}
