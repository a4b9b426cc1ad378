//! LSP method names, outbound parameter shapes and inbound params.

use std::path::Path;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{BridgeError, Result};
use crate::types::{Diagnostic, DiagnosticSeverity, EditorCommand, Range};

pub(crate) const INITIALIZE: &str = "initialize";
pub(crate) const INITIALIZED: &str = "initialized";
pub(crate) const SHUTDOWN: &str = "shutdown";
pub(crate) const EXIT: &str = "exit";
pub(crate) const CANCEL_REQUEST: &str = "$/cancelRequest";
pub(crate) const DID_OPEN: &str = "textDocument/didOpen";
pub(crate) const DID_CHANGE: &str = "textDocument/didChange";
pub(crate) const DID_CLOSE: &str = "textDocument/didClose";
pub(crate) const DID_SAVE: &str = "textDocument/didSave";

/// Canonical form of a document URI.
///
/// Parsing and re-serializing normalizes percent-encoding and case of the
/// scheme so editor and server spellings of the same file compare equal.
pub fn canonical_uri(uri: &str) -> Result<String> {
    url::Url::parse(uri)
        .map(String::from)
        .map_err(|_| BridgeError::InvalidUri(uri.to_string()))
}

/// `file://` URI for an absolute path.
pub fn path_to_file_uri(path: &Path) -> Result<String> {
    url::Url::from_file_path(path)
        .map(String::from)
        .map_err(|()| BridgeError::InvalidUri(path.display().to_string()))
}

pub(crate) fn initialize_params(root_uri: &str) -> Value {
    json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "workspace": {
                "configuration": true,
                "didChangeConfiguration": { "dynamicRegistration": false }
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "publishDiagnostics": {
                    "relatedInformation": false,
                    "versionSupport": true
                }
            },
            "window": {
                "workDoneProgress": true,
                "showMessage": {}
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    })
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

/// Full-content sync: one change event carrying the whole buffer.
pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn did_save_params(uri: &str, text: Option<&str>) -> Value {
    let mut params = json!({ "textDocument": { "uri": uri } });
    if let Some(text) = text {
        params["text"] = Value::from(text);
    }
    params
}

pub(crate) fn cancel_params(id: u64) -> Value {
    json!({ "id": id })
}

/// Method and params for a user command.
pub(crate) fn command_request(command: &EditorCommand) -> (&'static str, Value) {
    match command {
        EditorCommand::Hover { uri, position } => (
            "textDocument/hover",
            json!({ "textDocument": { "uri": uri }, "position": position }),
        ),
        EditorCommand::Definition { uri, position } => (
            "textDocument/definition",
            json!({ "textDocument": { "uri": uri }, "position": position }),
        ),
        EditorCommand::References {
            uri,
            position,
            include_declaration,
        } => (
            "textDocument/references",
            json!({
                "textDocument": { "uri": uri },
                "position": position,
                "context": { "includeDeclaration": include_declaration }
            }),
        ),
        EditorCommand::Rename {
            uri,
            position,
            new_name,
        } => (
            "textDocument/rename",
            json!({ "textDocument": { "uri": uri }, "position": position, "newName": new_name }),
        ),
        EditorCommand::Formatting {
            uri,
            tab_size,
            insert_spaces,
        } => (
            "textDocument/formatting",
            json!({
                "textDocument": { "uri": uri },
                "options": { "tabSize": tab_size, "insertSpaces": insert_spaces }
            }),
        ),
        EditorCommand::ExecuteCommand { command, arguments } => (
            "workspace/executeCommand",
            json!({ "command": command, "arguments": arguments }),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    #[serde(default)]
    pub version: Option<i32>,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: Range,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
}

impl LspDiagnostic {
    pub fn into_diagnostic(self) -> Diagnostic {
        Diagnostic::new(
            self.range,
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message,
            self.source.unwrap_or_else(|| String::from("unknown")),
        )
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageParams {
    #[serde(rename = "type")]
    pub kind: u64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProgressParams {
    pub token: Value,
    pub value: WorkDoneProgress,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub(crate) enum WorkDoneProgress {
    Begin {
        title: String,
        message: Option<String>,
        percentage: Option<u32>,
    },
    Report {
        message: Option<String>,
        percentage: Option<u32>,
    },
    End {
        message: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConfigurationParams {
    pub items: Vec<ConfigurationItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfigurationItem {
    pub section: Option<String>,
}
