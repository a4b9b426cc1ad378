//! Public types exchanged with the editor collaborator.
//!
//! The editor sends [`EditorCommand`]s and document events into a
//! [`Session`](crate::Session) and receives [`EditorEvent`]s back. These types
//! serialize so a driver can forward them over its own channel unchanged.

use serde::{Deserialize, Serialize};

use crate::config::CallClass;

/// A zero-based line/character position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic from the language server.
///
/// Construction goes through [`Diagnostic::new`]; fields are read via
/// accessors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    range: Range,
    severity: DiagnosticSeverity,
    message: String,
    /// Resolved at the wire boundary; "unknown" when the server omits it.
    source: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(range: Range, severity: DiagnosticSeverity, message: String, source: String) -> Self {
        Self {
            range,
            severity,
            message,
            source,
        }
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Format as `uri:line:col: severity: [source] message` (1-indexed).
    #[must_use]
    pub fn display_with_uri(&self, uri: &str) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            uri,
            self.range.start.line + 1,
            self.range.start.character + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// Severity of a `window/logMessage` or `window/showMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSeverity {
    Error,
    Warning,
    Info,
    Log,
}

impl MessageSeverity {
    #[must_use]
    pub fn from_lsp(value: u64) -> Self {
        match value {
            1 => Self::Error,
            2 => Self::Warning,
            3 => Self::Info,
            _ => Self::Log,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Begin,
    Report,
    End,
}

/// A push notification for the editor. No acknowledgment is expected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EditorEvent {
    /// The displayed diagnostics for `uri` must be replaced by `diagnostics`.
    /// An empty list clears them.
    DiagnosticsUpdated {
        uri: String,
        version: i32,
        diagnostics: Vec<Diagnostic>,
    },
    LogMessage {
        severity: MessageSeverity,
        text: String,
        /// `window/showMessage`: the user should see it, not just the log.
        show: bool,
    },
    Progress {
        token: String,
        phase: ProgressPhase,
        /// `None` means indeterminate.
        percent: Option<u32>,
        title: Option<String>,
        message: Option<String>,
    },
    /// The session is gone. Sent once; the editor may offer a restart.
    ServerUnavailable { reason: String },
}

/// A user-invoked command that maps to one server request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EditorCommand {
    Hover {
        uri: String,
        position: Position,
    },
    Definition {
        uri: String,
        position: Position,
    },
    References {
        uri: String,
        position: Position,
        #[serde(default)]
        include_declaration: bool,
    },
    Rename {
        uri: String,
        position: Position,
        new_name: String,
    },
    Formatting {
        uri: String,
        #[serde(default = "default_tab_size")]
        tab_size: u32,
        #[serde(default)]
        insert_spaces: bool,
    },
    ExecuteCommand {
        command: String,
        #[serde(default)]
        arguments: Vec<serde_json::Value>,
    },
}

fn default_tab_size() -> u32 {
    4
}

impl EditorCommand {
    /// Short name used in contextual error messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hover { .. } => "hover",
            Self::Definition { .. } => "definition",
            Self::References { .. } => "references",
            Self::Rename { .. } => "rename",
            Self::Formatting { .. } => "formatting",
            Self::ExecuteCommand { .. } => "execute command",
        }
    }

    /// The document this command is about, if any.
    #[must_use]
    pub fn uri(&self) -> Option<&str> {
        match self {
            Self::Hover { uri, .. }
            | Self::Definition { uri, .. }
            | Self::References { uri, .. }
            | Self::Rename { uri, .. }
            | Self::Formatting { uri, .. } => Some(uri),
            Self::ExecuteCommand { .. } => None,
        }
    }

    pub(crate) fn uri_mut(&mut self) -> Option<&mut String> {
        match self {
            Self::Hover { uri, .. }
            | Self::Definition { uri, .. }
            | Self::References { uri, .. }
            | Self::Rename { uri, .. }
            | Self::Formatting { uri, .. } => Some(uri),
            Self::ExecuteCommand { .. } => None,
        }
    }

    /// Navigation lookups are queries; anything that makes the server
    /// analyze or rewrite code gets the longer analysis timeout.
    #[must_use]
    pub fn call_class(&self) -> CallClass {
        match self {
            Self::Hover { .. } | Self::Definition { .. } | Self::References { .. } => {
                CallClass::Query
            }
            Self::Rename { .. } | Self::Formatting { .. } | Self::ExecuteCommand { .. } => {
                CallClass::Analysis
            }
        }
    }
}

/// Immutable snapshot of all retained diagnostics.
///
/// Counts are computed from `files`, so they can never disagree with it.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-document diagnostics, documents with errors first.
    files: Vec<(String, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    /// Sorts documents with errors first, then by URI.
    pub(crate) fn new(mut files: Vec<(String, Vec<Diagnostic>)>) -> Self {
        files.retain(|(_, items)| !items.is_empty());
        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[(String, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn for_uri(&self, uri: &str) -> Option<&[Diagnostic]> {
        self.files
            .iter()
            .find(|(u, _)| u == uri)
            .map(|(_, items)| items.as_slice())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Compact status like "E:3 W:5"; empty when there is nothing to show.
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(line: u32, character: u32) -> Range {
        let pos = Position { line, character };
        Range { start: pos, end: pos }
    }

    fn make_diag(severity: DiagnosticSeverity, msg: &str) -> Diagnostic {
        Diagnostic::new(at(10, 5), severity, msg.to_string(), "compiler".to_string())
    }

    #[test]
    fn test_from_lsp_known_and_unknown() {
        assert_eq!(DiagnosticSeverity::from_lsp(1), Some(DiagnosticSeverity::Error));
        assert_eq!(DiagnosticSeverity::from_lsp(4), Some(DiagnosticSeverity::Hint));
        assert_eq!(DiagnosticSeverity::from_lsp(0), None);
        assert_eq!(DiagnosticSeverity::from_lsp(99), None);
    }

    #[test]
    fn test_message_severity_falls_back_to_log() {
        assert_eq!(MessageSeverity::from_lsp(1), MessageSeverity::Error);
        assert_eq!(MessageSeverity::from_lsp(3), MessageSeverity::Info);
        assert_eq!(MessageSeverity::from_lsp(7), MessageSeverity::Log);
    }

    #[test]
    fn test_display_with_uri() {
        let diag = make_diag(DiagnosticSeverity::Error, "expected ';', found 'EOF'");
        assert_eq!(
            diag.display_with_uri("file:///src/main.go"),
            "file:///src/main.go:11:6: error: [compiler] expected ';', found 'EOF'"
        );
    }

    #[test]
    fn test_snapshot_orders_errors_first_and_drops_empty() {
        let snap = DiagnosticsSnapshot::new(vec![
            (
                "file:///a.go".to_string(),
                vec![make_diag(DiagnosticSeverity::Warning, "w")],
            ),
            ("file:///b.go".to_string(), vec![]),
            (
                "file:///c.go".to_string(),
                vec![make_diag(DiagnosticSeverity::Error, "e")],
            ),
        ]);
        assert_eq!(snap.files().len(), 2);
        assert_eq!(snap.files()[0].0, "file:///c.go");
        assert_eq!(snap.status_string(), "E:1 W:1");
        assert_eq!(snap.total_count(), 2);
        assert!(snap.for_uri("file:///b.go").is_none());
    }

    #[test]
    fn test_editor_event_serializes_with_tag() {
        let event = EditorEvent::DiagnosticsUpdated {
            uri: "file:///main.go".to_string(),
            version: 2,
            diagnostics: vec![make_diag(DiagnosticSeverity::Error, "undefined: x")],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "diagnostics_updated");
        assert_eq!(json["version"], 2);
        assert_eq!(json["diagnostics"][0]["severity"], "error");
        assert_eq!(json["diagnostics"][0]["range"]["start"]["line"], 10);
    }

    #[test]
    fn test_editor_command_deserializes() {
        let cmd: EditorCommand = serde_json::from_value(serde_json::json!({
            "kind": "rename",
            "uri": "file:///main.go",
            "position": { "line": 3, "character": 7 },
            "new_name": "total"
        }))
        .unwrap();
        assert_eq!(cmd.name(), "rename");
        assert_eq!(cmd.uri(), Some("file:///main.go"));

        let cmd: EditorCommand = serde_json::from_value(serde_json::json!({
            "kind": "formatting",
            "uri": "file:///main.go"
        }))
        .unwrap();
        assert_eq!(
            cmd,
            EditorCommand::Formatting {
                uri: "file:///main.go".to_string(),
                tab_size: 4,
                insert_spaces: false,
            }
        );
    }

    #[test]
    fn test_command_call_classes() {
        let hover: EditorCommand = serde_json::from_value(serde_json::json!({
            "kind": "hover",
            "uri": "file:///main.go",
            "position": { "line": 0, "character": 0 }
        }))
        .unwrap();
        assert_eq!(hover.call_class(), CallClass::Query);

        let exec = EditorCommand::ExecuteCommand {
            command: "gopls.tidy".to_string(),
            arguments: Vec::new(),
        };
        assert_eq!(exec.call_class(), CallClass::Analysis);
        assert_eq!(exec.uri(), None);
    }
}
