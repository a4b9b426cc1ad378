//! Notification and server-request handlers.
//!
//! Both sets are closed: a method name maps to one of the variants below or
//! is not handled at all.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::codec::{INVALID_PARAMS, METHOD_NOT_FOUND, ResponseError};
use crate::protocol::{
    ConfigurationParams, MessageParams, ProgressParams, PublishDiagnosticsParams, WorkDoneProgress,
};
use crate::types::{Diagnostic, EditorEvent, MessageSeverity, ProgressPhase};

/// Server notifications the bridge acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotificationKind {
    PublishDiagnostics,
    LogMessage,
    ShowMessage,
    Progress,
}

impl NotificationKind {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "textDocument/publishDiagnostics" => Some(Self::PublishDiagnostics),
            "window/logMessage" => Some(Self::LogMessage),
            "window/showMessage" => Some(Self::ShowMessage),
            "$/progress" => Some(Self::Progress),
            _ => None,
        }
    }
}

/// Server-to-client requests the bridge answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerRequestKind {
    Configuration,
    RegisterCapability,
    UnregisterCapability,
    WorkDoneProgressCreate,
    ShowMessageRequest,
}

impl ServerRequestKind {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "workspace/configuration" => Some(Self::Configuration),
            "client/registerCapability" => Some(Self::RegisterCapability),
            "client/unregisterCapability" => Some(Self::UnregisterCapability),
            "window/workDoneProgress/create" => Some(Self::WorkDoneProgressCreate),
            "window/showMessageRequest" => Some(Self::ShowMessageRequest),
            _ => None,
        }
    }
}

/// Push side of the editor-visible surface.
///
/// Pushes are queued and delivered in order by a forwarder task, so neither
/// the inbound loop nor a diagnostics lane ever waits on a slow editor.
#[derive(Clone)]
pub(crate) struct EditorSink {
    tx: mpsc::UnboundedSender<EditorEvent>,
}

impl EditorSink {
    /// Must be called inside a Tokio runtime.
    pub fn new(editor: mpsc::Sender<EditorEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_events(rx, editor));
        Self { tx }
    }

    pub fn push(&self, event: EditorEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Editor event forwarder gone");
        }
    }

    pub fn diagnostics(&self, uri: &str, version: i32, diagnostics: Vec<Diagnostic>) {
        self.push(EditorEvent::DiagnosticsUpdated {
            uri: uri.to_string(),
            version,
            diagnostics,
        });
    }
}

async fn forward_events(
    mut rx: mpsc::UnboundedReceiver<EditorEvent>,
    editor: mpsc::Sender<EditorEvent>,
) {
    while let Some(event) = rx.recv().await {
        if editor.send(event).await.is_err() {
            tracing::debug!("Editor event receiver dropped");
            return;
        }
    }
}

/// Decoded `textDocument/publishDiagnostics`, ready for a document lane.
pub(crate) struct DiagnosticsPublication {
    pub uri: String,
    pub version: Option<i32>,
    pub items: Vec<Diagnostic>,
}

pub(crate) fn parse_publication(params: Option<Value>) -> Option<DiagnosticsPublication> {
    let params = params?;
    match serde_json::from_value::<PublishDiagnosticsParams>(params) {
        Ok(p) => Some(DiagnosticsPublication {
            uri: p.uri,
            version: p.version,
            items: p
                .diagnostics
                .into_iter()
                .map(crate::protocol::LspDiagnostic::into_diagnostic)
                .collect(),
        }),
        Err(e) => {
            tracing::debug!("Failed to parse publishDiagnostics: {e}");
            None
        }
    }
}

/// Editor event for a `window/logMessage` or `window/showMessage`.
pub(crate) fn message_event(params: Option<Value>, show: bool) -> Option<EditorEvent> {
    let params: MessageParams = serde_json::from_value(params?)
        .inspect_err(|e| tracing::debug!("Failed to parse message params: {e}"))
        .ok()?;
    Some(EditorEvent::LogMessage {
        severity: MessageSeverity::from_lsp(params.kind),
        text: params.message,
        show,
    })
}

/// Editor event for a `$/progress` work-done notification.
pub(crate) fn progress_event(params: Option<Value>) -> Option<EditorEvent> {
    let params: ProgressParams = serde_json::from_value(params?)
        .inspect_err(|e| tracing::trace!("Ignoring non work-done progress: {e}"))
        .ok()?;
    let token = match params.token {
        Value::String(s) => s,
        other => other.to_string(),
    };
    let event = match params.value {
        WorkDoneProgress::Begin {
            title,
            message,
            percentage,
        } => EditorEvent::Progress {
            token,
            phase: ProgressPhase::Begin,
            percent: percentage,
            title: Some(title),
            message,
        },
        WorkDoneProgress::Report {
            message,
            percentage,
        } => EditorEvent::Progress {
            token,
            phase: ProgressPhase::Report,
            percent: percentage,
            title: None,
            message,
        },
        WorkDoneProgress::End { message } => EditorEvent::Progress {
            token,
            phase: ProgressPhase::End,
            percent: None,
            title: None,
            message,
        },
    };
    Some(event)
}

/// Answer a server-initiated request.
///
/// `settings` is consulted for `workspace/configuration`; the returned event,
/// if any, is pushed to the editor before the reply is sent.
pub(crate) fn answer(
    method: &str,
    params: Option<Value>,
    settings: &Value,
) -> (Result<Value, ResponseError>, Option<EditorEvent>) {
    let Some(kind) = ServerRequestKind::from_method(method) else {
        tracing::debug!("Server sent unsupported request: {method}");
        return (
            Err(ResponseError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            )),
            None,
        );
    };

    match kind {
        ServerRequestKind::Configuration => {
            let parsed = params
                .map(serde_json::from_value::<ConfigurationParams>)
                .transpose();
            match parsed {
                Ok(Some(p)) => {
                    let values = p
                        .items
                        .iter()
                        .map(|item| lookup_section(settings, item.section.as_deref()))
                        .collect();
                    (Ok(Value::Array(values)), None)
                }
                Ok(None) | Err(_) => (
                    Err(ResponseError::new(
                        INVALID_PARAMS,
                        "workspace/configuration requires items",
                    )),
                    None,
                ),
            }
        }
        ServerRequestKind::RegisterCapability
        | ServerRequestKind::UnregisterCapability
        | ServerRequestKind::WorkDoneProgressCreate => (Ok(Value::Null), None),
        ServerRequestKind::ShowMessageRequest => (Ok(Value::Null), message_event(params, true)),
    }
}

/// Value at a dotted `section` path in `settings`, or `null`.
fn lookup_section(settings: &Value, section: Option<&str>) -> Value {
    let Some(section) = section.filter(|s| !s.is_empty()) else {
        return settings.clone();
    };
    section
        .split('.')
        .try_fold(settings, |value, key| value.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}
