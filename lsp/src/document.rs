//! Document state - per-document versions and retained diagnostics.
//!
//! Each open document sits behind its own async mutex. Every outbound
//! notification for a document is sent while holding that mutex, which keeps
//! didOpen, didChange and didClose for one document in version order on the
//! wire without serializing unrelated documents. Diagnostics are applied and
//! queued for the editor under the same mutex, so a close can never be
//! overtaken by an older diagnostics push. Queueing never waits, so no lock
//! is held while the editor drains events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::Mutex;

use crate::dispatcher::notify;
use crate::error::{BridgeError, Result};
use crate::handlers::EditorSink;
use crate::protocol;
use crate::transport::Transport;
use crate::types::{Diagnostic, DiagnosticsSnapshot};

/// Diagnostics computed against one document version.
#[derive(Debug, Clone)]
pub(crate) struct DiagnosticSet {
    pub version: i32,
    pub items: Vec<Diagnostic>,
}

/// Why a diagnostics publication was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Discard {
    Closed,
    /// Older than what is already applied.
    Stale { version: i32, applied: i32 },
    /// Claims a version the editor never produced.
    AheadOfContent { version: i32, current: i32 },
}

#[derive(Debug)]
pub(crate) struct Document {
    uri: String,
    text: String,
    current: i32,
    last_sent: i32,
    diagnostics: Option<DiagnosticSet>,
    closed: bool,
}

impl Document {
    fn new(uri: String, text: String) -> Self {
        Self {
            uri,
            text,
            current: 0,
            last_sent: 0,
            diagnostics: None,
            closed: false,
        }
    }

    pub fn diagnostics_version(&self) -> Option<i32> {
        self.diagnostics.as_ref().map(|set| set.version)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(BridgeError::DocumentNotOpen(self.uri.clone()));
        }
        Ok(())
    }

    fn check_version(&self, version: i32) -> Result<()> {
        self.ensure_open()?;
        if version <= self.current {
            return Err(BridgeError::StaleVersion {
                uri: self.uri.clone(),
                version,
                current: self.current,
            });
        }
        Ok(())
    }

    fn has_visible_diagnostics(&self) -> bool {
        self.diagnostics
            .as_ref()
            .is_some_and(|set| !set.items.is_empty())
    }

    /// Replace the retained set unless the publication is stale.
    ///
    /// A missing version is read as the last version sent to the server.
    /// Returns whether the editor-visible state changed.
    pub fn apply(
        &mut self,
        version: Option<i32>,
        items: Vec<Diagnostic>,
    ) -> std::result::Result<bool, Discard> {
        if self.closed {
            return Err(Discard::Closed);
        }
        let version = version.unwrap_or(self.last_sent);
        if version > self.current {
            return Err(Discard::AheadOfContent {
                version,
                current: self.current,
            });
        }
        if let Some(applied) = self.diagnostics_version()
            && version < applied
        {
            return Err(Discard::Stale { version, applied });
        }

        let visible_change = self.has_visible_diagnostics() || !items.is_empty();
        self.diagnostics = Some(DiagnosticSet { version, items });
        Ok(visible_change)
    }

    /// Drop the retained set. Returns whether anything was visible.
    fn clear_diagnostics(&mut self) -> bool {
        let visible = self.has_visible_diagnostics();
        self.diagnostics = None;
        visible
    }
}

pub(crate) type DocumentHandle = Arc<Mutex<Document>>;

pub(crate) struct DocumentStore {
    docs: StdMutex<HashMap<String, DocumentHandle>>,
    language_id: String,
    include_text_on_save: bool,
}

impl DocumentStore {
    pub fn new(language_id: String, include_text_on_save: bool) -> Self {
        Self {
            docs: StdMutex::new(HashMap::new()),
            language_id,
            include_text_on_save,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DocumentHandle>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, uri: &str) -> Option<DocumentHandle> {
        self.lock().get(uri).cloned()
    }

    /// Create the document at version 0 and send `didOpen`.
    ///
    /// A close still in flight for `uri` finishes first.
    pub async fn on_open(&self, transport: &Transport, uri: String, text: String) -> Result<()> {
        while let Some(existing) = self.get(&uri) {
            // A closing document is removed before its lock is released.
            if !existing.lock().await.closed {
                return Err(BridgeError::DocumentAlreadyOpen(uri));
            }
        }

        let handle = Arc::new(Mutex::new(Document::new(uri.clone(), text)));
        // Held before the document becomes visible so no change can be sent
        // ahead of the open.
        let mut doc = handle.lock().await;
        {
            let mut docs = self.lock();
            if docs.contains_key(&uri) {
                return Err(BridgeError::DocumentAlreadyOpen(uri));
            }
            docs.insert(uri.clone(), Arc::clone(&handle));
        }

        let params = protocol::did_open_params(&uri, &self.language_id, doc.current, &doc.text);
        if let Err(e) = notify(transport, protocol::DID_OPEN, params).await {
            doc.closed = true;
            self.forget(&uri, &handle);
            return Err(e);
        }
        doc.last_sent = doc.current;
        tracing::debug!(uri = %uri, "Document opened");
        Ok(())
    }

    /// Remove `uri` if it still maps to `handle`.
    fn forget(&self, uri: &str, handle: &DocumentHandle) {
        let mut docs = self.lock();
        if docs.get(uri).is_some_and(|current| Arc::ptr_eq(current, handle)) {
            docs.remove(uri);
        }
    }

    /// Record a new version and send `didChange`. The version must be newer
    /// than the current one.
    pub async fn on_change(
        &self,
        transport: &Transport,
        uri: &str,
        text: String,
        version: i32,
    ) -> Result<()> {
        let handle = self
            .get(uri)
            .ok_or_else(|| BridgeError::DocumentNotOpen(uri.to_string()))?;
        let mut doc = handle.lock().await;
        doc.check_version(version)?;

        doc.current = version;
        doc.text = text;
        let params = protocol::did_change_params(uri, version, &doc.text);
        notify(transport, protocol::DID_CHANGE, params).await?;
        doc.last_sent = version;
        Ok(())
    }

    /// Send `didClose`, forget the document and clear its diagnostics.
    ///
    /// The entry is removed only after `didClose` is on the wire, so a reopen
    /// of the same URI can't overtake it. Closing a document that isn't open
    /// needs no protocol call.
    pub async fn on_close(&self, transport: &Transport, uri: &str, sink: &EditorSink) -> Result<()> {
        let Some(handle) = self.get(uri) else {
            tracing::debug!(uri = %uri, "Close for document that isn't open");
            return Ok(());
        };
        let mut doc = handle.lock().await;
        if doc.closed {
            return Ok(());
        }
        doc.closed = true;
        if doc.clear_diagnostics() {
            sink.diagnostics(uri, doc.current, Vec::new());
        }
        let sent = notify(transport, protocol::DID_CLOSE, protocol::did_close_params(uri)).await;
        self.forget(uri, &handle);
        sent
    }

    /// Send `didSave`. Versions don't change.
    pub async fn on_save(&self, transport: &Transport, uri: &str) -> Result<()> {
        let Some(handle) = self.get(uri) else {
            tracing::debug!(uri = %uri, "Save for document that isn't open");
            return Ok(());
        };
        let doc = handle.lock().await;
        doc.ensure_open()?;
        let text = self.include_text_on_save.then_some(doc.text.as_str());
        notify(transport, protocol::DID_SAVE, protocol::did_save_params(uri, text)).await
    }

    /// Close every document and clear all visible diagnostics. Used at
    /// session teardown.
    pub async fn clear_all(&self, sink: &EditorSink) {
        let drained: Vec<(String, DocumentHandle)> = self.lock().drain().collect();
        for (uri, handle) in drained {
            let mut doc = handle.lock().await;
            doc.closed = true;
            if doc.clear_diagnostics() {
                sink.diagnostics(&uri, doc.current, Vec::new());
            }
        }
    }

    pub async fn snapshot(&self) -> DiagnosticsSnapshot {
        let handles: Vec<(String, DocumentHandle)> = self
            .lock()
            .iter()
            .map(|(uri, handle)| (uri.clone(), Arc::clone(handle)))
            .collect();
        let mut files = Vec::with_capacity(handles.len());
        for (uri, handle) in handles {
            let doc = handle.lock().await;
            if let Some(set) = &doc.diagnostics {
                files.push((uri, set.items.clone()));
            }
        }
        DiagnosticsSnapshot::new(files)
    }
}

/// Apply one diagnostics publication to `handle` and push it when it changes
/// what the editor shows. Stale or orphaned publications are dropped quietly.
pub(crate) async fn apply_diagnostics(
    handle: &DocumentHandle,
    uri: &str,
    version: Option<i32>,
    items: Vec<Diagnostic>,
    sink: &EditorSink,
) {
    let mut doc = handle.lock().await;
    let count = items.len();
    match doc.apply(version, items) {
        Ok(true) => {
            if let Some(set) = doc.diagnostics.as_ref() {
                tracing::debug!(uri = %uri, version = set.version, count, "Diagnostics updated");
                sink.diagnostics(uri, set.version, set.items.clone());
            }
        }
        Ok(false) => {
            tracing::trace!(uri = %uri, "Diagnostics unchanged (still empty)");
        }
        Err(Discard::AheadOfContent { version, current }) => {
            tracing::warn!(
                uri = %uri,
                version,
                current,
                "Protocol violation: diagnostics for a version the editor never sent"
            );
        }
        Err(reason) => {
            tracing::debug!(uri = %uri, ?reason, "Dropping stale diagnostics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiagnosticSeverity, Position, Range};

    fn diag(msg: &str) -> Diagnostic {
        let pos = Position {
            line: 0,
            character: 0,
        };
        Diagnostic::new(
            Range {
                start: pos,
                end: pos,
            },
            DiagnosticSeverity::Error,
            msg.to_string(),
            "compiler".to_string(),
        )
    }

    fn doc_at(current: i32) -> Document {
        let mut doc = Document::new("file:///main.go".to_string(), String::new());
        doc.current = current;
        doc.last_sent = current;
        doc
    }

    #[test]
    fn test_new_document_starts_at_zero() {
        let doc = doc_at(0);
        assert_eq!(doc.current, 0);
        assert_eq!(doc.last_sent, 0);
        assert_eq!(doc.diagnostics_version(), None);
    }

    #[test]
    fn test_change_requires_newer_version() {
        let doc = doc_at(3);
        assert!(doc.check_version(4).is_ok());
        assert!(matches!(
            doc.check_version(3),
            Err(BridgeError::StaleVersion {
                version: 3,
                current: 3,
                ..
            })
        ));
        assert!(doc.check_version(1).is_err());
    }

    #[test]
    fn test_older_diagnostics_never_overwrite_newer() {
        let mut doc = doc_at(2);
        assert_eq!(doc.apply(Some(2), vec![]), Ok(false));
        assert_eq!(
            doc.apply(Some(1), vec![diag("old")]),
            Err(Discard::Stale {
                version: 1,
                applied: 2
            })
        );
        assert_eq!(doc.diagnostics_version(), Some(2));
    }

    #[test]
    fn test_same_version_republish_is_applied() {
        let mut doc = doc_at(1);
        assert_eq!(doc.apply(Some(1), vec![diag("a")]), Ok(true));
        assert_eq!(doc.apply(Some(1), vec![diag("a"), diag("b")]), Ok(true));
        assert_eq!(doc.diagnostics.as_ref().unwrap().items.len(), 2);
    }

    #[test]
    fn test_diagnostics_ahead_of_content_are_rejected() {
        let mut doc = doc_at(1);
        assert_eq!(
            doc.apply(Some(5), vec![diag("future")]),
            Err(Discard::AheadOfContent {
                version: 5,
                current: 1
            })
        );
        assert_eq!(doc.diagnostics_version(), None);
    }

    #[test]
    fn test_missing_version_uses_last_sent() {
        let mut doc = doc_at(4);
        doc.current = 5; // change recorded but not yet on the wire
        assert_eq!(doc.apply(None, vec![diag("x")]), Ok(true));
        assert_eq!(doc.diagnostics_version(), Some(4));
    }

    #[test]
    fn test_closed_document_discards() {
        let mut doc = doc_at(0);
        doc.closed = true;
        assert_eq!(doc.apply(Some(0), vec![diag("x")]), Err(Discard::Closed));
        assert!(doc.check_version(1).is_err());
    }

    #[test]
    fn test_empty_to_empty_is_not_a_visible_change() {
        let mut doc = doc_at(0);
        assert_eq!(doc.apply(Some(0), vec![]), Ok(false));
        assert_eq!(doc.apply(Some(0), vec![diag("x")]), Ok(true));
        assert_eq!(doc.apply(Some(0), vec![]), Ok(true));
        assert!(!doc.clear_diagnostics());
    }

    #[test]
    fn test_retained_version_never_exceeds_current() {
        let mut doc = doc_at(0);
        for (current, published) in [(1, 0), (2, 2), (3, 1), (5, 4), (6, 7), (7, 7)] {
            doc.current = current;
            doc.last_sent = current;
            let _ = doc.apply(Some(published), vec![diag("x")]);
            if let Some(applied) = doc.diagnostics_version() {
                assert!(applied <= doc.current);
            }
        }
        assert_eq!(doc.diagnostics_version(), Some(7));
    }
}
