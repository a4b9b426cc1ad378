//! Dispatcher - the single routing point for inbound and outbound traffic.
//!
//! One task runs [`Dispatcher::run_inbound`] for the session lifetime.
//! Responses complete pending requests, server requests are answered on the
//! spot, and diagnostics publications are handed to a per-document lane: one
//! task per document applies its publications in receipt order, while a
//! semaphore bounds how many documents are being applied at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};

use crate::codec::{self, Message, RequestId};
use crate::config::BridgeConfig;
use crate::document::{self, DocumentHandle, DocumentStore};
use crate::error::{BridgeError, Result};
use crate::handlers::{self, DiagnosticsPublication, EditorSink, NotificationKind};
use crate::protocol;
use crate::tracker::{RequestTracker, Ticket};
use crate::transport::{Transport, TransportReceiver};
use crate::types::{DiagnosticsSnapshot, EditorEvent};

/// Encode and send one notification.
pub(crate) async fn notify(transport: &Transport, method: &str, params: Value) -> Result<()> {
    let body = codec::encode(&Message::notification(method, Some(params)))?;
    transport.send(body).await
}

struct LaneJob {
    handle: DocumentHandle,
    publication: DiagnosticsPublication,
}

/// The lane serving one open document.
struct Lane {
    handle: DocumentHandle,
    tx: mpsc::UnboundedSender<LaneJob>,
}

/// Per-document diagnostics lanes.
struct Lanes {
    lanes: StdMutex<HashMap<String, Lane>>,
    permits: Arc<Semaphore>,
}

impl Lanes {
    fn new(concurrency: usize) -> Self {
        Self {
            lanes: StdMutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a publication behind earlier ones for the same document.
    ///
    /// A reopened document gets a fresh lane; the old one drains into its
    /// closed handle.
    fn dispatch(&self, uri: String, job: LaneJob, sink: &EditorSink) {
        let mut lanes = self.lock();
        let job = match lanes.get(&uri) {
            Some(lane) if Arc::ptr_eq(&lane.handle, &job.handle) => match lane.tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            _ => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::clone(&job.handle);
        // A fresh channel's receiver is alive; the job is queued.
        let _ = tx.send(job);
        tokio::spawn(run_lane(
            uri.clone(),
            rx,
            sink.clone(),
            Arc::clone(&self.permits),
        ));
        lanes.insert(uri, Lane { handle, tx });
    }

    /// Stop accepting work for `handle`. Queued jobs still drain.
    fn close(&self, uri: &str, handle: &DocumentHandle) {
        let mut lanes = self.lock();
        if lanes
            .get(uri)
            .is_some_and(|lane| Arc::ptr_eq(&lane.handle, handle))
        {
            lanes.remove(uri);
        }
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

async fn run_lane(
    uri: String,
    mut rx: mpsc::UnboundedReceiver<LaneJob>,
    sink: EditorSink,
    permits: Arc<Semaphore>,
) {
    while let Some(job) = rx.recv().await {
        let Ok(_permit) = permits.acquire().await else {
            break;
        };
        let DiagnosticsPublication { version, items, .. } = job.publication;
        document::apply_diagnostics(&job.handle, &uri, version, items, &sink).await;
    }
    tracing::trace!(uri = %uri, "Diagnostics lane finished");
}

/// A request on the wire. Dropping it before completion cancels it.
struct InFlight<'a> {
    dispatcher: &'a Dispatcher,
    ticket: Ticket,
    armed: bool,
}

impl InFlight<'_> {
    async fn finish(mut self, timeout: Duration) -> Result<Value> {
        let result = self
            .dispatcher
            .tracker
            .wait(&mut self.ticket, timeout)
            .await;
        self.armed = false;
        if matches!(result, Err(BridgeError::RequestTimeout { .. })) {
            self.dispatcher.send_cancel(self.ticket.id);
        }
        result
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed && self.dispatcher.tracker.cancel(self.ticket.id) {
            tracing::debug!(
                id = self.ticket.id,
                method = %self.ticket.method,
                "Request cancelled by caller"
            );
            self.dispatcher.send_cancel(self.ticket.id);
        }
    }
}

pub(crate) struct Dispatcher {
    transport: Transport,
    tracker: RequestTracker,
    documents: DocumentStore,
    sink: EditorSink,
    lanes: Lanes,
    settings: Value,
    grace: Duration,
    shutdown_requested: AtomicBool,
    torn_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(transport: Transport, config: &BridgeConfig, sink: EditorSink) -> Self {
        Self {
            transport,
            tracker: RequestTracker::new(),
            documents: DocumentStore::new(
                config.server.language_id.clone(),
                config.include_text_on_save,
            ),
            sink,
            lanes: Lanes::new(config.notification_concurrency),
            settings: config.settings.clone(),
            grace: config.timeouts.shutdown(),
            shutdown_requested: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.tracker.outstanding()
    }

    // ── Inbound ────────────────────────────────────────────────────────

    /// Receive, decode and route until the transport fails, then tear the
    /// session down.
    pub async fn run_inbound(self: Arc<Self>, mut receiver: TransportReceiver) {
        loop {
            let body = match receiver.receive().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!("Inbound loop ending: {e}");
                    break;
                }
            };
            match codec::decode(&body) {
                Ok(message) => self.route(message).await,
                Err(e) => tracing::warn!("Skipping inbound message: {e}"),
            }
        }
        self.teardown("language server connection closed").await;
    }

    async fn route(&self, message: Message) {
        match message {
            Message::Response {
                id: RequestId::Number(id),
                outcome,
            } => {
                self.tracker.complete(id, outcome);
            }
            Message::Response { id, .. } => {
                let err = BridgeError::ProtocolViolation(format!(
                    "response for id {id}, which the bridge never issued"
                ));
                tracing::warn!("{err}");
            }
            Message::Notification { method, params } => {
                self.handle_notification(&method, params).await;
            }
            Message::Request { id, method, params } => {
                self.handle_server_request(id, &method, params).await;
            }
        }
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        let Some(kind) = NotificationKind::from_method(method) else {
            tracing::trace!("Ignoring notification: {method}");
            return;
        };
        match kind {
            NotificationKind::PublishDiagnostics => {
                let Some(publication) = handlers::parse_publication(params) else {
                    return;
                };
                let uri = match protocol::canonical_uri(&publication.uri) {
                    Ok(uri) => uri,
                    Err(e) => {
                        let err = BridgeError::ProtocolViolation(format!("publishDiagnostics: {e}"));
                        tracing::warn!("{err}");
                        return;
                    }
                };
                let Some(handle) = self.documents.get(&uri) else {
                    tracing::debug!(uri = %uri, "Dropping diagnostics for document that isn't open");
                    return;
                };
                self.lanes
                    .dispatch(uri, LaneJob { handle, publication }, &self.sink);
            }
            NotificationKind::LogMessage | NotificationKind::ShowMessage => {
                let show = kind == NotificationKind::ShowMessage;
                if let Some(event) = handlers::message_event(params, show) {
                    self.sink.push(event);
                }
            }
            NotificationKind::Progress => {
                if let Some(event) = handlers::progress_event(params) {
                    self.sink.push(event);
                }
            }
        }
    }

    async fn handle_server_request(&self, id: RequestId, method: &str, params: Option<Value>) {
        let (outcome, event) = handlers::answer(method, params, &self.settings);
        if let Some(event) = event {
            self.sink.push(event);
        }
        let reply = Message::Response { id, outcome };
        match codec::encode(&reply) {
            Ok(body) => {
                if let Err(e) = self.transport.send(body).await {
                    tracing::debug!("Cannot answer server request {method}: {e}");
                }
            }
            Err(e) => tracing::warn!("Cannot encode answer to {method}: {e}"),
        }
    }

    // ── Outbound ───────────────────────────────────────────────────────

    async fn start_request(&self, method: &str, params: Option<Value>) -> Result<InFlight<'_>> {
        let ticket = self.tracker.submit(method)?;
        let message = Message::request(ticket.id, method, params);
        let call = InFlight {
            dispatcher: self,
            ticket,
            armed: true,
        };
        // On failure `call` drops and removes the pending entry.
        let body = codec::encode(&message)?;
        self.transport.send(body).await?;
        Ok(call)
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.start_request(method, params)
            .await?
            .finish(timeout)
            .await
    }

    /// Like [`request`](Self::request), but ordered on the wire with the
    /// document's own notifications.
    pub async fn request_for_document(
        &self,
        uri: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let handle = self
            .documents
            .get(uri)
            .ok_or_else(|| BridgeError::DocumentNotOpen(uri.to_string()))?;
        let call = {
            let _doc = handle.lock().await;
            self.start_request(method, params).await?
        };
        call.finish(timeout).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let body = codec::encode(&Message::notification(method, params))?;
        self.transport.send(body).await
    }

    fn send_cancel(&self, id: u64) {
        let message =
            Message::notification(protocol::CANCEL_REQUEST, Some(protocol::cancel_params(id)));
        if let Ok(body) = codec::encode(&message)
            && self.transport.try_send(body).is_err()
        {
            tracing::trace!(id, "Cancellation not sent");
        }
    }

    // ── Editor events ──────────────────────────────────────────────────

    pub async fn did_open(&self, uri: String, text: String) -> Result<()> {
        self.documents.on_open(&self.transport, uri, text).await
    }

    pub async fn did_change(&self, uri: &str, text: String, version: i32) -> Result<()> {
        self.documents
            .on_change(&self.transport, uri, text, version)
            .await
    }

    pub async fn did_close(&self, uri: &str) -> Result<()> {
        let handle = self.documents.get(uri);
        let result = self
            .documents
            .on_close(&self.transport, uri, &self.sink)
            .await;
        if let Some(handle) = handle {
            self.lanes.close(uri, &handle);
        }
        result
    }

    pub async fn did_save(&self, uri: &str) -> Result<()> {
        self.documents.on_save(&self.transport, uri).await
    }

    pub async fn snapshot(&self) -> DiagnosticsSnapshot {
        self.documents.snapshot().await
    }

    // ── Teardown ───────────────────────────────────────────────────────

    /// Mark the coming teardown as requested by the editor, so it is not
    /// reported as the server becoming unavailable.
    pub fn begin_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    /// Fail pending requests, clear all diagnostics and close the transport.
    /// Runs once; later calls return immediately.
    pub async fn teardown(&self, reason: &str) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let failed = self.tracker.fail_all();
        self.lanes.clear();
        self.documents.clear_all(&self.sink).await;
        self.transport.close(self.grace).await;

        if self.shutdown_requested.load(Ordering::Acquire) {
            tracing::info!("Session shut down");
        } else {
            tracing::warn!(failed, reason, "Language server unavailable");
            self.sink.push(EditorEvent::ServerUnavailable {
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::codec::{FrameReader, FrameWriter};

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        receiver: Option<TransportReceiver>,
        server_reader: FrameReader<ReadHalf<DuplexStream>>,
        server_writer: FrameWriter<WriteHalf<DuplexStream>>,
        events: mpsc::Receiver<EditorEvent>,
    }

    fn harness() -> Harness {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let (transport, receiver) = Transport::from_io(client_read, client_write);
        let (events_tx, events) = mpsc::channel(32);
        let config = BridgeConfig {
            settings: json!({ "gopls": { "staticcheck": true } }),
            ..BridgeConfig::default()
        };
        Harness {
            dispatcher: Arc::new(Dispatcher::new(
                transport,
                &config,
                EditorSink::new(events_tx),
            )),
            receiver: Some(receiver),
            server_reader: FrameReader::new(server_read),
            server_writer: FrameWriter::new(server_write),
            events,
        }
    }

    impl Harness {
        async fn next_from_client(&mut self) -> Message {
            let body = self.server_reader.read_frame().await.unwrap().unwrap();
            codec::decode(&body).unwrap()
        }

        async fn next_method(&mut self) -> String {
            match self.next_from_client().await {
                Message::Request { method, .. } | Message::Notification { method, .. } => method,
                other @ Message::Response { .. } => panic!("unexpected {other:?}"),
            }
        }
    }

    const DOC: &str = "file:///main.go";

    /// Let spawned tasks run until they block.
    async fn settle() {
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_response_completes_request() {
        let mut h = harness();
        let dispatcher = Arc::clone(&h.dispatcher);
        let call = tokio::spawn(async move {
            dispatcher
                .request("textDocument/hover", Some(json!({})), Duration::from_secs(5))
                .await
        });

        let Message::Request { id, method, .. } = h.next_from_client().await else {
            panic!("expected request");
        };
        assert_eq!(method, "textDocument/hover");
        h.dispatcher
            .route(Message::Response {
                id,
                outcome: Ok(json!({ "contents": "func main()" })),
            })
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["contents"], "func main()");
        assert_eq!(h.dispatcher.outstanding_requests(), 0);
    }

    #[tokio::test]
    async fn test_unknown_response_is_ignored() {
        let h = harness();
        h.dispatcher
            .route(Message::Response {
                id: RequestId::Number(999),
                outcome: Ok(Value::Null),
            })
            .await;
        h.dispatcher
            .route(Message::Response {
                id: RequestId::String("nope".into()),
                outcome: Ok(Value::Null),
            })
            .await;
        assert_eq!(h.dispatcher.outstanding_requests(), 0);
        assert!(!h.dispatcher.is_torn_down());
    }

    #[tokio::test]
    async fn test_server_request_is_answered() {
        let mut h = harness();
        h.dispatcher
            .route(Message::Request {
                id: RequestId::Number(5),
                method: "workspace/configuration".into(),
                params: Some(json!({ "items": [{ "section": "gopls" }] })),
            })
            .await;
        let reply = h.next_from_client().await;
        assert_eq!(
            reply,
            Message::Response {
                id: RequestId::Number(5),
                outcome: Ok(json!([{ "staticcheck": true }])),
            }
        );

        h.dispatcher
            .route(Message::Request {
                id: RequestId::String("x".into()),
                method: "workspace/applyEdit".into(),
                params: None,
            })
            .await;
        let Message::Response { outcome, .. } = h.next_from_client().await else {
            panic!("expected response");
        };
        assert_eq!(outcome.unwrap_err().code, codec::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_log_message_reaches_editor() {
        let mut h = harness();
        h.dispatcher
            .route(Message::notification(
                "window/logMessage",
                Some(json!({ "type": 3, "message": "Loading packages..." })),
            ))
            .await;
        assert!(matches!(
            h.events.recv().await.unwrap(),
            EditorEvent::LogMessage { ref text, show: false, .. } if text == "Loading packages..."
        ));
    }

    #[tokio::test]
    async fn test_diagnostics_for_unopened_document_are_dropped() {
        let mut h = harness();
        h.dispatcher
            .route(Message::notification(
                "textDocument/publishDiagnostics",
                Some(json!({ "uri": "file:///nowhere.go", "version": 0, "diagnostics": [] })),
            ))
            .await;
        tokio::task::yield_now().await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_request_sends_cancel_notification() {
        let mut h = harness();
        let dispatcher = Arc::clone(&h.dispatcher);
        let call = tokio::spawn(async move {
            dispatcher
                .request("textDocument/references", None, Duration::from_secs(30))
                .await
        });

        let Message::Request {
            id: RequestId::Number(id),
            ..
        } = h.next_from_client().await
        else {
            panic!("expected request");
        };
        call.abort();
        let _ = call.await;

        assert_eq!(
            h.next_from_client().await,
            Message::notification("$/cancelRequest", Some(json!({ "id": id })))
        );
        assert_eq!(h.dispatcher.outstanding_requests(), 0);
        // The late answer is unmatched.
        assert!(!h.dispatcher.tracker.complete(id, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_malformed_input_does_not_stop_loop_and_eof_tears_down() {
        let mut h = harness();
        let receiver = h.receiver.take().unwrap();
        let inbound = tokio::spawn(Arc::clone(&h.dispatcher).run_inbound(receiver));

        h.server_writer.write_frame(b"{ not json").await.unwrap();
        h.server_writer
            .write_frame(br#"{"jsonrpc":"2.0","method":"window/showMessage","params":{"type":1,"message":"boom"}}"#)
            .await
            .unwrap();
        assert!(matches!(
            h.events.recv().await.unwrap(),
            EditorEvent::LogMessage { show: true, .. }
        ));

        drop(h.server_writer);
        drop(h.server_reader);
        inbound.await.unwrap();
        assert!(h.dispatcher.is_torn_down());
        assert!(matches!(
            h.events.recv().await.unwrap(),
            EditorEvent::ServerUnavailable { .. }
        ));
        assert!(matches!(
            h.dispatcher.request("x", None, Duration::from_secs(1)).await,
            Err(BridgeError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_reopen_waits_for_pending_close() {
        let mut h = harness();
        h.dispatcher
            .did_open(DOC.to_string(), "package main".to_string())
            .await
            .unwrap();
        assert_eq!(h.next_method().await, "textDocument/didOpen");

        let handle = h.dispatcher.documents.get(DOC).unwrap();
        let busy = handle.lock().await;
        let close = tokio::spawn({
            let dispatcher = Arc::clone(&h.dispatcher);
            async move { dispatcher.did_close(DOC).await }
        });
        settle().await;
        let reopen = tokio::spawn({
            let dispatcher = Arc::clone(&h.dispatcher);
            async move {
                dispatcher
                    .did_open(DOC.to_string(), "package main // again".to_string())
                    .await
            }
        });
        settle().await;
        drop(busy);

        close.await.unwrap().unwrap();
        reopen.await.unwrap().unwrap();
        assert_eq!(h.next_method().await, "textDocument/didClose");
        assert_eq!(h.next_method().await, "textDocument/didOpen");

        h.dispatcher
            .did_change(DOC, "package main\n".to_string(), 1)
            .await
            .unwrap();
        assert_eq!(h.next_method().await, "textDocument/didChange");
    }

    #[tokio::test]
    async fn test_document_request_is_ordered_after_pending_change() {
        let mut h = harness();
        h.dispatcher
            .did_open(DOC.to_string(), "package main".to_string())
            .await
            .unwrap();
        h.next_from_client().await;

        let handle = h.dispatcher.documents.get(DOC).unwrap();
        let busy = handle.lock().await;
        let change = tokio::spawn({
            let dispatcher = Arc::clone(&h.dispatcher);
            async move {
                dispatcher
                    .did_change(DOC, "package main\nfunc f() {}".to_string(), 1)
                    .await
            }
        });
        settle().await;
        let hover = tokio::spawn({
            let dispatcher = Arc::clone(&h.dispatcher);
            async move {
                dispatcher
                    .request_for_document(
                        DOC,
                        "textDocument/hover",
                        Some(json!({})),
                        Duration::from_secs(30),
                    )
                    .await
            }
        });
        settle().await;
        drop(busy);

        change.await.unwrap().unwrap();
        let Message::Notification { method, params } = h.next_from_client().await else {
            panic!("expected didChange first");
        };
        assert_eq!(method, "textDocument/didChange");
        assert_eq!(params.unwrap()["textDocument"]["version"], 1);
        assert_eq!(h.next_method().await, "textDocument/hover");
        hover.abort();
    }

    #[tokio::test]
    async fn test_failed_open_is_not_retained() {
        let h = harness();
        h.dispatcher.transport.close(Duration::from_millis(10)).await;

        assert!(matches!(
            h.dispatcher
                .did_open(DOC.to_string(), "package main".to_string())
                .await,
            Err(BridgeError::TransportClosed)
        ));
        assert!(h.dispatcher.documents.get(DOC).is_none());
        assert!(h.dispatcher.snapshot().await.is_empty());
    }
}
