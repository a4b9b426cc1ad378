//! Session - the editor-facing handle to one language server.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{BridgeConfig, CallClass, Timeouts};
use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, Result};
use crate::handlers::EditorSink;
use crate::protocol;
use crate::transport::{Transport, TransportReceiver};
use crate::types::{DiagnosticsSnapshot, EditorCommand, EditorEvent};

/// A live connection to one language server.
///
/// Every method may be called concurrently from any number of tasks. Events
/// produced by the server arrive on the channel given at construction.
pub struct Session {
    dispatcher: Arc<Dispatcher>,
    inbound: JoinHandle<()>,
    capabilities: Value,
    timeouts: Timeouts,
}

impl Session {
    /// Spawn (or connect to) the configured server and run the initialize
    /// handshake.
    pub async fn start(config: BridgeConfig, events: mpsc::Sender<EditorEvent>) -> Result<Self> {
        let root = match &config.server.root {
            Some(root) => root.clone(),
            None => std::env::current_dir().map_err(|e| BridgeError::Spawn {
                command: config.server.command.clone(),
                reason: format!("cannot determine workspace root: {e}"),
            })?,
        };
        let root_uri = protocol::path_to_file_uri(&root)?;

        let (transport, receiver) = match &config.server.socket {
            Some(address) => Transport::connect(address).await?,
            None => Transport::spawn(&config.server, &root)?,
        };
        Self::establish(transport, receiver, &config, &root_uri, events).await
    }

    /// Run a session over an already-connected byte stream.
    pub async fn from_io<R, W>(
        reader: R,
        writer: W,
        config: BridgeConfig,
        root_uri: &str,
        events: mpsc::Sender<EditorEvent>,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (transport, receiver) = Transport::from_io(reader, writer);
        Self::establish(transport, receiver, &config, root_uri, events).await
    }

    async fn establish(
        transport: Transport,
        receiver: TransportReceiver,
        config: &BridgeConfig,
        root_uri: &str,
        events: mpsc::Sender<EditorEvent>,
    ) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(transport, config, EditorSink::new(events)));
        let inbound = tokio::spawn(Arc::clone(&dispatcher).run_inbound(receiver));

        match initialize(&dispatcher, root_uri, &config.timeouts).await {
            Ok(capabilities) => {
                tracing::info!(root = %root_uri, "Language server initialized");
                Ok(Self {
                    dispatcher,
                    inbound,
                    capabilities,
                    timeouts: config.timeouts.clone(),
                })
            }
            Err(e) => {
                tracing::warn!("Language server initialization failed: {e}");
                // The caller learns from the error; no unavailable event.
                dispatcher.begin_shutdown();
                dispatcher.teardown("initialization failed").await;
                inbound.abort();
                Err(e)
            }
        }
    }

    /// The `capabilities` object from the server's initialize result.
    #[must_use]
    pub fn server_capabilities(&self) -> &Value {
        &self.capabilities
    }

    /// Whether the session can still reach the server.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.dispatcher.is_torn_down()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(BridgeError::TransportClosed)
        }
    }

    /// The editor opened `uri` with `text`; the document starts at version 0.
    pub async fn open(&self, uri: &str, text: impl Into<String>) -> Result<()> {
        let uri = protocol::canonical_uri(uri)?;
        self.ensure_alive()?;
        self.dispatcher.did_open(uri, text.into()).await
    }

    /// The editor changed `uri` to `text` at `version`, which must be newer
    /// than the current version.
    pub async fn change(&self, uri: &str, text: impl Into<String>, version: i32) -> Result<()> {
        let uri = protocol::canonical_uri(uri)?;
        self.ensure_alive()?;
        self.dispatcher.did_change(&uri, text.into(), version).await
    }

    /// The editor closed `uri`. Its diagnostics are cleared.
    pub async fn close(&self, uri: &str) -> Result<()> {
        let uri = protocol::canonical_uri(uri)?;
        self.ensure_alive()?;
        self.dispatcher.did_close(&uri).await
    }

    /// The editor saved `uri`.
    pub async fn save(&self, uri: &str) -> Result<()> {
        let uri = protocol::canonical_uri(uri)?;
        self.ensure_alive()?;
        self.dispatcher.did_save(&uri).await
    }

    /// Run a user command and return the server's result.
    ///
    /// Errors carry the command name. Dropping the returned future cancels
    /// the request on the server.
    pub async fn invoke(&self, command: EditorCommand) -> Result<Value> {
        let name = command.name();
        self.run_command(command)
            .await
            .map_err(|e| e.in_command(name))
    }

    async fn run_command(&self, mut command: EditorCommand) -> Result<Value> {
        self.ensure_alive()?;
        let timeout = self.timeouts.for_class(command.call_class());
        let document = match command.uri_mut() {
            Some(uri) => {
                *uri = protocol::canonical_uri(uri)?;
                Some(uri.clone())
            }
            None => None,
        };
        let (method, params) = protocol::command_request(&command);
        match document {
            Some(uri) => {
                self.dispatcher
                    .request_for_document(&uri, method, Some(params), timeout)
                    .await
            }
            None => self.dispatcher.request(method, Some(params), timeout).await,
        }
    }

    /// Send an arbitrary request, bounded by the timeout for `class`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        class: CallClass,
    ) -> Result<Value> {
        self.ensure_alive()?;
        self.dispatcher
            .request(method, params, self.timeouts.for_class(class))
            .await
    }

    /// Diagnostics currently retained for all open documents.
    pub async fn snapshot(&self) -> DiagnosticsSnapshot {
        self.dispatcher.snapshot().await
    }

    /// Shut the server down: `shutdown`, `exit`, then close the connection.
    ///
    /// Pending requests fail and all diagnostics are cleared. No
    /// `ServerUnavailable` event is emitted.
    pub async fn shutdown(mut self) {
        self.dispatcher.begin_shutdown();
        if self.is_alive() {
            match self
                .dispatcher
                .request(protocol::SHUTDOWN, None, self.timeouts.shutdown())
                .await
            {
                Ok(_) => {
                    if let Err(e) = self.dispatcher.notify(protocol::EXIT, None).await {
                        tracing::debug!("Failed to send exit: {e}");
                    }
                }
                Err(e) => tracing::debug!("Shutdown request failed: {e}"),
            }
        }
        self.dispatcher.teardown("shutdown requested").await;
        if tokio::time::timeout(self.timeouts.shutdown(), &mut self.inbound)
            .await
            .is_err()
        {
            tracing::debug!("Inbound loop didn't stop in time");
        }
    }
}

/// Send `initialize`, then `initialized`. Returns the server capabilities.
async fn initialize(dispatcher: &Dispatcher, root_uri: &str, timeouts: &Timeouts) -> Result<Value> {
    let result = dispatcher
        .request(
            protocol::INITIALIZE,
            Some(protocol::initialize_params(root_uri)),
            timeouts.init(),
        )
        .await?;
    dispatcher.notify(protocol::INITIALIZED, Some(json!({}))).await?;
    Ok(result.get("capabilities").cloned().unwrap_or(Value::Null))
}

impl Drop for Session {
    fn drop(&mut self) {
        // Without the inbound loop the dispatcher is released, which closes
        // the writer and kills a spawned server.
        self.inbound.abort();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("alive", &self.is_alive())
            .field("outstanding", &self.dispatcher.outstanding_requests())
            .finish_non_exhaustive()
    }
}

