//! Transport - owns the byte stream to the language server.
//!
//! Outbound frames go through a single writer task, so two concurrent sends
//! can never interleave on the wire. Inbound frames are read by the one
//! [`TransportReceiver`], which the dispatcher's inbound loop owns.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};

const WRITER_CHANNEL_CAPACITY: usize = 64;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

enum WriterCommand {
    Send(Vec<u8>),
    Shutdown,
}

/// Sending half of the connection. Shared by every outbound caller.
pub struct Transport {
    writer_tx: mpsc::Sender<WriterCommand>,
    closed: AtomicBool,
    child: Mutex<Option<Child>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Receiving half of the connection.
pub struct TransportReceiver {
    reader: FrameReader<BoxedReader>,
    closed: bool,
}

impl Transport {
    /// Wrap an already-connected byte stream.
    pub fn from_io<R, W>(reader: R, writer: W) -> (Self, TransportReceiver)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::assemble(Box::new(reader), writer, None)
    }

    /// Spawn the configured server as a child process speaking on stdio.
    pub fn spawn(config: &ServerConfig, root: &Path) -> Result<(Self, TransportReceiver)> {
        let spawn_err = |reason: String| BridgeError::Spawn {
            command: config.command.clone(),
            reason,
        };

        let resolved = which::which(&config.command)
            .map_err(|e| spawn_err(format!("not found in PATH: {e}")))?;
        let mut cmd = Command::new(&resolved);
        cmd.args(&config.args)
            .envs(&config.env)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| spawn_err(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("failed to capture stdout".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("failed to capture stdin".into()))?;

        tracing::info!(
            command = %resolved.display(),
            pid = child.id(),
            "Spawned language server"
        );
        Ok(Self::assemble(Box::new(stdout), stdin, Some(child)))
    }

    /// Connect to a server listening on `host:port`, or `unix:/path` on unix.
    pub async fn connect(address: &str) -> Result<(Self, TransportReceiver)> {
        let connect_err = |e: std::io::Error| BridgeError::Spawn {
            command: address.to_string(),
            reason: e.to_string(),
        };

        if let Some(path) = address.strip_prefix("unix:") {
            return Self::connect_unix(path).await;
        }

        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(connect_err)?;
        let (read, write) = stream.into_split();
        tracing::info!(address = %address, "Connected to language server");
        Ok(Self::assemble(Box::new(read), write, None))
    }

    #[cfg(unix)]
    async fn connect_unix(path: &str) -> Result<(Self, TransportReceiver)> {
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| BridgeError::Spawn {
                command: format!("unix:{path}"),
                reason: e.to_string(),
            })?;
        let (read, write) = stream.into_split();
        tracing::info!(socket = %path, "Connected to language server");
        Ok(Self::assemble(Box::new(read), write, None))
    }

    #[cfg(not(unix))]
    async fn connect_unix(path: &str) -> Result<(Self, TransportReceiver)> {
        Err(BridgeError::Spawn {
            command: format!("unix:{path}"),
            reason: "unix sockets are not supported on this platform".to_string(),
        })
    }

    fn assemble<W>(
        reader: BoxedReader,
        writer: W,
        child: Option<Child>,
    ) -> (Self, TransportReceiver)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("Language server write error: {e:#}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        let transport = Self {
            writer_tx,
            closed: AtomicBool::new(false),
            child: Mutex::new(child),
            writer_handle: Mutex::new(Some(writer_handle)),
        };
        let receiver = TransportReceiver {
            reader: FrameReader::new(reader),
            closed: false,
        };
        (transport, receiver)
    }

    /// Queue one encoded body for writing.
    ///
    /// Bodies are written whole and in the order `send` was called.
    pub async fn send(&self, body: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::TransportClosed);
        }
        self.writer_tx
            .send(WriterCommand::Send(body))
            .await
            .map_err(|_| BridgeError::TransportClosed)
    }

    /// Non-blocking send for best-effort traffic from synchronous contexts.
    pub fn try_send(&self, body: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::TransportClosed);
        }
        self.writer_tx
            .try_send(WriterCommand::Send(body))
            .map_err(|_| BridgeError::TransportClosed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.writer_tx.is_closed()
    }

    /// Close the connection. Idempotent.
    ///
    /// Frames already queued are flushed first. A child process gets `grace`
    /// to exit on its own before it is killed.
    pub async fn close(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = tokio::time::timeout(grace, self.writer_tx.send(WriterCommand::Shutdown)).await;
        if let Some(mut handle) = self.writer_handle.lock().await.take()
            && tokio::time::timeout(grace, &mut handle).await.is_err()
        {
            handle.abort();
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "Language server exited"),
            Ok(Err(e)) => tracing::warn!("Waiting for language server failed: {e}"),
            Err(_) => {
                tracing::debug!("Language server didn't exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}

impl TransportReceiver {
    /// Next frame body in wire order.
    ///
    /// EOF and unrecoverable framing errors both end the stream; from then on
    /// every call returns [`BridgeError::TransportClosed`].
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        if self.closed {
            return Err(BridgeError::TransportClosed);
        }
        match self.reader.read_frame().await {
            Ok(Some(body)) => Ok(body),
            Ok(None) => {
                tracing::info!("Language server closed its output");
                self.closed = true;
                Err(BridgeError::TransportClosed)
            }
            Err(e) => {
                tracing::warn!("Language server stream failed: {e:#}");
                self.closed = true;
                Err(BridgeError::TransportClosed)
            }
        }
    }
}
