//! Line-delimited JSON editor protocol.
//!
//! Each stdin line is one [`Input`]. Document events are applied in the order
//! they arrive; commands run concurrently and answer with a `reply` line
//! carrying the command's `id`. Every [`EditorEvent`] is written to stdout as
//! its own line.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_lsp::{BridgeError, EditorCommand, EditorEvent, MessageSeverity, Session};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    Open {
        uri: String,
        text: String,
    },
    Change {
        uri: String,
        text: String,
        version: i32,
    },
    Close {
        uri: String,
    },
    Save {
        uri: String,
    },
    Command(CommandInput),
    Shutdown,
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct CommandInput {
    pub id: Value,
    #[serde(flatten)]
    pub command: EditorCommand,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum Output {
    Reply {
        id: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ReplyError>,
    },
}

#[derive(Debug, Serialize)]
struct ReplyError {
    message: String,
    /// The session is gone; retrying won't help.
    fatal: bool,
}

impl Output {
    fn reply(id: Value, outcome: Result<Value, BridgeError>) -> Self {
        match outcome {
            Ok(result) => Output::Reply {
                id,
                result: Some(result),
                error: None,
            },
            Err(err) => Output::Reply {
                id,
                result: None,
                error: Some(ReplyError {
                    message: err.to_string(),
                    fatal: err.is_session_fatal(),
                }),
            },
        }
    }
}

/// How the driver loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Input ended or the editor asked for shutdown.
    Finished,
    /// The language server went away.
    ServerUnavailable,
}

pub fn parse_input(line: &str) -> Result<Input> {
    serde_json::from_str(line).with_context(|| format!("invalid input line: {line}"))
}

/// Run until input ends, the editor sends `shutdown`, or the server is lost.
pub async fn run<R, W>(
    session: Session,
    mut events: mpsc::Receiver<EditorEvent>,
    input: R,
    output: W,
) -> Result<Outcome>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel::<String>(OUTPUT_CHANNEL_CAPACITY);
    let writer = tokio::spawn(write_lines(out_rx, output));
    let session = Arc::new(session);
    let mut commands = JoinSet::new();
    let mut lines = input.lines();

    let outcome = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break Outcome::ServerUnavailable;
                };
                let unavailable = matches!(event, EditorEvent::ServerUnavailable { .. });
                emit(&out_tx, &event).await;
                if unavailable {
                    break Outcome::ServerUnavailable;
                }
            }
            line = lines.next_line() => {
                let line = line.context("reading editor input")?;
                let Some(line) = line else {
                    tracing::info!("Editor input closed");
                    break Outcome::Finished;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_input(&line) {
                    Ok(Input::Shutdown) => break Outcome::Finished,
                    Ok(Input::Command(CommandInput { id, command })) => {
                        let session = Arc::clone(&session);
                        let out_tx = out_tx.clone();
                        commands.spawn(async move {
                            let outcome = session.invoke(command).await;
                            emit(&out_tx, &Output::reply(id, outcome)).await;
                        });
                    }
                    Ok(event) => {
                        if let Err(e) = apply(&session, event).await {
                            tracing::warn!("{e}");
                            let notice = EditorEvent::LogMessage {
                                severity: MessageSeverity::Error,
                                text: e.to_string(),
                                show: false,
                            };
                            emit(&out_tx, &notice).await;
                        }
                    }
                    Err(e) => tracing::warn!("{e:#}"),
                }
            }
            Some(joined) = commands.join_next(), if !commands.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!("Command task failed: {e}");
                }
            }
        }
    };

    // Dropped commands cancel their requests.
    commands.shutdown().await;
    match Arc::try_unwrap(session) {
        Ok(session) if outcome == Outcome::Finished => session.shutdown().await,
        Ok(_) => {}
        Err(_) => tracing::warn!("Session still shared at exit"),
    }

    drop(out_tx);
    writer.await.context("stdout writer task")??;
    Ok(outcome)
}

async fn apply(session: &Session, input: Input) -> Result<(), BridgeError> {
    match input {
        Input::Open { uri, text } => session.open(&uri, text).await,
        Input::Change { uri, text, version } => session.change(&uri, text, version).await,
        Input::Close { uri } => session.close(&uri).await,
        Input::Save { uri } => session.save(&uri).await,
        Input::Command(_) | Input::Shutdown => Ok(()),
    }
}

async fn emit<T: Serialize>(out_tx: &mpsc::Sender<String>, value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => {
            if out_tx.send(line).await.is_err() {
                tracing::debug!("Output closed");
            }
        }
        Err(e) => tracing::warn!("Cannot serialize output: {e}"),
    }
}

async fn write_lines<W>(mut rx: mpsc::Receiver<String>, mut output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}
