//! JSON-RPC framing and message codec.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over a byte stream.
//! [`FrameReader`] and [`FrameWriter`] move opaque frame bodies; [`encode`]
//! and [`decode`] turn bodies into [`Message`]s and back. Keeping the two
//! apart lets a bad body be skipped without losing the stream position.

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{BridgeError, Result};

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes the bridge produces itself.
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Reads framed bodies from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next frame body.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// Returns `Err` on malformed headers, oversized frames or EOF inside a
    /// frame; the stream cannot be resynchronized after that.
    pub async fn read_frame(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            bail!("Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}");
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;
        Ok(Some(body))
    }

    /// Parse headers until the empty line separator.
    async fn read_headers(&mut self) -> anyhow::Result<Option<usize>> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .context("reading header line")?;

            if bytes_read == 0 {
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                bail!("unexpected EOF while reading headers");
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case("Content-Length")
            {
                let len: usize = value
                    .trim()
                    .parse()
                    .context("invalid Content-Length value")?;
                content_length = Some(len);
            }
        }

        match content_length {
            Some(len) => Ok(Some(len)),
            None => bail!("missing Content-Length header"),
        }
    }
}

/// Writes framed bodies to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one body with its `Content-Length` header and flush.
    pub async fn write_frame(&mut self, body: &[u8]) -> anyhow::Result<()> {
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.writer
            .write_all(header.as_bytes())
            .await
            .context("writing frame header")?;
        self.writer
            .write_all(body)
            .await
            .context("writing frame body")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }
}

/// A JSON-RPC request id. The bridge only issues numbers; servers may use
/// strings for their own requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<ResponseError> for BridgeError {
    fn from(err: ResponseError) -> Self {
        Self::Application {
            code: err.code,
            message: err.message,
        }
    }
}

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        outcome: std::result::Result<Value, ResponseError>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Message {
    #[must_use]
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            id: RequestId::Number(id),
            method: method.into(),
            params,
        }
    }

    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request { id, method, params } => {
                obj.insert("id".into(), id_value(id));
                obj.insert("method".into(), Value::from(method.as_str()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                obj.insert("id".into(), id_value(id));
                match outcome {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        obj.insert("error".into(), serde_json::json!(error));
                    }
                }
            }
            Self::Notification { method, params } => {
                obj.insert("method".into(), Value::from(method.as_str()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
            }
        }
        Value::Object(obj)
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::from(s.as_str()),
    }
}

/// Encode a message as a frame body.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    serde_json::to_vec(&message.to_value()).map_err(|e| BridgeError::Encoding(e.to_string()))
}

/// Decode one frame body.
///
/// id + method is a request, id + result/error is a response, method alone is
/// a notification. Anything else is [`BridgeError::MalformedMessage`].
pub fn decode(body: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| BridgeError::MalformedMessage(format!("invalid JSON: {e}")))?;
    let Value::Object(mut obj) = value else {
        return Err(BridgeError::MalformedMessage(
            "message is not a JSON object".to_string(),
        ));
    };

    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            serde_json::from_value::<RequestId>(raw)
                .map_err(|_| BridgeError::MalformedMessage("id must be a number or string".into()))?,
        ),
    };
    let method = match obj.remove("method") {
        None => None,
        Some(Value::String(m)) => Some(m),
        Some(_) => {
            return Err(BridgeError::MalformedMessage(
                "method must be a string".to_string(),
            ));
        }
    };
    let params = obj.remove("params");
    let result = obj.remove("result");
    let error = obj.remove("error");

    match (id, method) {
        (Some(id), Some(method)) => Ok(Message::Request { id, method, params }),
        (None, Some(method)) => Ok(Message::Notification { method, params }),
        (Some(id), None) => {
            let outcome = match (result, error) {
                (_, Some(error)) => Err(serde_json::from_value::<ResponseError>(error)
                    .map_err(|e| BridgeError::MalformedMessage(format!("invalid error object: {e}")))?),
                (Some(result), None) => Ok(result),
                (None, None) => {
                    return Err(BridgeError::MalformedMessage(format!(
                        "message {id} has neither method, result nor error"
                    )));
                }
            };
            Ok(Message::Response { id, outcome })
        }
        (None, None) => Err(BridgeError::MalformedMessage(
            "message has neither id nor method".to_string(),
        )),
    }
}
