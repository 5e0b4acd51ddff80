//! JSON-RPC framing and message types.
//!
//! Inbound bytes are split on `Content-Length` frames; unknown header
//! lines are tolerated and `Content-Type` is ignored. Outbound messages
//! are assembled (header + payload) into one buffer and written with a
//! single call so a cancelled task can never leak half a frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("missing Content-Length header")]
    MissingLength,
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

/// A request id: number or string, echoed verbatim in the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

/// Standard JSON-RPC / LSP error codes the dispatcher maps failures to.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
    pub const REQUEST_CANCELLED: i64 = -32800;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Option<Value>,
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    pub fn err(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self { id, result: None, error: Some(ResponseError { code, message: message.into() }) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

/// The wire shape; classification into [`Message`] happens after parsing.
#[derive(Debug, Serialize, Deserialize)]
struct RawMessage {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default, deserialize_with = "deserialize_present_value")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ResponseError>,
}

/// A present `"result": null` must deserialize to `Some(Value::Null)`, not
/// `None` (which serde's default `Option<T>` impl would give it) — `null`
/// is the canonical empty JSON-RPC result and is distinct from the field
/// being absent entirely.
fn deserialize_present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Message {
    pub fn from_json(payload: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_slice(payload)?;
        Ok(match (raw.id, raw.method) {
            (Some(id), Some(method)) => Message::Request(Request {
                id,
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            (None, Some(method)) => Message::Notification(Notification {
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            (Some(id), None) => {
                Message::Response(Response { id, result: raw.result, error: raw.error })
            }
            (None, None) => {
                return Err(ProtocolError::MalformedHeader("message with no id or method".into()))
            }
        })
    }

    pub fn to_json(&self) -> Vec<u8> {
        let raw = match self {
            Message::Request(request) => RawMessage {
                jsonrpc: "2.0".into(),
                id: Some(request.id.clone()),
                method: Some(request.method.clone()),
                params: Some(request.params.clone()),
                result: None,
                error: None,
            },
            Message::Notification(notification) => RawMessage {
                jsonrpc: "2.0".into(),
                id: None,
                method: Some(notification.method.clone()),
                params: Some(notification.params.clone()),
                result: None,
                error: None,
            },
            Message::Response(response) => RawMessage {
                jsonrpc: "2.0".into(),
                id: Some(response.id.clone()),
                method: None,
                params: None,
                result: response.result.clone().or_else(|| {
                    // `result` must be present on success responses; `null`
                    // is the canonical empty result.
                    response.error.is_none().then_some(Value::Null)
                }),
                error: response.error.clone(),
            },
        };
        serde_json::to_vec(&raw).expect("message serialization cannot fail")
    }
}

/// Read one frame. `Ok(None)` on clean end of stream.
pub async fn read_message<R>(reader: &mut BufReader<R>) -> Result<Option<Message>, ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut line: Vec<u8> = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return if content_length.is_none() {
                Ok(None)
            } else {
                Err(ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into()))
            };
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            break;
        }
        if let Some(value) = text.strip_prefix("Content-Length:") {
            content_length = Some(
                value
                    .trim()
                    .parse()
                    .map_err(|_| ProtocolError::MalformedHeader(text.to_owned()))?,
            );
        }
        // Anything else (Content-Type included) is tolerated and ignored.
    }

    let length = content_length.ok_or(ProtocolError::MissingLength)?;
    let mut payload = vec![0u8; length];
    tokio::io::AsyncReadExt::read_exact(reader, &mut payload).await?;
    Ok(Some(Message::from_json(&payload)?))
}

/// Write one frame: header and payload in a single write.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = message.to_json();
    let mut frame = Vec::with_capacity(payload.len() + 32);
    frame.extend_from_slice(format!("Content-Length: {}\r\n\r\n", payload.len()).as_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn frame(payload: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{payload}", payload.len()).into_bytes()
    }

    #[tokio::test]
    async fn parses_requests_notifications_and_responses() {
        let mut bytes = frame(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#);
        bytes.extend(frame(r#"{"jsonrpc":"2.0","method":"initialized","params":{}}"#));
        bytes.extend(frame(r#"{"jsonrpc":"2.0","id":"r1","result":{"ok":true}}"#));
        let mut reader = BufReader::new(bytes.as_slice());

        match read_message(&mut reader).await.unwrap().unwrap() {
            Message::Request(request) => {
                assert_eq!(request.id, RequestId::Number(1));
                assert_eq!(request.method, "initialize");
            }
            other => panic!("expected request, got {other:?}"),
        }
        match read_message(&mut reader).await.unwrap().unwrap() {
            Message::Notification(notification) => {
                assert_eq!(notification.method, "initialized");
            }
            other => panic!("expected notification, got {other:?}"),
        }
        match read_message(&mut reader).await.unwrap().unwrap() {
            Message::Response(response) => {
                assert_eq!(response.id, RequestId::String("r1".into()));
                assert!(response.error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_headers_are_tolerated() {
        let payload = r#"{"jsonrpc":"2.0","method":"exit"}"#;
        let bytes = format!(
            "Content-Type: application/vscode-jsonrpc\r\nX-Custom: 1\r\nContent-Length: {}\r\n\r\n{payload}",
            payload.len()
        );
        let mut reader = BufReader::new(bytes.as_bytes());
        let message = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(
            message,
            Message::Notification(Notification { method: "exit".into(), params: Value::Null })
        );
    }

    #[tokio::test]
    async fn missing_length_is_an_error() {
        let bytes = b"X: 1\r\n\r\n{}".to_vec();
        let mut reader = BufReader::new(bytes.as_slice());
        assert!(matches!(
            read_message(&mut reader).await,
            Err(ProtocolError::MissingLength)
        ));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let message = Message::Response(Response::ok(
            RequestId::Number(7),
            serde_json::json!({"capabilities": {}}),
        ));
        let mut buffer = Vec::new();
        write_message(&mut buffer, &message).await.unwrap();
        let mut reader = BufReader::new(buffer.as_slice());
        assert_eq!(read_message(&mut reader).await.unwrap().unwrap(), message);
    }

    #[tokio::test]
    async fn error_responses_round_trip_without_result() {
        let message = Message::Response(Response::err(
            RequestId::Number(9),
            error_codes::METHOD_NOT_FOUND,
            "no such method",
        ));
        let mut buffer = Vec::new();
        write_message(&mut buffer, &message).await.unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(!text.contains("result"));
        let mut reader = BufReader::new(buffer.as_slice());
        assert_eq!(read_message(&mut reader).await.unwrap().unwrap(), message);
    }
}
