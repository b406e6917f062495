//! Newline-delimited JSON-RPC 2.0 framing
//!
//! One JSON object per line. A single socket read may carry several messages
//! or a fragment of one; `LineBuffer` keeps the tail until its `\n` arrives.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Accumulates raw socket bytes and yields complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete, non-blank line without its terminator
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self.buf.iter().position(|b| *b == b'\n')?;
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    /// Bytes buffered while waiting for a terminator
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Debug, Serialize)]
struct RequestFrame<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

/// Serialize one request as a `\n`-terminated line
pub fn encode_request(id: u64, method: &str, params: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(&RequestFrame {
        jsonrpc: "2.0",
        id,
        method,
        params,
    })?;
    line.push(b'\n');
    Ok(line)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Server-pushed `*.subscribe` message
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    Notification(Notification),
    /// Well-formed JSON that is neither ours nor a subscription push
    Ignored,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Decode one line. A line holding a JSON array yields one message per element.
pub fn parse_line(line: &str) -> Result<Vec<Incoming>, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value::<RawMessage>(item).map(classify))
            .collect(),
        other => Ok(vec![classify(serde_json::from_value::<RawMessage>(other)?)]),
    }
}

fn classify(raw: RawMessage) -> Incoming {
    let id = raw.id.as_ref().and_then(Value::as_u64);

    if let Some(method) = raw.method {
        if id.is_none() && method.ends_with(".subscribe") {
            return Incoming::Notification(Notification {
                method,
                params: raw.params.unwrap_or(Value::Null),
            });
        }
        return Incoming::Ignored;
    }

    let Some(id) = id else {
        return Incoming::Ignored;
    };

    let outcome = match raw.error {
        Some(error) if !error.is_null() => Err(rpc_error(error)),
        _ => Ok(raw.result.unwrap_or(Value::Null)),
    };
    Incoming::Response { id, outcome }
}

fn rpc_error(error: Value) -> RpcError {
    match error {
        Value::Object(map) => RpcError {
            code: map.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Electrum error")
                .to_string(),
        },
        Value::String(message) => RpcError { code: 0, message },
        other => RpcError {
            code: 0,
            message: other.to_string(),
        },
    }
}
