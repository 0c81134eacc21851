// Copyright 2026 the prise authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire protocol shared between the prise daemon and its front ends.
//!
//! Every message on the wire is a single MessagePack array, tagged by its
//! first element:
//!
//! - `[0, msgid, method, params]` — request
//! - `[1, msgid, error, result]` — response
//! - `[2, method, params]` — notification
//!
//! `params`/`result`/`error` are [`rmpv::Value`] rather than static structs
//! because their shape varies per method; callers downcast what they expect.

use std::{fmt, io};

pub use rmpv::Value;

pub const TYPE_REQUEST: i64 = 0;
pub const TYPE_RESPONSE: i64 = 1;
pub const TYPE_NOTIFICATION: i64 = 2;

/// A decoded message in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request { msgid: u32, method: String, params: Value },
    Response { msgid: u32, error: Value, result: Value },
    Notification { method: String, params: Value },
}

impl Message {
    pub fn request(msgid: u32, method: impl Into<String>, params: Value) -> Message {
        Message::Request { msgid, method: method.into(), params }
    }

    pub fn response_ok(msgid: u32, result: Value) -> Message {
        Message::Response { msgid, error: Value::Nil, result }
    }

    /// Builds an error response per the wire convention this crate settled
    /// on: error is a descriptive string, result is nil.
    pub fn response_err(msgid: u32, error: impl Into<String>) -> Message {
        Message::Response { msgid, error: Value::String(error.into().into()), result: Value::Nil }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Message {
        Message::Notification { method: method.into(), params }
    }

    fn into_value(self) -> Value {
        match self {
            Message::Request { msgid, method, params } => {
                Value::Array(vec![Value::from(TYPE_REQUEST), Value::from(msgid), Value::from(method), params])
            }
            Message::Response { msgid, error, result } => {
                Value::Array(vec![Value::from(TYPE_RESPONSE), Value::from(msgid), error, result])
            }
            Message::Notification { method, params } => {
                Value::Array(vec![Value::from(TYPE_NOTIFICATION), Value::from(method), params])
            }
        }
    }

    fn from_value(v: Value) -> Result<Message, DecodeError> {
        let items = match v {
            Value::Array(items) => items,
            other => return Err(DecodeError::Malformed(format!("top-level value is not an array: {other:?}"))),
        };
        let tag = items.first().and_then(|v| v.as_i64()).ok_or_else(|| {
            DecodeError::Malformed("message is missing an integer type tag".to_string())
        })?;
        match (tag, items.len()) {
            (TYPE_REQUEST, 4) => {
                let mut it = items.into_iter();
                let _tag = it.next();
                let msgid = it.next().and_then(|v| v.as_u64()).ok_or_else(|| {
                    DecodeError::Malformed("request msgid is not a uint".to_string())
                })? as u32;
                let method = it
                    .next()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| DecodeError::Malformed("request method is not a string".to_string()))?;
                let params = it.next().unwrap_or(Value::Nil);
                Ok(Message::Request { msgid, method, params })
            }
            (TYPE_RESPONSE, 4) => {
                let mut it = items.into_iter();
                let _tag = it.next();
                let msgid = it.next().and_then(|v| v.as_u64()).ok_or_else(|| {
                    DecodeError::Malformed("response msgid is not a uint".to_string())
                })? as u32;
                let error = it.next().unwrap_or(Value::Nil);
                let result = it.next().unwrap_or(Value::Nil);
                Ok(Message::Response { msgid, error, result })
            }
            (TYPE_NOTIFICATION, 3) => {
                let mut it = items.into_iter();
                let _tag = it.next();
                let method = it
                    .next()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| DecodeError::Malformed("notification method is not a string".to_string()))?;
                let params = it.next().unwrap_or(Value::Nil);
                Ok(Message::Notification { method, params })
            }
            (tag, len) => Err(DecodeError::Malformed(format!(
                "unrecognized message shape: tag={tag}, len={len}"
            ))),
        }
    }
}

#[derive(Debug)]
pub enum DecodeError {
    /// The top-level value did not match one of the three known shapes.
    Malformed(String),
    Io(io::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed(msg) => write!(f, "malformed message: {msg}"),
            DecodeError::Io(e) => write!(f, "io error decoding message: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> Self {
        DecodeError::Io(e)
    }
}

fn is_eof(e: &rmpv::decode::Error) -> bool {
    match e {
        rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        rmpv::decode::Error::DepthLimitExceeded => false,
    }
}

/// Encodes `msg` as a single MessagePack value.
pub fn encode_to<W: io::Write>(msg: Message, w: &mut W) -> io::Result<()> {
    rmpv::encode::write_value(w, &msg.into_value()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Attempts to decode exactly one message from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` holds less than one complete value; the
/// caller should read more bytes and retry rather than treating this as an
/// error. On success, returns the message along with the number of bytes
/// it consumed from the front of `buf`.
pub fn try_decode(buf: &[u8]) -> Result<Option<(Message, usize)>, DecodeError> {
    let mut cursor = io::Cursor::new(buf);
    match rmpv::decode::read_value(&mut cursor) {
        Ok(v) => {
            let consumed = cursor.position() as usize;
            Ok(Some((Message::from_value(v)?, consumed)))
        }
        Err(e) if is_eof(&e) => Ok(None),
        Err(e) => Err(DecodeError::Malformed(e.to_string())),
    }
}

/// Accumulates bytes read from a stream and yields whole messages as they
/// become available, preserving any trailing partial message across calls.
#[derive(Default)]
pub struct Codec {
    buf: Vec<u8>,
}

impl Codec {
    pub fn new() -> Codec {
        Codec { buf: Vec::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Discards any buffered bytes. Used when a malformed top-level value
    /// makes it impossible to find the next message boundary.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pulls the next complete message out of the buffer, if any.
    pub fn next_message(&mut self) -> Result<Option<Message>, DecodeError> {
        match try_decode(&self.buf)? {
            Some((msg, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_request() {
        let msg = Message::request(7, "ping", Value::Array(vec![]));
        let mut buf = Vec::new();
        encode_to(msg.clone(), &mut buf).unwrap();
        let (decoded, consumed) = try_decode(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trips_response_and_notification() {
        let resp = Message::response_ok(1, Value::from("pong"));
        let mut buf = Vec::new();
        encode_to(resp.clone(), &mut buf).unwrap();
        assert_eq!(try_decode(&buf).unwrap().unwrap().0, resp);

        let note = Message::notification("redraw", Value::Array(vec![Value::from(0)]));
        let mut buf = Vec::new();
        encode_to(note.clone(), &mut buf).unwrap();
        assert_eq!(try_decode(&buf).unwrap().unwrap().0, note);
    }

    #[test]
    fn error_response_carries_string_error_and_nil_result() {
        let resp = Message::response_err(3, "session not found");
        match resp {
            Message::Response { error, result, .. } => {
                assert_eq!(error, Value::from("session not found"));
                assert_eq!(result, Value::Nil);
            }
            _ => panic!("expected a response"),
        }
    }

    #[test]
    fn truncated_buffer_yields_none_not_error() {
        let msg = Message::request(1, "ping", Value::Array(vec![]));
        let mut buf = Vec::new();
        encode_to(msg, &mut buf).unwrap();
        let half = &buf[..buf.len() - 1];
        assert!(try_decode(half).unwrap().is_none());
    }

    #[test]
    fn codec_buffers_partial_reads_and_preserves_trailing_bytes() {
        let mut codec = Codec::new();
        let a = Message::request(1, "ping", Value::Array(vec![]));
        let b = Message::notification("redraw", Value::Array(vec![]));
        let mut buf = Vec::new();
        encode_to(a.clone(), &mut buf).unwrap();
        let split = buf.len() / 2;
        let (first_half, second_half) = buf.split_at(split);

        codec.feed(first_half);
        assert!(codec.next_message().unwrap().is_none());
        codec.feed(second_half);
        assert_eq!(codec.next_message().unwrap().unwrap(), a);

        let mut buf2 = Vec::new();
        encode_to(b.clone(), &mut buf2).unwrap();
        codec.feed(&buf2);
        codec.feed(&buf2);
        assert_eq!(codec.next_message().unwrap().unwrap(), b);
        assert_eq!(codec.next_message().unwrap().unwrap(), b);
        assert!(codec.next_message().unwrap().is_none());
    }

    #[test]
    fn malformed_top_level_shape_is_rejected() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::Array(vec![Value::from(9), Value::from(1)])).unwrap();
        match try_decode(&buf) {
            Err(DecodeError::Malformed(_)) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }
}
