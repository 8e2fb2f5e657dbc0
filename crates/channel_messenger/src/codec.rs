//! Typed encodings carried over the byte channels.
//!
//! A [`MessageCodec`] maps one value per message; a [`MethodCodec`] frames method
//! calls and their success/error envelopes. An absent payload always maps to an
//! absent value and back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::MessengerError;

pub trait MessageCodec<T>: Send + Sync {
    fn encode_message(&self, message: Option<&T>) -> Result<Option<Vec<u8>>, MessengerError>;

    fn decode_message(&self, message: Option<&[u8]>) -> Result<Option<T>, MessengerError>;
}

/// Passes bytes through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl MessageCodec<Vec<u8>> for BinaryCodec {
    fn encode_message(&self, message: Option<&Vec<u8>>) -> Result<Option<Vec<u8>>, MessengerError> {
        Ok(message.cloned())
    }

    fn decode_message(&self, message: Option<&[u8]>) -> Result<Option<Vec<u8>>, MessengerError> {
        Ok(message.map(<[u8]>::to_vec))
    }
}

/// UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl MessageCodec<String> for StringCodec {
    fn encode_message(&self, message: Option<&String>) -> Result<Option<Vec<u8>>, MessengerError> {
        Ok(message.map(|s| s.as_bytes().to_vec()))
    }

    fn decode_message(&self, message: Option<&[u8]>) -> Result<Option<String>, MessengerError> {
        message
            .map(|bytes| String::from_utf8(bytes.to_vec()).map_err(MessengerError::from))
            .transpose()
    }
}

/// UTF-8 JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageCodec;

impl MessageCodec<Value> for JsonMessageCodec {
    fn encode_message(&self, message: Option<&Value>) -> Result<Option<Vec<u8>>, MessengerError> {
        message
            .map(|value| serde_json::to_vec(value).map_err(MessengerError::from))
            .transpose()
    }

    fn decode_message(&self, message: Option<&[u8]>) -> Result<Option<Value>, MessengerError> {
        message
            .map(|bytes| serde_json::from_slice(bytes).map_err(MessengerError::from))
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(rename = "args", default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// Failure reported by the remote side of a method channel.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("method error `{code}`: {}", .message.as_deref().unwrap_or("<no message>"))]
pub struct MethodError {
    pub code: String,
    pub message: Option<String>,
    pub details: Option<Value>,
}

impl MethodError {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: None,
            details: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub trait MethodCodec: Send + Sync {
    fn encode_method_call(&self, call: &MethodCall) -> Result<Vec<u8>, MessengerError>;

    fn decode_method_call(&self, message: &[u8]) -> Result<MethodCall, MessengerError>;

    fn encode_success_envelope(&self, result: &Value) -> Result<Vec<u8>, MessengerError>;

    fn encode_error_envelope(&self, error: &MethodError) -> Result<Vec<u8>, MessengerError>;

    /// `Ok(Err(_))` is a well-formed error envelope; the outer `Err` means the
    /// envelope itself could not be read.
    fn decode_envelope(&self, envelope: &[u8]) -> Result<Result<Value, MethodError>, MessengerError>;
}

/// Method calls as `{"method": .., "args": ..}`; results as `[result]` and errors
/// as `[code, message, details]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMethodCodec;

impl MethodCodec for JsonMethodCodec {
    fn encode_method_call(&self, call: &MethodCall) -> Result<Vec<u8>, MessengerError> {
        Ok(serde_json::to_vec(call)?)
    }

    fn decode_method_call(&self, message: &[u8]) -> Result<MethodCall, MessengerError> {
        Ok(serde_json::from_slice(message)?)
    }

    fn encode_success_envelope(&self, result: &Value) -> Result<Vec<u8>, MessengerError> {
        Ok(serde_json::to_vec(&[result])?)
    }

    fn encode_error_envelope(&self, error: &MethodError) -> Result<Vec<u8>, MessengerError> {
        let envelope = (
            &error.code,
            &error.message,
            error.details.as_ref().unwrap_or(&Value::Null),
        );
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn decode_envelope(&self, envelope: &[u8]) -> Result<Result<Value, MethodError>, MessengerError> {
        let mut items = match serde_json::from_slice::<Value>(envelope)? {
            Value::Array(items) => items,
            other => return Err(MessengerError::Codec(format!("invalid envelope: {other}"))),
        };
        match items.len() {
            1 => Ok(Ok(items.remove(0))),
            3 => {
                let details = items.pop().filter(|d| !d.is_null());
                let message = match items.pop() {
                    Some(Value::String(message)) => Some(message),
                    Some(Value::Null) | None => None,
                    Some(other) => {
                        return Err(MessengerError::Codec(format!(
                            "invalid error envelope message: {other}"
                        )));
                    }
                };
                match items.pop() {
                    Some(Value::String(code)) => Ok(Err(MethodError {
                        code,
                        message,
                        details,
                    })),
                    other => Err(MessengerError::Codec(format!(
                        "invalid error envelope code: {}",
                        other.unwrap_or(Value::Null)
                    ))),
                }
            }
            n => Err(MessengerError::Codec(format!(
                "invalid envelope: expected 1 or 3 elements, got {n}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn absent_payloads_stay_absent() {
        assert_eq!(StringCodec.encode_message(None).unwrap(), None);
        assert_eq!(StringCodec.decode_message(None).unwrap(), None);
        assert_eq!(JsonMessageCodec.decode_message(None).unwrap(), None);
        assert_eq!(BinaryCodec.encode_message(None).unwrap(), None);
    }

    #[test]
    fn strings_are_utf8() {
        let encoded = StringCodec.encode_message(Some(&"héllo".to_string())).unwrap();
        assert_eq!(encoded.as_deref(), Some("héllo".as_bytes()));

        let err = StringCodec.decode_message(Some(&[0xff, 0xfe])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Codec);
    }

    #[test]
    fn json_messages_decode_to_values() {
        let decoded = JsonMessageCodec.decode_message(Some(br#"{"a":[1,2]}"#)).unwrap();
        assert_eq!(decoded, Some(json!({"a": [1, 2]})));
        assert!(JsonMessageCodec.decode_message(Some(b"{oops")).is_err());
    }

    #[test]
    fn method_call_wire_form() {
        let bytes = JsonMethodCodec
            .encode_method_call(&MethodCall::new("upper", json!("abc")))
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"method": "upper", "args": "abc"}));

        let call = JsonMethodCodec.decode_method_call(br#"{"method":"noargs"}"#).unwrap();
        assert_eq!(call, MethodCall::new("noargs", Value::Null));

        assert!(JsonMethodCodec.decode_method_call(br#"{"args":1}"#).is_err());
    }

    #[test]
    fn envelopes() {
        let ok = JsonMethodCodec.encode_success_envelope(&json!({"n": 1})).unwrap();
        assert_eq!(ok, br#"[{"n":1}]"#.to_vec());
        assert_eq!(JsonMethodCodec.decode_envelope(&ok).unwrap(), Ok(json!({"n": 1})));

        let error = MethodError::new("bad_args")
            .with_message("expected a string")
            .with_details(json!({"got": 3}));
        let bytes = JsonMethodCodec.encode_error_envelope(&error).unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&bytes).unwrap(),
            json!(["bad_args", "expected a string", {"got": 3}])
        );
        assert_eq!(JsonMethodCodec.decode_envelope(&bytes).unwrap(), Err(error));

        let bare = JsonMethodCodec.encode_error_envelope(&MethodError::new("x")).unwrap();
        assert_eq!(bare, br#"["x",null,null]"#.to_vec());
        assert_eq!(JsonMethodCodec.decode_envelope(&bare).unwrap(), Err(MethodError::new("x")));
    }

    #[test]
    fn malformed_envelopes_are_codec_errors() {
        let cases: [&[u8]; 6] = [b"{}", b"[]", b"[1,2]", b"[1,null,null]", b"[\"c\",5,null]", b"nope"];
        for bad in cases {
            let err = JsonMethodCodec.decode_envelope(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Codec, "{}", String::from_utf8_lossy(bad));
        }
    }
}
