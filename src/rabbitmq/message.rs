// src/rabbitmq/message.rs
// Message types flowing from the broker to the host.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use serde_pickle::{HashableValue, Value as PickleValue};

use super::errors::{Result, SensorError};

/// Trigger kind attached to every forwarded event.
pub const NEW_MESSAGE_TRIGGER: &str = "rabbitmq.new_message";

/// Opaque token identifying one delivery on a channel, used only to acknowledge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryHandle(u64);

impl DeliveryHandle {
    pub fn new(delivery_tag: u64) -> Self {
        Self(delivery_tag)
    }

    pub fn delivery_tag(&self) -> u64 {
        self.0
    }
}

/// A message as handed over by the broker client.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub queue: String,
    pub body: Vec<u8>,
    pub handle: DeliveryHandle,
}

/// Host-facing payload: `{"queue": ..., "body": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedEvent {
    pub queue: String,
    pub body: String,
}

/// How a raw message body is turned into text before forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeserializationMethod {
    /// Parse the body as JSON.
    Json,
    /// Parse the body as a Python pickle.
    Pickle,
}

impl DeserializationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeserializationMethod::Json => "json",
            DeserializationMethod::Pickle => "pickle",
        }
    }

    /// Parses a configured mode. `None`, `""` and `"none"` mean identity.
    pub fn parse_optional(raw: Option<&str>) -> Result<Option<Self>> {
        match raw.map(str::trim) {
            None | Some("") | Some("none") => Ok(None),
            Some(other) => other.parse().map(Some),
        }
    }

    /// Decodes a body into the text that is forwarded.
    ///
    /// A pickled `bytes` object is forwarded as its UTF-8 text. Any other
    /// decoded value is rendered as compact JSON.
    pub fn decode(&self, body: &[u8]) -> Result<String> {
        match self {
            DeserializationMethod::Json => {
                let value: Value = serde_json::from_slice(body)?;
                Ok(value.to_string())
            }
            DeserializationMethod::Pickle => {
                match serde_pickle::value_from_slice(body, serde_pickle::DeOptions::new())? {
                    PickleValue::Bytes(bytes) => String::from_utf8(bytes).map_err(|e| {
                        SensorError::DeserializationError(format!(
                            "Unpickled bytes are not valid UTF-8: {}",
                            e
                        ))
                    }),
                    other => Ok(pickle_to_json(other).to_string()),
                }
            }
        }
    }
}

impl FromStr for DeserializationMethod {
    type Err = SensorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(DeserializationMethod::Json),
            "pickle" => Ok(DeserializationMethod::Pickle),
            other => Err(SensorError::ConfigurationError(format!(
                "Invalid deserialization method specified: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DeserializationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renders a body for forwarding.
///
/// Decoded values are rendered as compact JSON, which parses back to the same
/// value. When decoding fails the raw body is used instead; bytes that are not
/// valid UTF-8 are replaced with U+FFFD.
pub fn render_body(
    method: Option<DeserializationMethod>,
    body: &[u8],
) -> (String, Option<SensorError>) {
    let Some(method) = method else {
        return (lossy(body), None);
    };

    match method.decode(body) {
        Ok(text) => (text, None),
        Err(err) => (lossy(body), Some(err)),
    }
}

// Python values JSON cannot hold map onto their closest JSON form: big ints
// and non-finite floats become strings, dict keys are stringified.
fn pickle_to_json(value: PickleValue) -> Value {
    match value {
        PickleValue::None => Value::Null,
        PickleValue::Bool(b) => Value::Bool(b),
        PickleValue::I64(i) => Value::from(i),
        PickleValue::Int(big) => Value::String(big.to_string()),
        PickleValue::F64(f) => float_to_json(f),
        PickleValue::Bytes(bytes) => Value::String(lossy(&bytes)),
        PickleValue::String(s) => Value::String(s),
        PickleValue::List(items) | PickleValue::Tuple(items) => {
            Value::Array(items.into_iter().map(pickle_to_json).collect())
        }
        PickleValue::Set(items) | PickleValue::FrozenSet(items) => {
            Value::Array(items.into_iter().map(hashable_to_json).collect())
        }
        PickleValue::Dict(entries) => {
            let map: Map<String, Value> = entries
                .into_iter()
                .map(|(key, value)| (key_to_string(key), pickle_to_json(value)))
                .collect();
            Value::Object(map)
        }
    }
}

fn hashable_to_json(value: HashableValue) -> Value {
    match value {
        HashableValue::None => Value::Null,
        HashableValue::Bool(b) => Value::Bool(b),
        HashableValue::I64(i) => Value::from(i),
        HashableValue::Int(big) => Value::String(big.to_string()),
        HashableValue::F64(f) => float_to_json(f),
        HashableValue::Bytes(bytes) => Value::String(lossy(&bytes)),
        HashableValue::String(s) => Value::String(s),
        HashableValue::Tuple(items) => {
            Value::Array(items.into_iter().map(hashable_to_json).collect())
        }
        HashableValue::FrozenSet(items) => {
            Value::Array(items.into_iter().map(hashable_to_json).collect())
        }
    }
}

fn key_to_string(key: HashableValue) -> String {
    match hashable_to_json(key) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn float_to_json(f: f64) -> Value {
    Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(f.to_string()))
}

fn lossy(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_methods() {
        assert_eq!(
            DeserializationMethod::parse_optional(Some("json")).unwrap(),
            Some(DeserializationMethod::Json)
        );
        assert_eq!(
            DeserializationMethod::parse_optional(Some("pickle")).unwrap(),
            Some(DeserializationMethod::Pickle)
        );
        assert_eq!(DeserializationMethod::parse_optional(None).unwrap(), None);
        assert_eq!(DeserializationMethod::parse_optional(Some("")).unwrap(), None);
        assert_eq!(DeserializationMethod::parse_optional(Some("none")).unwrap(), None);
    }

    #[test]
    fn rejects_unknown_method() {
        let err = DeserializationMethod::parse_optional(Some("yaml")).unwrap_err();
        assert!(matches!(err, SensorError::ConfigurationError(_)));
        assert!(err.to_string().contains("yaml"));
    }

    #[test]
    fn identity_forwards_text_unchanged() {
        let (body, err) = render_body(None, b"hello");
        assert_eq!(body, "hello");
        assert!(err.is_none());
    }

    #[test]
    fn json_body_round_trips_through_rendering() {
        let (body, err) = render_body(Some(DeserializationMethod::Json), br#"{"id":1}"#);
        assert!(err.is_none());
        let reparsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(reparsed, json!({"id": 1}));
    }

    #[test]
    fn malformed_json_falls_back_to_raw_body() {
        let raw = br#"{"id": 1"#;
        let (body, err) = render_body(Some(DeserializationMethod::Json), raw);
        assert_eq!(body.as_bytes(), raw);
        assert!(matches!(err, Some(SensorError::DeserializationError(_))));
    }

    #[test]
    fn pickled_dict_is_rendered_as_json() {
        let original = json!({"id": 7, "tags": ["a", "b"]});
        let pickled = serde_pickle::to_vec(&original, serde_pickle::SerOptions::new()).unwrap();

        let (body, err) = render_body(Some(DeserializationMethod::Pickle), &pickled);
        assert!(err.is_none());
        let reparsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(reparsed, original);
    }

    #[test]
    fn pickled_bytes_are_forwarded_as_text() {
        // pickle.dumps(b'abc', protocol=3)
        let pickled = b"\x80\x03C\x03abcq\x00.";

        let (body, err) = render_body(Some(DeserializationMethod::Pickle), pickled);
        assert!(err.is_none());
        assert_eq!(body, "abc");
    }

    #[test]
    fn pickled_bytes_that_are_not_utf8_fall_back_to_raw_body() {
        // pickle.dumps(b'\xff', protocol=3)
        let pickled = b"\x80\x03C\x01\xffq\x00.";

        let (body, err) = render_body(Some(DeserializationMethod::Pickle), pickled);
        assert!(matches!(err, Some(SensorError::DeserializationError(_))));
        assert_eq!(body, String::from_utf8_lossy(pickled));
    }

    #[test]
    fn pickled_dict_with_integer_keys_is_stringified() {
        // pickle.dumps({1: 'a'}, protocol=3)
        let pickled = b"\x80\x03}q\x00K\x01X\x01\x00\x00\x00aq\x01s.";

        let (body, err) = render_body(Some(DeserializationMethod::Pickle), pickled);
        assert!(err.is_none());
        assert_eq!(body, r#"{"1":"a"}"#);
    }

    #[test]
    fn pickled_tuple_and_float_render_as_json() {
        let value = PickleValue::Tuple(vec![
            PickleValue::I64(1),
            PickleValue::F64(f64::INFINITY),
            PickleValue::None,
        ]);
        let pickled = serde_pickle::value_to_vec(&value, serde_pickle::SerOptions::new()).unwrap();

        let (body, err) = render_body(Some(DeserializationMethod::Pickle), &pickled);
        assert!(err.is_none());
        assert_eq!(body, r#"[1,"inf",null]"#);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_rejected() {
        let (body, _) = render_body(None, &[0x66, 0x6f, 0xff]);
        assert_eq!(body, "fo\u{fffd}");
    }

    #[test]
    fn forwarded_event_shape() {
        let event = ForwardedEvent {
            queue: "orders".to_string(),
            body: "hello".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"queue": "orders", "body": "hello"})
        );
    }
}
