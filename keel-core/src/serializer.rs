//! Body codecs and the priority-ordered serializer registry.
//!
//! Entities cross the codec boundary as `serde_json::Value`, so any codec
//! can read what the typed parameter decoders and `Reply::entity` produce.

use crate::content_negotiation::{MediaType, is_unconstrained};
use crate::{Error, Result};
use bytes::Bytes;
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::Arc;

/// A codec for one family of media types.
pub trait HttpBodySerializer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Media types this codec reads and writes, most preferred first.
    fn media_types(&self) -> &[MediaType];

    /// Lower values are preferred during negotiation.
    fn priority(&self) -> i32 {
        0
    }

    fn supports(&self, media_type: &MediaType) -> bool {
        self.media_types()
            .iter()
            .any(|m| m.is_compatible_with(media_type))
    }

    /// Whether this codec can render `value`; checked before anything is
    /// written so negotiation can move on to the next candidate.
    fn can_write(&self, _value: &Value) -> bool {
        true
    }

    fn serialize(&self, value: &Value) -> Result<Bytes>;

    /// Writes straight into a sink, for streaming responses.
    fn serialize_to(&self, value: &Value, out: &mut dyn Write) -> Result<()> {
        let bytes = self.serialize(value)?;
        out.write_all(&bytes)?;
        Ok(())
    }

    fn deserialize(&self, body: &[u8]) -> Result<Value>;
}

/// `application/json` via `serde_json`.
pub struct JsonSerializer {
    media_types: Vec<MediaType>,
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self {
            media_types: vec![MediaType::json()],
        }
    }
}

impl HttpBodySerializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn media_types(&self) -> &[MediaType] {
        &self.media_types
    }

    fn serialize(&self, value: &Value) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    fn serialize_to(&self, value: &Value, out: &mut dyn Write) -> Result<()> {
        serde_json::to_writer(out, value).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn deserialize(&self, body: &[u8]) -> Result<Value> {
        serde_json::from_slice(body).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// `application/x-www-form-urlencoded` via `serde_urlencoded`.
///
/// Only flat objects are representable; values decode as strings and
/// repeated keys as arrays of strings.
pub struct FormSerializer {
    media_types: Vec<MediaType>,
}

impl Default for FormSerializer {
    fn default() -> Self {
        Self {
            media_types: vec![MediaType::form_urlencoded()],
        }
    }
}

impl HttpBodySerializer for FormSerializer {
    fn name(&self) -> &'static str {
        "form"
    }

    fn media_types(&self) -> &[MediaType] {
        &self.media_types
    }

    fn priority(&self) -> i32 {
        10
    }

    fn can_write(&self, value: &Value) -> bool {
        let Value::Object(map) = value else {
            return false;
        };
        map.values().all(|field| match field {
            Value::Array(items) => items.iter().all(is_form_scalar),
            other => other.is_null() || is_form_scalar(other),
        })
    }

    fn serialize(&self, value: &Value) -> Result<Bytes> {
        let Value::Object(map) = value else {
            return Err(Error::Serialization(
                "form encoding requires an object".into(),
            ));
        };
        let mut pairs: Vec<(&str, String)> = Vec::with_capacity(map.len());
        for (key, value) in map {
            match value {
                Value::Null => {}
                Value::Array(items) => {
                    for item in items {
                        pairs.push((key.as_str(), form_scalar(key, item)?));
                    }
                }
                other => pairs.push((key.as_str(), form_scalar(key, other)?)),
            }
        }
        serde_urlencoded::to_string(&pairs)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    fn deserialize(&self, body: &[u8]) -> Result<Value> {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        let mut map = Map::new();
        for (key, value) in pairs {
            match map.get_mut(&key) {
                None => {
                    map.insert(key, Value::String(value));
                }
                Some(Value::Array(items)) => items.push(Value::String(value)),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, Value::String(value)]);
                }
            }
        }
        Ok(Value::Object(map))
    }
}

fn is_form_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Bool(_) | Value::Number(_))
}

fn form_scalar(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(_) | Value::Number(_) => Ok(value.to_string()),
        _ => Err(Error::Serialization(format!(
            "form field {key:?} must be a scalar"
        ))),
    }
}

/// `text/plain` for string and scalar payloads.
pub struct TextSerializer {
    media_types: Vec<MediaType>,
}

impl Default for TextSerializer {
    fn default() -> Self {
        Self {
            media_types: vec![MediaType::plain_text_utf8()],
        }
    }
}

impl HttpBodySerializer for TextSerializer {
    fn name(&self) -> &'static str {
        "text"
    }

    fn media_types(&self) -> &[MediaType] {
        &self.media_types
    }

    fn priority(&self) -> i32 {
        20
    }

    fn can_write(&self, value: &Value) -> bool {
        !matches!(value, Value::Array(_) | Value::Object(_))
    }

    fn serialize(&self, value: &Value) -> Result<Bytes> {
        match value {
            Value::String(s) => Ok(Bytes::from(s.clone())),
            Value::Bool(_) | Value::Number(_) => Ok(Bytes::from(value.to_string())),
            Value::Null => Ok(Bytes::new()),
            _ => Err(Error::Serialization(
                "text/plain can only render scalar values".into(),
            )),
        }
    }

    fn deserialize(&self, body: &[u8]) -> Result<Value> {
        std::str::from_utf8(body)
            .map(|s| Value::String(s.to_string()))
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Registered serializers, ordered by priority then registration.
#[derive(Clone, Default)]
pub struct Serializers {
    entries: Vec<Arc<dyn HttpBodySerializer>>,
}

impl Serializers {
    pub fn new() -> Self {
        Self::default()
    }

    /// JSON, form and plain text.
    pub fn with_defaults() -> Self {
        let mut serializers = Self::new();
        serializers.register(Arc::new(JsonSerializer::default()));
        serializers.register(Arc::new(FormSerializer::default()));
        serializers.register(Arc::new(TextSerializer::default()));
        serializers
    }

    pub fn register(&mut self, serializer: Arc<dyn HttpBodySerializer>) {
        self.entries.push(serializer);
        self.entries.sort_by_key(|s| s.priority());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn HttpBodySerializer>> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Codec for a request body; without a content type the first
    /// registered serializer is used.
    pub fn for_reading(
        &self,
        content_type: Option<&MediaType>,
    ) -> Option<&Arc<dyn HttpBodySerializer>> {
        match content_type {
            Some(ct) => self.entries.iter().find(|s| s.supports(ct)),
            None => self.entries.first(),
        }
    }

    /// Walks the accepted types in order and, for each, the serializers in
    /// priority order; returns the first compatible pair.
    ///
    /// An unconstrained accept list falls back to the first serializer and
    /// its preferred media type.
    pub fn negotiate(
        &self,
        accepted: &[MediaType],
    ) -> Option<(Arc<dyn HttpBodySerializer>, MediaType)> {
        if is_unconstrained(accepted) {
            let first = self.entries.first()?;
            let media_type = first.media_types().first()?.clone();
            return Some((first.clone(), media_type));
        }
        accepted.iter().find_map(|wanted| {
            self.entries.iter().find_map(|serializer| {
                serializer
                    .media_types()
                    .iter()
                    .find(|offered| offered.is_compatible_with(wanted))
                    .map(|offered| {
                        let chosen = wanted.more_specific(offered).clone().with_quality(1.0);
                        (serializer.clone(), concrete_or(chosen, offered))
                    })
            })
        })
    }
}

/// Keeps wildcards out of `Content-Type` by falling back to the offered type.
fn concrete_or(chosen: MediaType, offered: &MediaType) -> MediaType {
    if chosen.is_concrete() && !chosen.subtype.contains('*') {
        chosen
    } else {
        offered.clone()
    }
}

impl std::fmt::Debug for Serializers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|s| s.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_negotiation::parse_accept;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        items: Vec<String>,
        note: Option<String>,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Login {
        user: String,
        remember: String,
    }

    #[test]
    fn test_json_round_trip() {
        let order = Order {
            id: 7,
            items: vec!["a".into(), "b".into()],
            note: None,
        };
        let codec = JsonSerializer::default();
        let bytes = codec.serialize(&serde_json::to_value(&order).unwrap()).unwrap();
        let back: Order = serde_json::from_value(codec.deserialize(&bytes).unwrap()).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn test_form_round_trip() {
        let login = Login {
            user: "ada lovelace".into(),
            remember: "yes".into(),
        };
        let codec = FormSerializer::default();
        let bytes = codec.serialize(&serde_json::to_value(&login).unwrap()).unwrap();
        let encoded = std::str::from_utf8(&bytes).unwrap();
        assert!(encoded.contains("user=ada+lovelace"));
        assert!(encoded.contains("remember=yes"));
        let back: Login = serde_json::from_value(codec.deserialize(&bytes).unwrap()).unwrap();
        assert_eq!(back, login);
    }

    #[test]
    fn test_form_repeated_keys() {
        let value = FormSerializer::default().deserialize(b"t=a&t=b&t=c&x=1").unwrap();
        assert_eq!(value, json!({"t": ["a", "b", "c"], "x": "1"}));
        assert!(FormSerializer::default().serialize(&json!({"n": {"deep": 1}})).is_err());
    }

    #[test]
    fn test_text_round_trip() {
        let codec = TextSerializer::default();
        let bytes = codec.serialize(&json!("hello")).unwrap();
        assert_eq!(codec.deserialize(&bytes).unwrap(), json!("hello"));
        assert!(codec.serialize(&json!({"a": 1})).is_err());
    }

    #[test]
    fn test_can_write_refuses_unrenderable_values() {
        let text = TextSerializer::default();
        assert!(text.can_write(&json!("hi")));
        assert!(text.can_write(&json!(3)));
        assert!(!text.can_write(&json!({"v": 1})));

        let form = FormSerializer::default();
        assert!(form.can_write(&json!({"t": ["a", "b"], "n": 1, "gone": null})));
        assert!(!form.can_write(&json!({"n": {"deep": 1}})));
        assert!(!form.can_write(&json!("flat")));
        assert!(JsonSerializer::default().can_write(&json!([1, 2])));
    }

    #[test]
    fn test_negotiate_order() {
        let serializers = Serializers::with_defaults();
        let (s, mt) = serializers
            .negotiate(&parse_accept(["text/plain, application/json"]))
            .unwrap();
        assert_eq!(s.name(), "text");
        assert_eq!(mt.essence(), "text/plain");

        let (s, mt) = serializers.negotiate(&[]).unwrap();
        assert_eq!(s.name(), "json");
        assert_eq!(mt, MediaType::json());

        let (s, mt) = serializers.negotiate(&parse_accept(["application/*"])).unwrap();
        assert_eq!(s.name(), "json");
        assert_eq!(mt, MediaType::json());

        assert!(serializers.negotiate(&parse_accept(["image/png"])).is_none());
    }

    #[test]
    fn test_reading_selection() {
        let serializers = Serializers::with_defaults();
        let form = MediaType::form_urlencoded();
        assert_eq!(serializers.for_reading(Some(&form)).unwrap().name(), "form");
        assert_eq!(serializers.for_reading(None).unwrap().name(), "json");
        assert!(serializers.for_reading(Some(&MediaType::new("image", "png"))).is_none());
    }
}
