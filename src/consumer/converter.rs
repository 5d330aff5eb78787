//! Payload conversion, trusted type allow-list and standard headers

use crate::consumer::error::ConversionError;
use crate::consumer::record::ConsumedRecord;
use bytes::Bytes;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Header carrying the logical payload type name
pub const PAYLOAD_TYPE_HEADER: &str = "x-payload-type";
/// Header written by [`StandardHeaders::Id`]
pub const ID_HEADER: &str = "id";
/// Header written by [`StandardHeaders::Timestamp`]
pub const TIMESTAMP_HEADER: &str = "timestamp";

/// Name of the converter used when a binding does not select one
pub const DEFAULT_CONVERTER: &str = "json";

/// A decoded inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Raw bytes, untouched
    Bytes(Bytes),
    /// UTF-8 text
    Text(String),
    /// Parsed JSON document
    Json(serde_json::Value),
}

/// Encodes and decodes record payloads for a binding
pub trait MessageConverter: Send + Sync + Debug {
    /// Registry name
    fn name(&self) -> &str;

    /// Decode the payload of an inbound record
    fn decode(
        &self,
        record: &ConsumedRecord,
        trusted: &TrustedTypes,
    ) -> Result<Payload, ConversionError>;

    /// Encode a payload for publishing
    fn encode(&self, payload: &Payload) -> Result<Bytes, ConversionError>;
}

/// Passthrough converter
#[derive(Debug, Default)]
pub struct BytesConverter;

impl MessageConverter for BytesConverter {
    fn name(&self) -> &str {
        "bytes"
    }

    fn decode(&self, record: &ConsumedRecord, _trusted: &TrustedTypes) -> Result<Payload, ConversionError> {
        record
            .payload()
            .cloned()
            .map(Payload::Bytes)
            .ok_or(ConversionError::MissingPayload)
    }

    fn encode(&self, payload: &Payload) -> Result<Bytes, ConversionError> {
        Ok(match payload {
            Payload::Bytes(b) => b.clone(),
            Payload::Text(s) => Bytes::from(s.clone()),
            Payload::Json(v) => Bytes::from(
                serde_json::to_vec(v).map_err(|e| ConversionError::Malformed(e.to_string()))?,
            ),
        })
    }
}

/// UTF-8 text converter
#[derive(Debug, Default)]
pub struct StringConverter;

impl MessageConverter for StringConverter {
    fn name(&self) -> &str {
        "string"
    }

    fn decode(&self, record: &ConsumedRecord, _trusted: &TrustedTypes) -> Result<Payload, ConversionError> {
        let bytes = record.payload().ok_or(ConversionError::MissingPayload)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ConversionError::Malformed(format!("invalid UTF-8: {}", e)))?;
        Ok(Payload::Text(text.to_string()))
    }

    fn encode(&self, payload: &Payload) -> Result<Bytes, ConversionError> {
        match payload {
            Payload::Text(s) => Ok(Bytes::from(s.clone())),
            Payload::Bytes(b) => std::str::from_utf8(b)
                .map(|_| b.clone())
                .map_err(|e| ConversionError::Malformed(format!("invalid UTF-8: {}", e))),
            Payload::Json(v) => Ok(Bytes::from(v.to_string())),
        }
    }
}

/// JSON converter; enforces the trusted type allow-list when the record
/// declares a payload type
#[derive(Debug, Default)]
pub struct JsonConverter;

impl MessageConverter for JsonConverter {
    fn name(&self) -> &str {
        "json"
    }

    fn decode(&self, record: &ConsumedRecord, trusted: &TrustedTypes) -> Result<Payload, ConversionError> {
        if let Some(type_name) = record.header_str(PAYLOAD_TYPE_HEADER) {
            if !trusted.is_trusted(type_name) {
                return Err(ConversionError::UntrustedType(type_name.to_string()));
            }
        }

        let bytes = record.payload().ok_or(ConversionError::MissingPayload)?;
        serde_json::from_slice(bytes)
            .map(Payload::Json)
            .map_err(|e| ConversionError::Malformed(format!("JSON parse error: {}", e)))
    }

    fn encode(&self, payload: &Payload) -> Result<Bytes, ConversionError> {
        let value = match payload {
            Payload::Json(v) => v.clone(),
            Payload::Text(s) => serde_json::Value::String(s.clone()),
            Payload::Bytes(b) => serde_json::from_slice(b)
                .map_err(|e| ConversionError::Malformed(format!("JSON parse error: {}", e)))?,
        };
        serde_json::to_vec(&value)
            .map(Bytes::from)
            .map_err(|e| ConversionError::Malformed(e.to_string()))
    }
}

/// Allow-list of payload type names, matched as glob patterns
/// (`acme.orders.*`). A single `*` trusts everything.
#[derive(Debug, Clone)]
pub struct TrustedTypes {
    patterns: Vec<String>,
    set: GlobSet,
    trust_all: bool,
}

impl TrustedTypes {
    /// Compile the allow-list
    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            patterns: patterns.to_vec(),
            set: builder.build()?,
            trust_all: patterns.iter().any(|p| p == "*"),
        })
    }

    /// Nothing is trusted; untyped payloads still decode
    pub fn none() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
            trust_all: false,
        }
    }

    /// Whether the type name may be materialised
    pub fn is_trusted(&self, type_name: &str) -> bool {
        self.trust_all || self.set.is_match(type_name)
    }

    /// Raw patterns, as configured
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Converters addressable by name from a binding's `converterBeanName`
#[derive(Debug, Clone)]
pub struct ConverterRegistry {
    converters: HashMap<String, Arc<dyn MessageConverter>>,
}

impl ConverterRegistry {
    /// Registry holding only the built-in converters
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            converters: HashMap::new(),
        };
        registry.register(Arc::new(BytesConverter));
        registry.register(Arc::new(StringConverter));
        registry.register(Arc::new(JsonConverter));
        registry
    }

    /// Register or replace a converter under its own name
    pub fn register(&mut self, converter: Arc<dyn MessageConverter>) {
        self.converters.insert(converter.name().to_string(), converter);
    }

    /// Look a converter up by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn MessageConverter>> {
        self.converters.get(name).cloned()
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Auto-generated metadata headers attached to inbound records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StandardHeaders {
    /// No extra headers
    #[default]
    None,
    /// A UUIDv4 under `id`
    Id,
    /// Epoch millis under `timestamp`
    Timestamp,
    /// Both `id` and `timestamp`
    Both,
}

impl StandardHeaders {
    /// Attach the configured headers; values already present are kept
    pub fn apply(&self, record: &mut ConsumedRecord) {
        if matches!(self, StandardHeaders::Id | StandardHeaders::Both) {
            record.insert_header_if_absent(ID_HEADER, uuid::Uuid::new_v4().to_string());
        }
        if matches!(self, StandardHeaders::Timestamp | StandardHeaders::Both) {
            let millis = chrono::Utc::now().timestamp_millis();
            record.insert_header_if_absent(TIMESTAMP_HEADER, millis.to_string());
        }
    }
}
