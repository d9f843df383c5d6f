//! Message shapes exchanged between the extension contexts and the page.
//!
//! Everything that crosses the page window bus is a plain JSON value, the same
//! way `window.postMessage` carries structured clones. The bus is shared with
//! whatever else the page posts, so every message carries a `source` marker and
//! a `type` marker and listeners filter on both before looking any further.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Marker on messages posted by the content relay.
pub const EXTENSION_SOURCE: &str = "mrm-extension";
/// Marker on messages posted by the page fetch bridge.
pub const PAGE_SOURCE: &str = "mrm-page";
pub const FETCH_REQUEST_TYPE: &str = "MRM_PAGE_FETCH_REQUEST";
pub const FETCH_RESPONSE_TYPE: &str = "MRM_PAGE_FETCH_RESPONSE";

/// Error code carried by the synthetic response the relay produces when the
/// page never answers.
pub const PAGE_FETCH_TIMEOUT: &str = "PAGE_FETCH_TIMEOUT";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("byte body contains a value outside 0..=255 at index {0}")]
    InvalidByte(usize),

    #[error("unexpected body for response type {expected:?}")]
    UnexpectedBody { expected: ResponseType },
}

/// How the page should hand the body back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Text,
    Json,
    #[default]
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Credentials {
    Include,
    SameOrigin,
    Omit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    Default,
    NoStore,
    Reload,
    NoCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    Cors,
    NoCors,
    SameOrigin,
}

/// Caller supplied fetch options. Unset fields fall back to the bridge defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOptions {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RequestMode>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: default_method(),
            headers: BTreeMap::new(),
            referrer: None,
            credentials: None,
            cache: None,
            mode: None,
        }
    }
}

impl FetchOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_referrer(mut self, referrer: &str) -> Self {
        self.referrer = Some(referrer.to_string());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The reduced option set forwarded to the page: only the method and the
    /// referrer survive, since the page supplies its own headers and cookies.
    pub fn for_page_context(&self) -> Self {
        Self {
            method: self.method.clone(),
            referrer: self
                .referrer
                .clone()
                .or_else(|| self.header("Referer").map(str::to_string)),
            ..Self::default()
        }
    }

    /// Merge these overrides over the page defaults
    /// (`credentials: include`, `cache: no-store`, `mode: cors`).
    pub fn resolve(&self) -> RequestInit {
        RequestInit {
            method: self.method.clone(),
            headers: self.headers.clone(),
            referrer: self.referrer.clone(),
            credentials: self.credentials.unwrap_or(Credentials::Include),
            cache: self.cache.unwrap_or(CacheMode::NoStore),
            mode: self.mode.unwrap_or(RequestMode::Cors),
        }
    }
}

/// Fully resolved request options as seen by a network stack.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestInit {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub referrer: Option<String>,
    pub credentials: Credentials,
    pub cache: CacheMode,
    pub mode: RequestMode,
}

/// Returns true when `message` is an object carrying the given markers.
pub fn is_tagged(message: &Value, source: &str, kind: &str) -> bool {
    message.get("source").and_then(Value::as_str) == Some(source)
        && message.get("type").and_then(Value::as_str) == Some(kind)
}

/// Best-effort extraction of the correlation id from any message.
pub fn request_id_of(message: &Value) -> Option<&str> {
    message.get("requestId").and_then(Value::as_str)
}

fn tag(mut message: Value, source: &str, kind: &str) -> Value {
    if let Value::Object(map) = &mut message {
        map.insert("source".to_string(), Value::String(source.to_string()));
        map.insert("type".to_string(), Value::String(kind.to_string()));
    }
    message
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub request_id: String,
    pub url: String,
    #[serde(default)]
    pub options: FetchOptions,
    #[serde(default)]
    pub want_body: bool,
    #[serde(default)]
    pub response_type: ResponseType,
}

impl ProxyRequest {
    pub fn to_message(&self) -> Value {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        tag(value, EXTENSION_SOURCE, FETCH_REQUEST_TYPE)
    }

    pub fn from_message(message: &Value) -> Result<Self, ProtocolError> {
        Ok(Self::deserialize(message)?)
    }
}

/// A response body after it has crossed the window bus.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyBody {
    Text(String),
    Json(Value),
    Bytes(Vec<u8>),
}

impl ProxyBody {
    /// Binary data travels as a plain array of numbers.
    fn to_wire(&self) -> Value {
        match self {
            ProxyBody::Text(text) => Value::String(text.clone()),
            ProxyBody::Json(value) => value.clone(),
            ProxyBody::Bytes(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        }
    }

    fn from_wire(value: Value, response_type: ResponseType) -> Result<Self, ProtocolError> {
        match (response_type, value) {
            (ResponseType::Json, value) => Ok(ProxyBody::Json(value)),
            (ResponseType::Bytes, Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    item.as_u64()
                        .and_then(|n| u8::try_from(n).ok())
                        .ok_or(ProtocolError::InvalidByte(i))
                })
                .collect::<Result<Vec<u8>, _>>()
                .map(ProxyBody::Bytes),
            (_, Value::String(text)) => Ok(ProxyBody::Text(text)),
            (expected, _) => Err(ProtocolError::UnexpectedBody { expected }),
        }
    }

    /// Flatten into raw bytes; JSON is re-serialized.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ProxyBody::Text(text) => text.into_bytes(),
            ProxyBody::Json(value) => serde_json::to_vec(&value).unwrap_or_default(),
            ProxyBody::Bytes(bytes) => bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireResponse", into = "WireResponse")]
pub struct ProxyResponse {
    pub request_id: String,
    pub ok: bool,
    pub status: Option<u16>,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<ProxyBody>,
    pub response_type: ResponseType,
    pub error: Option<String>,
}

impl ProxyResponse {
    /// A failed response with no HTTP status attached.
    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ok: false,
            status: None,
            status_text: String::new(),
            headers: Vec::new(),
            body: None,
            response_type: ResponseType::default(),
            error: Some(error.into()),
        }
    }

    pub fn timeout(request_id: impl Into<String>) -> Self {
        Self::failure(request_id, PAGE_FETCH_TIMEOUT)
    }

    pub fn is_timeout(&self) -> bool {
        !self.ok && self.error.as_deref() == Some(PAGE_FETCH_TIMEOUT)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn to_message(&self) -> Value {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        tag(value, PAGE_SOURCE, FETCH_RESPONSE_TYPE)
    }

    pub fn from_message(message: &Value) -> Result<Self, ProtocolError> {
        Ok(Self::deserialize(message)?)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(default)]
    status_text: String,
    #[serde(default)]
    headers: Vec<(String, String)>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    #[serde(default)]
    response_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// A `body` key that is present maps to `Some`, even when it holds `null`.
/// Only a missing key is `None`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<WireResponse> for ProxyResponse {
    type Error = ProtocolError;

    fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
        let body = match (wire.body, wire.response_type) {
            (None, _) => None,
            // `null` is a valid JSON document
            (Some(Value::Null), ResponseType::Json) => Some(ProxyBody::Json(Value::Null)),
            (Some(Value::Null), _) => None,
            (Some(value), response_type) => Some(ProxyBody::from_wire(value, response_type)?),
        };
        Ok(Self {
            request_id: wire.request_id,
            ok: wire.ok,
            status: wire.status,
            status_text: wire.status_text,
            headers: wire.headers,
            body,
            response_type: wire.response_type,
            error: wire.error,
        })
    }
}

impl From<ProxyResponse> for WireResponse {
    fn from(response: ProxyResponse) -> Self {
        Self {
            request_id: response.request_id,
            ok: response.ok,
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            body: response.body.as_ref().map(ProxyBody::to_wire),
            response_type: response.response_type,
            error: response.error,
        }
    }
}
