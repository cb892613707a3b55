//! # Property Bag
//!
//! Per-step, ordered key/value store through which components hand data to
//! the components that run after them (resolved addresses, response status,
//! response body, live response handles, ...).
//!
//! ## Two tiers of values
//!
//! - [`SerializableValue`]: strings, byte arrays, string lists, numbers,
//!   booleans and JSON documents. These survive serialization of the session.
//! - Non-serializable handles: any `Arc<dyn Any + Send + Sync>`, for example a
//!   captured response object. They are only visible in memory, during the run,
//!   and are dropped when the session is serialized.
//!
//! Both tiers live in the same ordered list so that insertion order and
//! lookup stay uniform.
//!
//! ## Example:
//!
//! ```ignore
//! let mut bag = PropertyBag::new();
//! bag.set(keys::HTTP_RESPONSE_STATUS, 200u16);
//! assert_eq!(bag.get::<u16>(keys::HTTP_RESPONSE_STATUS), Some(200));
//! assert_eq!(bag.get::<String>(keys::HTTP_RESPONSE_STATUS), None); // type mismatch
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Well-known property keys written by the stock components.
pub mod keys {
    /// `Vec<String>`: addresses the URL host resolved to.
    pub const DNS_RESOLVED_IP_ADDRESSES: &str = "DnsResolvedIPAddresses";
    /// `Vec<String>`: resolved addresses that accepted a TCP connection.
    pub const REACHABLE_IP_ADDRESSES: &str = "ReachableIPAddresses";
    /// `String`: absolute URI requested by this step.
    pub const HTTP_REQUEST_URI: &str = "HttpRequestUri";
    /// `String`: HTTP method used by this step.
    pub const HTTP_REQUEST_METHOD: &str = "HttpRequestMethod";
    /// `u16`: response status code.
    pub const HTTP_RESPONSE_STATUS: &str = "HttpResponseStatus";
    /// JSON object: response headers, name -> value.
    pub const HTTP_RESPONSE_HEADERS: &str = "HttpResponseHeaders";
    /// `String`: response body decoded as text.
    pub const HTTP_RESPONSE_CONTENT: &str = "HttpResponseContent";
    /// `String`: absolute target of a followed redirect.
    pub const HTTP_REDIRECT_LOCATION: &str = "HttpRedirectLocation";
    /// `u64`: redirect hop index, 0 for the initial request.
    pub const HTTP_REDIRECT_HOP: &str = "HttpRedirectHop";
    /// Non-serializable [`crate::senders::HttpResponse`] of the final hop.
    pub const HTTP_RESPONSE_MESSAGE: &str = "HttpResponseMessage";
    /// `String`: rendered page source captured by the browser sender.
    pub const BROWSER_PAGE_CONTENT: &str = "BrowserPageContent";
    /// `String`: URL the browser ended up on.
    pub const BROWSER_FINAL_URL: &str = "BrowserFinalUrl";
}

// ============================================================================
// VALUES
// ============================================================================

/// Values that can be persisted or transmitted with the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SerializableValue {
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    TextList(Vec<String>),
    Integer(i64),
    Boolean(bool),
    Json(Value),
}

/// A property value: serializable, or an in-memory handle.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Serializable(SerializableValue),
    NonSerializable(Arc<dyn Any + Send + Sync>),
}

impl PropertyValue {
    pub fn is_serializable(&self) -> bool {
        matches!(self, Self::Serializable(_))
    }

    pub fn as_serializable(&self) -> Option<&SerializableValue> {
        match self {
            Self::Serializable(value) => Some(value),
            Self::NonSerializable(_) => None,
        }
    }
}

impl From<SerializableValue> for PropertyValue {
    fn from(value: SerializableValue) -> Self {
        Self::Serializable(value)
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        SerializableValue::Text(value).into()
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        SerializableValue::Text(value.to_string()).into()
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(value: Vec<u8>) -> Self {
        SerializableValue::Bytes(value).into()
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        SerializableValue::TextList(value).into()
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        SerializableValue::Integer(value).into()
    }
}

impl From<u16> for PropertyValue {
    fn from(value: u16) -> Self {
        SerializableValue::Integer(i64::from(value)).into()
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        SerializableValue::Integer(i64::try_from(value).unwrap_or(i64::MAX)).into()
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        SerializableValue::Boolean(value).into()
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        SerializableValue::Json(value).into()
    }
}

/// Typed read access to serializable values. Returns `None` on type mismatch.
pub trait FromProperty: Sized {
    fn from_property(value: &SerializableValue) -> Option<Self>;
}

impl FromProperty for SerializableValue {
    fn from_property(value: &SerializableValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromProperty for String {
    fn from_property(value: &SerializableValue) -> Option<Self> {
        match value {
            SerializableValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromProperty for Vec<u8> {
    fn from_property(value: &SerializableValue) -> Option<Self> {
        match value {
            SerializableValue::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl FromProperty for Vec<String> {
    fn from_property(value: &SerializableValue) -> Option<Self> {
        match value {
            SerializableValue::TextList(items) => Some(items.clone()),
            _ => None,
        }
    }
}

impl FromProperty for i64 {
    fn from_property(value: &SerializableValue) -> Option<Self> {
        match value {
            SerializableValue::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

impl FromProperty for u16 {
    fn from_property(value: &SerializableValue) -> Option<Self> {
        match value {
            SerializableValue::Integer(n) => u16::try_from(*n).ok(),
            _ => None,
        }
    }
}

impl FromProperty for u64 {
    fn from_property(value: &SerializableValue) -> Option<Self> {
        match value {
            SerializableValue::Integer(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }
}

impl FromProperty for bool {
    fn from_property(value: &SerializableValue) -> Option<Self> {
        match value {
            SerializableValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromProperty for Value {
    fn from_property(value: &SerializableValue) -> Option<Self> {
        match value {
            SerializableValue::Json(v) => Some(v.clone()),
            _ => None,
        }
    }
}

// ============================================================================
// PROPERTY BAG
// ============================================================================

/// Ordered mapping from key to [`PropertyValue`]. A key appears at most once;
/// writing an existing key replaces the value in place, keeping its position.
#[derive(Debug, Clone, Default)]
pub struct PropertyBag {
    entries: Vec<(String, PropertyValue)>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Stores an in-memory handle. It is never serialized.
    pub fn set_handle<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.set_shared_handle(key, Arc::new(value));
    }

    pub fn set_shared_handle<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: Arc<T>) {
        self.set(key, PropertyValue::NonSerializable(value));
    }

    /// Typed read. `None` when the key is absent or holds another type.
    pub fn get<T: FromProperty>(&self, key: &str) -> Option<T> {
        self.value(key)
            .and_then(PropertyValue::as_serializable)
            .and_then(T::from_property)
    }

    pub fn get_or_default<T: FromProperty + Default>(&self, key: &str) -> T {
        self.get(key).unwrap_or_default()
    }

    /// Typed read of an in-memory handle.
    pub fn get_handle<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        match self.value(key)? {
            PropertyValue::NonSerializable(handle) => handle.clone().downcast::<T>().ok(),
            PropertyValue::Serializable(_) => None,
        }
    }

    pub fn value(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.value(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Only the entries that survive serialization, in insertion order.
    pub fn serializable(&self) -> impl Iterator<Item = (&str, &SerializableValue)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_serializable().map(|s| (k.as_str(), s)))
    }
}

impl Serialize for PropertyBag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let entries: Vec<_> = self.serializable().collect();
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (key, value) in entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PropertyBag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BagVisitor;

        impl<'de> Visitor<'de> for BagVisitor {
            type Value = PropertyBag;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of property values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut bag = PropertyBag::new();
                while let Some((key, value)) = access.next_entry::<String, SerializableValue>()? {
                    bag.set(key, value);
                }
                Ok(bag)
            }
        }

        deserializer.deserialize_map(BagVisitor)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
