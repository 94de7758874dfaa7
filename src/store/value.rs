//! Typed field values and documents.
//!
//! Values are persisted and transmitted in a type-tagged wire form
//! (`{"stringValue": "..."}`, `{"integerValue": 3}`, ...). The tag is what lets
//! backends that only see untyped JSON compare values with the right semantics.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A primitive value stored in a document field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(DateTime<Utc>),
    String(String),
    Array(Vec<FieldValue>),
}

impl FieldValue {
    /// The wire tag naming this value's type.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Null => "nullValue",
            Self::Boolean(_) => "booleanValue",
            Self::Integer(_) => "integerValue",
            Self::Double(_) => "doubleValue",
            Self::Timestamp(_) => "timestampValue",
            Self::String(_) => "stringValue",
            Self::Array(_) => "arrayValue",
        }
    }

    /// Short type name used when a value is recorded as run input/output.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "bool",
            Self::Integer(_) => "int",
            Self::Double(_) => "float",
            Self::Timestamp(_) => "datetime",
            Self::String(_) => "str",
            Self::Array(_) => "array",
        }
    }

    /// Encode into the type-tagged wire form.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Null => json!({ "nullValue": null }),
            Self::Boolean(b) => json!({ "booleanValue": b }),
            Self::Integer(i) => json!({ "integerValue": i }),
            Self::Double(d) => json!({ "doubleValue": d }),
            Self::Timestamp(t) => json!({ "timestampValue": encode_timestamp(t) }),
            Self::String(s) => json!({ "stringValue": s }),
            Self::Array(values) => json!({
                "arrayValue": { "values": values.iter().map(FieldValue::to_wire).collect::<Vec<_>>() }
            }),
        }
    }

    /// Decode from the type-tagged wire form.
    ///
    /// Integers are accepted both as JSON numbers and as decimal strings, since
    /// some backends transmit 64-bit integers as strings.
    pub fn from_wire(value: &Value) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| format!("expected a tagged object, got {value}"))?;
        let (tag, inner) = object
            .iter()
            .next()
            .ok_or_else(|| "empty tagged object".to_string())?;

        match tag.as_str() {
            "nullValue" => Ok(Self::Null),
            "booleanValue" => inner
                .as_bool()
                .map(Self::Boolean)
                .ok_or_else(|| format!("bad boolean: {inner}")),
            "integerValue" => match inner {
                Value::Number(n) => n
                    .as_i64()
                    .map(Self::Integer)
                    .ok_or_else(|| format!("bad integer: {inner}")),
                Value::String(s) => s
                    .parse()
                    .map(Self::Integer)
                    .map_err(|e| format!("bad integer {s:?}: {e}")),
                _ => Err(format!("bad integer: {inner}")),
            },
            "doubleValue" => inner
                .as_f64()
                .map(Self::Double)
                .ok_or_else(|| format!("bad double: {inner}")),
            "timestampValue" => {
                let raw = inner
                    .as_str()
                    .ok_or_else(|| format!("bad timestamp: {inner}"))?;
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| Self::Timestamp(t.with_timezone(&Utc)))
                    .map_err(|e| format!("bad timestamp {raw:?}: {e}"))
            }
            "stringValue" => inner
                .as_str()
                .map(|s| Self::String(s.to_string()))
                .ok_or_else(|| format!("bad string: {inner}")),
            "arrayValue" => {
                let values = match inner.get("values") {
                    Some(Value::Array(values)) => values
                        .iter()
                        .map(FieldValue::from_wire)
                        .collect::<Result<Vec<_>, _>>()?,
                    // An empty array may arrive without a `values` member.
                    None => Vec::new(),
                    Some(other) => return Err(format!("bad array: {other}")),
                };
                Ok(Self::Array(values))
            }
            other => Err(format!("unknown value tag: {other}")),
        }
    }

    /// Compare two values of compatible types.
    ///
    /// Integers and doubles compare numerically with each other; any other
    /// pairing of distinct types is unordered.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Double(a), Self::Double(b)) => a.partial_cmp(b),
            (Self::Integer(a), Self::Double(b)) => (*a as f64).partial_cmp(b),
            (Self::Double(a), Self::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Array(a), Self::Array(b)) if a == b => Some(Ordering::Equal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Plain-text rendering, used for logs and error messages.
    pub fn display(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Double(d) => d.to_string(),
            Self::Timestamp(t) => encode_timestamp(t),
            Self::String(s) => s.clone(),
            Self::Array(values) => format!(
                "[{}]",
                values.iter().map(FieldValue::display).collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

/// Fixed-width RFC 3339 rendering so encoded timestamps sort lexicographically.
pub fn encode_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        FieldValue::from_wire(&value).map_err(D::Error::custom)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&String> for FieldValue {
    fn from(value: &String) -> Self {
        Self::String(value.clone())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<usize> for FieldValue {
    fn from(value: usize) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Field name to value mapping for a document body.
pub type Fields = BTreeMap<String, FieldValue>;

/// A stored record: an opaque id plus its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Encode the fields (not the id) as a wire-form JSON object.
    pub fn fields_to_wire(&self) -> Value {
        let map: Map<String, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_wire()))
            .collect();
        Value::Object(map)
    }

    /// Decode a wire-form JSON object of fields.
    pub fn from_wire(id: impl Into<String>, fields: &Value) -> Result<Self, String> {
        let object = fields
            .as_object()
            .ok_or_else(|| "document fields must be an object".to_string())?;
        let mut decoded = Fields::new();
        for (name, value) in object {
            let value =
                FieldValue::from_wire(value).map_err(|e| format!("field {name:?}: {e}"))?;
            decoded.insert(name.clone(), value);
        }
        Ok(Self::new(id, decoded))
    }
}
