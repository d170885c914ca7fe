//! Host-side representation of values crossing the script/host bridge.
//!
//! `invoke` and `publish` payloads are walked into [`HostValue`] on the
//! engine thread before they reach the host; host replies travel back through
//! serde_v8. Unlike `serde_json::Value` it keeps
//! NaN and ±Infinity intact and remembers object key order.

use deno_core::v8;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Maximum nesting depth accepted for a bridge payload.
pub const MAX_VALUE_DEPTH: usize = 100;
/// Maximum estimated size in bytes accepted for a bridge payload.
pub const MAX_VALUE_BYTES: usize = 10 * 1024 * 1024; // 10MB

#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    /// `null` or `undefined`
    Null,
    Bool(bool),
    /// Integral number within i64 range
    Int(i64),
    /// Any other number, including NaN and ±Infinity
    Float(f64),
    String(String),
    Array(Vec<HostValue>),
    /// Object with insertion-ordered keys
    Object(IndexMap<String, HostValue>),
}

impl HostValue {
    /// Build an object value from key/value pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, HostValue)>,
    {
        HostValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integral numbers become `Int`; everything else, `-0` included, stays `Float`.
    pub fn from_number(value: f64) -> Self {
        if value.fract() == 0.0
            && value.is_finite()
            && value >= i64::MIN as f64
            && value <= i64::MAX as f64
            && !(value == 0.0 && value.is_sign_negative())
        {
            HostValue::Int(value as i64)
        } else {
            HostValue::Float(value)
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Int(i) => Some(*i as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Look up a property on an object value.
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        match self {
            HostValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Check depth and size limits before the value crosses the bridge.
    pub fn check_limits(&self) -> Result<(), String> {
        let mut tracker = LimitTracker::new(MAX_VALUE_DEPTH, MAX_VALUE_BYTES);
        self.track(&mut tracker)
    }

    fn track(&self, tracker: &mut LimitTracker) -> Result<(), String> {
        tracker.enter()?;
        match self {
            HostValue::Null => tracker.add_bytes(4)?,
            HostValue::Bool(_) => tracker.add_bytes(5)?,
            HostValue::Int(_) => tracker.add_bytes(20)?,
            HostValue::Float(_) => tracker.add_bytes(24)?,
            HostValue::String(s) => tracker.add_bytes(s.len())?,
            HostValue::Array(items) => {
                tracker.add_bytes(16)?;
                for item in items {
                    item.track(tracker)?;
                }
            }
            HostValue::Object(map) => {
                tracker.add_bytes(24)?;
                for (key, value) in map {
                    tracker.add_bytes(key.len())?;
                    value.track(tracker)?;
                }
            }
        }
        tracker.exit();
        Ok(())
    }

    /// Convert to JSON. Non-finite floats become `null`, as `JSON.stringify` does.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            HostValue::Null => serde_json::Value::Null,
            HostValue::Bool(b) => serde_json::Value::Bool(*b),
            HostValue::Int(i) => serde_json::Value::from(*i),
            HostValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            HostValue::String(s) => serde_json::Value::String(s.clone()),
            HostValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(HostValue::to_json).collect())
            }
            HostValue::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => HostValue::Int(i),
                None => HostValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => HostValue::String(s),
            serde_json::Value::Array(items) => {
                HostValue::Array(items.into_iter().map(HostValue::from).collect())
            }
            serde_json::Value::Object(map) => {
                HostValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        HostValue::Int(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Float(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_owned())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl Serialize for HostValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            HostValue::Null => serializer.serialize_none(),
            HostValue::Bool(b) => serializer.serialize_bool(*b),
            HostValue::Int(i) => serializer.serialize_i64(*i),
            HostValue::Float(f) => serializer.serialize_f64(*f),
            HostValue::String(s) => serializer.serialize_str(s),
            HostValue::Array(arr) => arr.serialize(serializer),
            HostValue::Object(obj) => obj.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for HostValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct HostValueVisitor;

        impl<'de> Visitor<'de> for HostValueVisitor {
            type Value = HostValue;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("null, bool, number, string, array, or object")
            }

            fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E> {
                Ok(HostValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E> {
                Ok(HostValue::Int(value))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
                if value <= i64::MAX as u64 {
                    Ok(HostValue::Int(value as i64))
                } else {
                    Ok(HostValue::Float(value as f64))
                }
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E> {
                Ok(HostValue::from_number(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E> {
                Ok(HostValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E> {
                Ok(HostValue::String(value))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(HostValue::Null)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                HostValue::deserialize(deserializer)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(HostValue::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut vec = Vec::new();
                while let Some(elem) = seq.next_element()? {
                    vec.push(elem);
                }
                Ok(HostValue::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut obj = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    obj.insert(key, value);
                }
                Ok(HostValue::Object(obj))
            }
        }

        deserializer.deserialize_any(HostValueVisitor)
    }
}

/// Convert a script value to a [`HostValue`].
///
/// Limits are checked during the walk, so a cyclic or deeply nested payload
/// fails before it can exhaust the engine thread's stack.
pub(crate) fn from_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Result<HostValue, String> {
    let mut ancestors = Vec::new();
    let mut tracker = LimitTracker::new(MAX_VALUE_DEPTH, MAX_VALUE_BYTES);
    from_v8_internal(scope, value, &mut ancestors, &mut tracker)
}

fn from_v8_internal<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    ancestors: &mut Vec<v8::Local<'s, v8::Object>>,
    tracker: &mut LimitTracker,
) -> Result<HostValue, String> {
    tracker.enter()?;

    let result = if value.is_null_or_undefined() {
        tracker.add_bytes(4)?;
        HostValue::Null
    } else if value.is_boolean() {
        tracker.add_bytes(5)?;
        HostValue::Bool(value.boolean_value(scope))
    } else if value.is_number() {
        let number = value
            .number_value(scope)
            .ok_or_else(|| "Failed to convert value to number".to_string())?;
        tracker.add_bytes(24)?;
        HostValue::from_number(number)
    } else if value.is_string() {
        let string = value
            .to_string(scope)
            .ok_or_else(|| "Failed to convert string".to_string())?;
        let text = string.to_rust_string_lossy(scope);
        tracker.add_bytes(text.len())?;
        HostValue::String(text)
    } else if value.is_big_int() {
        return Err("Cannot serialize BigInt".to_string());
    } else if value.is_function() {
        return Err("Cannot serialize function".to_string());
    } else if value.is_symbol() {
        return Err("Cannot serialize symbol".to_string());
    } else if let Ok(array) = v8::Local::<v8::Array>::try_from(value) {
        enter_object(ancestors, array.into())?;
        tracker.add_bytes(16)?;

        let mut items = Vec::new();
        for index in 0..array.length() {
            let item = array
                .get_index(scope, index)
                .ok_or_else(|| format!("Failed to get array index {}", index))?;
            items.push(from_v8_internal(scope, item, ancestors, tracker)?);
        }

        ancestors.pop();
        HostValue::Array(items)
    } else if let Ok(object) = v8::Local::<v8::Object>::try_from(value) {
        enter_object(ancestors, object)?;
        tracker.add_bytes(24)?;

        let names = object
            .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
            .ok_or_else(|| "Failed to get property names".to_string())?;
        let mut map = IndexMap::new();
        for index in 0..names.length() {
            let key = names
                .get_index(scope, index)
                .ok_or_else(|| "Failed to get property name".to_string())?;
            let name = key
                .to_string(scope)
                .ok_or_else(|| "Failed to convert key to string".to_string())?
                .to_rust_string_lossy(scope);
            let property = object
                .get(scope, key)
                .ok_or_else(|| format!("Failed to get property '{}'", name))?;

            tracker.add_bytes(name.len())?;
            let converted = from_v8_internal(scope, property, ancestors, tracker)?;
            map.insert(name, converted);
        }

        ancestors.pop();
        HostValue::Object(map)
    } else {
        let kind = value.type_of(scope).to_rust_string_lossy(scope);
        return Err(format!("Cannot serialize value of type {}", kind));
    };

    tracker.exit();
    Ok(result)
}

fn enter_object<'s>(
    ancestors: &mut Vec<v8::Local<'s, v8::Object>>,
    object: v8::Local<'s, v8::Object>,
) -> Result<(), String> {
    if ancestors
        .iter()
        .any(|ancestor| ancestor.strict_equals(object.into()))
    {
        return Err("Cannot serialize circular reference".to_string());
    }
    ancestors.push(object);
    Ok(())
}

/// Tracks depth and size while walking a value.
pub struct LimitTracker {
    max_depth: usize,
    max_bytes: usize,
    current_depth: usize,
    current_bytes: usize,
}

impl LimitTracker {
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            max_depth,
            max_bytes,
            current_depth: 0,
            current_bytes: 0,
        }
    }

    /// Enter a new depth level.
    pub fn enter(&mut self) -> Result<(), String> {
        self.current_depth += 1;
        if self.current_depth > self.max_depth {
            return Err(format!(
                "Depth exceeded maximum limit of {}",
                self.max_depth
            ));
        }
        Ok(())
    }

    pub fn exit(&mut self) {
        self.current_depth = self.current_depth.saturating_sub(1);
    }

    pub fn add_bytes(&mut self, bytes: usize) -> Result<(), String> {
        self.current_bytes += bytes;
        if self.current_bytes > self.max_bytes {
            return Err(format!(
                "Size ({} bytes) exceeded maximum limit of {} bytes",
                self.current_bytes, self.max_bytes
            ));
        }
        Ok(())
    }
}
