//! Variant value used as the parameter and result container of every call.
//!
//! A [`Value`] is a plain sum type: the tag and the payload can never disagree, and
//! cloning always deep-copies strings, binaries and arrays. Numeric reads coerce
//! between `Bool`, `Int` and `Float`; strings, binaries and arrays never coerce.

mod convert;
mod text;

use std::fmt;
use std::ops::{Index, IndexMut};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::{BrokerError, Result};

pub use convert::{Binary, TypeTag, ValueType};
pub use text::deduce_type;

/// Runtime kind of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Invalid,
    Bool,
    Int,
    Float,
    String,
    Binary,
    Array,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Invalid => "invalid",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Binary => "binary",
            ValueKind::Array => "array",
        };
        f.write_str(name)
    }
}

/// Tagged variant value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Invalid,
    Bool(bool),
    Int(i32),
    Float(f32),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    /// Empty array value.
    pub fn array() -> Self {
        Value::Array(Vec::new())
    }

    /// Binary payload value.
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Binary(bytes.into())
    }

    /// Homogeneous array built from a slice of primitives.
    pub fn from_slice<T>(items: &[T]) -> Self
    where
        T: Clone + Into<Value>,
    {
        Value::Array(items.iter().cloned().map(Into::into).collect())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Invalid => ValueKind::Invalid,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Binary(_) => ValueKind::Binary,
            Value::Array(_) => ValueKind::Array,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Value::Invalid)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Element count of an array, byte length of a string or binary, 0 otherwise.
    pub fn size(&self) -> usize {
        match self {
            Value::Array(items) => items.len(),
            Value::String(s) => s.len(),
            Value::Binary(b) => b.len(),
            _ => 0,
        }
    }

    /// Drops the payload and resets the value to `Invalid`.
    pub fn clear(&mut self) {
        *self = Value::Invalid;
    }

    fn array_mut(&mut self, op: &str) -> Result<&mut Vec<Value>> {
        if let Value::Invalid = self {
            *self = Value::array();
        }
        match self {
            Value::Array(items) => Ok(items),
            other => Err(BrokerError::TypeMismatch(format!(
                "{} on a {} value, expected array",
                op,
                other.kind()
            ))),
        }
    }

    pub fn array_push(&mut self, item: impl Into<Value>) -> Result<()> {
        self.array_mut("array_push")?.push(item.into());
        Ok(())
    }

    pub fn array_pop(&mut self) -> Result<Option<Value>> {
        Ok(self.array_mut("array_pop")?.pop())
    }

    /// Resizes the array; new slots are filled with `Value::Invalid`.
    pub fn array_set_size(&mut self, len: usize) -> Result<()> {
        self.array_mut("array_set_size")?.resize(len, Value::Invalid);
        Ok(())
    }

    pub fn array_reserve(&mut self, additional: usize) -> Result<()> {
        self.array_mut("array_reserve")?.reserve(additional);
        Ok(())
    }

    /// Non-panicking element access.
    pub fn get(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Array(items) => items.get(index),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Result<&[Value]> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(mismatch(ValueKind::Array, other)),
        }
    }

    pub fn into_array(self) -> Result<Vec<Value>> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(mismatch(ValueKind::Array, &other)),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match *self {
            Value::Bool(b) => Ok(b),
            Value::Int(i) => Ok(i != 0),
            Value::Float(f) => Ok(f != 0.0),
            ref other => Err(mismatch(ValueKind::Bool, other)),
        }
    }

    /// Reads an integer; floats are truncated toward zero.
    pub fn as_int(&self) -> Result<i32> {
        match *self {
            Value::Int(i) => Ok(i),
            Value::Bool(b) => Ok(b as i32),
            Value::Float(f) => Ok(f as i32),
            ref other => Err(mismatch(ValueKind::Int, other)),
        }
    }

    pub fn as_float(&self) -> Result<f32> {
        match *self {
            Value::Float(f) => Ok(f),
            Value::Int(i) => Ok(i as f32),
            Value::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
            ref other => Err(mismatch(ValueKind::Float, other)),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(mismatch(ValueKind::String, other)),
        }
    }

    pub fn as_binary(&self) -> Result<&[u8]> {
        match self {
            Value::Binary(b) => Ok(b),
            other => Err(mismatch(ValueKind::Binary, other)),
        }
    }

    /// Base64 text of a binary payload.
    pub fn binary_to_base64(&self) -> Result<String> {
        Ok(general_purpose::STANDARD.encode(self.as_binary()?))
    }

    /// Decodes base64 text into a binary value.
    pub fn binary_from_base64(text: &str) -> Result<Value> {
        general_purpose::STANDARD
            .decode(text.trim())
            .map(Value::Binary)
            .map_err(|e| BrokerError::Parse(format!("invalid base64 payload: {}", e)))
    }

    /// Text form, see [`Value::from_text`] for the grammar.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        text::write_value(self, &mut out);
        out
    }

    /// Parses the text form produced by [`Value::to_text`].
    pub fn from_text(input: &str) -> Result<Value> {
        text::parse(input)
    }
}

fn mismatch(expected: ValueKind, found: &Value) -> BrokerError {
    BrokerError::TypeMismatch(format!("expected {}, found {}", expected, found.kind()))
}

impl Index<usize> for Value {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        match self {
            Value::Array(items) => &items[index],
            other => panic!("cannot index into a {} value", other.kind()),
        }
    }
}

impl IndexMut<usize> for Value {
    fn index_mut(&mut self, index: usize) -> &mut Value {
        match self {
            Value::Array(items) => &mut items[index],
            other => panic!("cannot index into a {} value", other.kind()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v as f32)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Value::Array(iter.into_iter().collect())
    }
}
