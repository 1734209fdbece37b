//! Native type ↔ [`Value`] marshalling used at the dispatch boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Value;
use crate::{BrokerError, Result};

/// Type tag recorded in method descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    Void,
    Bool,
    Int,
    Float,
    String,
    Binary,
    Array,
    /// Dynamically typed, accepts any value.
    Value,
}

impl TypeTag {
    /// Whether an argument tagged `given` may be passed where `declared` is expected.
    /// A dynamic `Value` on either side is checked later, at unmarshalling.
    pub fn accepts(declared: TypeTag, given: TypeTag) -> bool {
        declared == given || declared == TypeTag::Value || given == TypeTag::Value
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeTag::Void => "void",
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::String => "string",
            TypeTag::Binary => "binary",
            TypeTag::Array => "array",
            TypeTag::Value => "value",
        };
        f.write_str(name)
    }
}

/// Native types that can travel as a method parameter or return value.
pub trait ValueType: Sized + Send + 'static {
    const TAG: TypeTag;

    fn from_value(value: &Value) -> Result<Self>;

    fn into_value(self) -> Value;
}

/// Owned binary payload; distinguishes raw bytes from `Vec<u8>` arrays of ints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binary(pub Vec<u8>);

impl ValueType for bool {
    const TAG: TypeTag = TypeTag::Bool;

    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool()
    }

    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}

impl ValueType for i32 {
    const TAG: TypeTag = TypeTag::Int;

    fn from_value(value: &Value) -> Result<Self> {
        value.as_int()
    }

    fn into_value(self) -> Value {
        Value::Int(self)
    }
}

impl ValueType for i64 {
    const TAG: TypeTag = TypeTag::Int;

    fn from_value(value: &Value) -> Result<Self> {
        value.as_int().map(i64::from)
    }

    fn into_value(self) -> Value {
        match i32::try_from(self) {
            Ok(v) => Value::Int(v),
            Err(_) => Value::Float(self as f32),
        }
    }
}

impl ValueType for f32 {
    const TAG: TypeTag = TypeTag::Float;

    fn from_value(value: &Value) -> Result<Self> {
        value.as_float()
    }

    fn into_value(self) -> Value {
        Value::Float(self)
    }
}

impl ValueType for f64 {
    const TAG: TypeTag = TypeTag::Float;

    fn from_value(value: &Value) -> Result<Self> {
        value.as_float().map(f64::from)
    }

    fn into_value(self) -> Value {
        Value::Float(self as f32)
    }
}

impl ValueType for String {
    const TAG: TypeTag = TypeTag::String;

    fn from_value(value: &Value) -> Result<Self> {
        value.as_str().map(str::to_string)
    }

    fn into_value(self) -> Value {
        Value::String(self)
    }
}

impl ValueType for Binary {
    const TAG: TypeTag = TypeTag::Binary;

    fn from_value(value: &Value) -> Result<Self> {
        value.as_binary().map(|b| Binary(b.to_vec()))
    }

    fn into_value(self) -> Value {
        Value::Binary(self.0)
    }
}

impl<T: ValueType> ValueType for Vec<T> {
    const TAG: TypeTag = TypeTag::Array;

    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_array()?
            .iter()
            .enumerate()
            .map(|(i, item)| {
                T::from_value(item).map_err(|e| match e {
                    BrokerError::TypeMismatch(msg) => {
                        BrokerError::TypeMismatch(format!("array element {}: {}", i, msg))
                    }
                    other => other,
                })
            })
            .collect()
    }

    fn into_value(self) -> Value {
        Value::Array(self.into_iter().map(ValueType::into_value).collect())
    }
}

impl ValueType for Value {
    const TAG: TypeTag = TypeTag::Value;

    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }

    fn into_value(self) -> Value {
        self
    }
}
