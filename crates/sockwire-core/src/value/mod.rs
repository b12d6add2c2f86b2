//! A binary-aware value tree.
//!
//! [`Value`] is the in-memory form of every Socket.IO payload. It looks like a JSON value with one
//! extra variant, [`Value::Binary`], which holds the byte blobs that are sent as attachments.
//!
//! * [`to_value`] and [`to_args`] serialize any `serde::Serialize` type into a tree. `bytes::Bytes`
//!   and every `serialize_bytes` call become [`Value::Binary`].
//! * [`from_value`] and [`from_args`] deserialize a tree back into any `serde::Deserialize` type.
//!
//! Event arguments follow the Socket.IO convention: a tuple is spread into several arguments,
//! anything else is sent as a single argument.
//!
//! ```rust
//! # use bytes::Bytes;
//! # use sockwire_core::value::{Value, to_args, from_args};
//! let args = to_args(&("hello", Bytes::from_static(&[1, 2]))).unwrap();
//! assert_eq!(args, vec![Value::from("hello"), Value::Binary(Bytes::from_static(&[1, 2]))]);
//!
//! let (msg, bin): (String, Bytes) = from_args(args).unwrap();
//! assert_eq!(msg, "hello");
//! assert_eq!(&bin[..], &[1, 2]);
//! ```
use std::fmt;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Number;

mod de;
mod ser;

pub use de::ArgsDeserializer;
pub use ser::ValueSerializer;

/// A JSON-like value that can hold raw binary data.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// `null`
    #[default]
    Null,
    /// A boolean
    Bool(bool),
    /// A number
    Number(Number),
    /// A string
    String(String),
    /// Raw binary data, sent as an attachment
    Binary(Bytes),
    /// An array
    Array(Vec<Value>),
    /// An object. Entries are kept in insertion order.
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Returns true if the value is or contains binary data.
    pub fn has_binary(&self) -> bool {
        match self {
            Value::Binary(_) => true,
            Value::Array(values) => values.iter().any(Value::has_binary),
            Value::Object(entries) => entries.iter().any(|(_, v)| v.has_binary()),
            _ => false,
        }
    }

    /// Get the inner string if the value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value of a key if the value is an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Returns true if the value is `null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}
impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}
impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}
impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value.into())
    }
}
impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Number(value.into())
    }
}
impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Binary(value)
    }
}
impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(values) => {
                Value::Array(values.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Error when converting to or from a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Error(String);

impl serde::ser::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Error(msg.to_string())
    }
}
impl serde::de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Error(msg.to_string())
    }
}

/// Serialize any data into a [`Value`].
pub fn to_value<T: ?Sized + Serialize>(data: &T) -> Result<Value, Error> {
    data.serialize(ValueSerializer)
}

/// Serialize any data into a list of event arguments.
///
/// * A tuple or a tuple struct is spread: `("a", 1)` gives two arguments.
/// * `()` gives no argument.
/// * Anything else is a single argument.
pub fn to_args<T: ?Sized + Serialize>(data: &T) -> Result<Vec<Value>, Error> {
    data.serialize(ser::ArgsSerializer)
}

/// Deserialize a [`Value`] into any deserializable data.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, Error> {
    T::deserialize(value)
}

/// Deserialize a list of event arguments.
///
/// It mirrors [`to_args`]: a tuple receives the arguments in order, anything else receives the
/// first argument.
pub fn from_args<T: DeserializeOwned>(args: Vec<Value>) -> Result<T, Error> {
    T::deserialize(ArgsDeserializer::new(args))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct File {
        name: String,
        #[serde(with = "bytes_field")]
        content: Vec<u8>,
        tags: Vec<String>,
        size: Option<u32>,
    }

    mod bytes_field {
        use bytes::Bytes;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
            ser.serialize_bytes(data)
        }
        pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
            Bytes::deserialize(de).map(|b| b.to_vec())
        }
    }

    #[test]
    fn bytes_become_binary() {
        let value = to_value(&Bytes::from_static(&[1, 2, 3])).unwrap();
        assert_eq!(value, Value::Binary(Bytes::from_static(&[1, 2, 3])));

        let file = File {
            name: "a.txt".into(),
            content: vec![4, 5],
            tags: vec!["x".into()],
            size: None,
        };
        let value = to_value(&file).unwrap();
        assert!(value.has_binary());
        assert_eq!(value.get("content"), Some(&Value::Binary(Bytes::from_static(&[4, 5]))));
        assert_eq!(value.get("size"), Some(&Value::Null));
        assert_eq!(from_value::<File>(value).unwrap(), file);
    }

    #[test]
    fn json_values() {
        let data = json!({ "a": [1, -2, 3.5, "four", null, true], "b": { "c": {} } });
        let value = to_value(&data).unwrap();
        assert_eq!(value, Value::from(data.clone()));
        assert!(!value.has_binary());
        assert_eq!(from_value::<serde_json::Value>(value).unwrap(), data);
    }

    #[test]
    fn args_are_spread_from_tuples() {
        assert_eq!(to_args(&("a", 1)).unwrap(), vec![Value::from("a"), Value::from(1u64)]);
        assert_eq!(to_args(&()).unwrap(), vec![]);
        assert_eq!(to_args(&vec![1, 2]).unwrap(), vec![Value::from(vec![
            Value::from(1u64),
            Value::from(2u64)
        ])]);
        assert_eq!(to_args(&json!({ "k": "v" })).unwrap().len(), 1);
        assert_eq!(to_args("str").unwrap(), vec![Value::from("str")]);
    }

    #[test]
    fn args_are_collected_into_tuples() {
        let args = vec![Value::from("a"), Value::from(1u64), Value::from(true)];
        let (a, b, c): (String, u8, bool) = from_args(args.clone()).unwrap();
        assert_eq!((a.as_str(), b, c), ("a", 1, true));

        let first: String = from_args(args).unwrap();
        assert_eq!(first, "a");

        let none: Option<String> = from_args(vec![]).unwrap();
        assert_eq!(none, None);
        from_args::<()>(vec![]).unwrap();
    }

    #[test]
    fn enums() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        enum Msg {
            Ping,
            Text(String),
            Move { x: i32, y: i32 },
        }
        for msg in [Msg::Ping, Msg::Text("hi".into()), Msg::Move { x: 1, y: -1 }] {
            let value = to_value(&msg).unwrap();
            assert_eq!(from_value::<Msg>(value).unwrap(), msg);
        }
        assert_eq!(to_value(&Msg::Ping).unwrap(), Value::from("Ping"));
    }

    #[test]
    fn wrong_type_is_an_error() {
        let err = from_value::<u32>(Value::from("nope")).unwrap_err();
        assert!(err.to_string().contains("invalid type"));
    }
}
