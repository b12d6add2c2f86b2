//! Binary attachments.
//!
//! Binary data cannot be written in a text packet. Each blob is replaced by a placeholder
//! `{"_placeholder":true,"num":<n>}` and sent in its own binary frame right after the text packet,
//! `n` being the index of the blob in depth-first order.
use bytes::Bytes;

use crate::{errors::AttachmentError, value::Value};

const PLACEHOLDER: &str = "_placeholder";
const NUM: &str = "num";

fn placeholder(num: usize) -> Value {
    Value::Object(vec![
        (PLACEHOLDER.to_string(), Value::Bool(true)),
        (NUM.to_string(), Value::from(num as u64)),
    ])
}

/// Replace every [`Value::Binary`] with a placeholder.
/// Returns the rewritten value and the blobs in placeholder order.
pub fn extract(value: Value) -> (Value, Vec<Bytes>) {
    let mut attachments = Vec::new();
    let value = extract_inner(value, &mut attachments);
    (value, attachments)
}

fn extract_inner(value: Value, attachments: &mut Vec<Bytes>) -> Value {
    match value {
        Value::Binary(data) => {
            attachments.push(data);
            placeholder(attachments.len() - 1)
        }
        Value::Array(values) => Value::Array(
            values
                .into_iter()
                .map(|v| extract_inner(v, attachments))
                .collect(),
        ),
        Value::Object(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, extract_inner(v, attachments)))
                .collect(),
        ),
        value => value,
    }
}

/// Replace every placeholder with its blob.
///
/// A placeholder pointing after the end of `attachments` is an error.
pub fn resolve(value: Value, attachments: &[Bytes]) -> Result<Value, AttachmentError> {
    match value {
        Value::Object(entries) => match placeholder_num(&entries) {
            Some(num) => attachments
                .get(num)
                .cloned()
                .map(Value::Binary)
                .ok_or(AttachmentError::OutOfRange {
                    num,
                    len: attachments.len(),
                }),
            None => Ok(Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, resolve(v, attachments)?)))
                    .collect::<Result<_, AttachmentError>>()?,
            )),
        },
        Value::Array(values) => Ok(Value::Array(
            values
                .into_iter()
                .map(|v| resolve(v, attachments))
                .collect::<Result<_, _>>()?,
        )),
        value => Ok(value),
    }
}

fn placeholder_num(entries: &[(String, Value)]) -> Option<usize> {
    if entries.len() != 2 {
        return None;
    }
    let mut is_placeholder = false;
    let mut num = None;
    for (key, value) in entries {
        match (key.as_str(), value) {
            (PLACEHOLDER, Value::Bool(true)) => is_placeholder = true,
            (NUM, Value::Number(n)) => num = n.as_u64(),
            _ => (),
        }
    }
    if is_placeholder {
        num.and_then(|n| usize::try_from(n).ok())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::value::to_value;

    fn bin(data: &'static [u8]) -> Value {
        Value::Binary(Bytes::from_static(data))
    }

    #[test]
    fn extract_depth_first() {
        let value = Value::Array(vec![
            Value::from("event"),
            Value::Object(vec![
                ("a".into(), bin(&[1])),
                ("b".into(), Value::Array(vec![bin(&[2]), Value::Null])),
            ]),
            bin(&[3]),
        ]);
        let (text, bins) = extract(value.clone());
        assert_eq!(bins, vec![
            Bytes::from_static(&[1]),
            Bytes::from_static(&[2]),
            Bytes::from_static(&[3]),
        ]);
        assert_eq!(
            serde_json::to_value(&text).unwrap(),
            json!([
                "event",
                { "a": { "_placeholder": true, "num": 0 }, "b": [{ "_placeholder": true, "num": 1 }, null] },
                { "_placeholder": true, "num": 2 }
            ])
        );
        assert_eq!(resolve(text, &bins).unwrap(), value);
    }

    #[test]
    fn placeholder_text() {
        let (text, _) = extract(bin(&[1, 2]));
        assert_eq!(
            serde_json::to_string(&text).unwrap(),
            r#"{"_placeholder":true,"num":0}"#
        );
    }

    #[test]
    fn out_of_range_placeholder() {
        let value = to_value(&json!(["event", { "_placeholder": true, "num": 1 }])).unwrap();
        let err = resolve(value, &[Bytes::from_static(&[1])]).unwrap_err();
        assert_eq!(err, AttachmentError::OutOfRange { num: 1, len: 1 });
    }

    #[test]
    fn lookalike_objects_are_kept() {
        let data = json!([{ "_placeholder": false, "num": 0 }, { "num": 0 }]);
        let value = to_value(&data).unwrap();
        assert_eq!(resolve(value.clone(), &[]).unwrap(), value);
    }
}
