//! Mark codec: local marks ⇄ shared text attributes.
//!
//! Shared text formatting is a flat key → value map per character, so two
//! applications of the same mark type cannot coexist under one key. Types
//! that do not exclude themselves are therefore stored under a key carrying
//! a hash of the mark's content:
//!
//! ```text
//! strong                      → "strong"
//! comment { id: 1 }           → "comment--Xk3v9QzA"
//! comment { id: 2 }           → "comment--a0LpW1Ge"
//! ```
//!
//! Decoding strips the `--<hash>` suffix to recover the type name.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tandem_core::json::{attrs_to_json, json_to_attrs};
use tandem_core::{Attrs, Mark, Schema, SchemaError};

/// Display-only change-tracking mark; never written to the shared tree.
pub const CHANGE_MARK: &str = "ychange";

const HASH_LEN: usize = 8;
const HASH_SEPARATOR: &str = "--";

#[derive(Debug, Default, Clone)]
pub struct MarkCodec {
    /// Mark type → whether it may overlap itself.
    overlapping: HashMap<String, bool>,
}

impl MarkCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_overlapping(&mut self, schema: &Schema, type_name: &str) -> bool {
        if let Some(&cached) = self.overlapping.get(type_name) {
            return cached;
        }
        let overlapping = !schema.mark_excludes(type_name, type_name);
        self.overlapping.insert(type_name.to_string(), overlapping);
        overlapping
    }

    pub fn attribute_key(&mut self, schema: &Schema, mark: &Mark) -> String {
        if self.is_overlapping(schema, mark.type_name()) {
            format!("{}{HASH_SEPARATOR}{}", mark.type_name(), mark_hash(mark))
        } else {
            mark.type_name().to_string()
        }
    }

    /// Shared text attributes for a local mark set.
    pub fn encode(&mut self, schema: &Schema, marks: &[Mark]) -> Attrs {
        marks
            .iter()
            .filter(|mark| mark.type_name() != CHANGE_MARK)
            .map(|mark| (self.attribute_key(schema, mark), attrs_to_json(mark.attrs())))
            .collect()
    }
}

/// Mark type name of a shared attribute key.
pub fn decode_key(key: &str) -> &str {
    let len = key.len();
    if len < HASH_LEN + HASH_SEPARATOR.len() || !key.is_char_boundary(len - HASH_LEN) {
        return key;
    }
    let (head, hash) = key.split_at(len - HASH_LEN);
    let is_hash = hash
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=');
    match head.strip_suffix(HASH_SEPARATOR) {
        Some(name) if is_hash => name,
        _ => key,
    }
}

/// Local marks for a chunk's shared attributes. Null values are formatting
/// removals and carry no mark.
pub fn decode_marks(schema: &Schema, attrs: &Attrs) -> Result<Vec<Mark>, SchemaError> {
    attrs
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| schema.mark(decode_key(key), json_to_attrs(Some(value))))
        .collect()
}

/// Content hash of a mark: SHA-256 of its JSON, folded to 6 bytes, base64.
pub fn mark_hash(mark: &Mark) -> String {
    let digest = Sha256::digest(mark.to_json().to_string().as_bytes());
    let mut folded = [0u8; 6];
    for (i, byte) in digest.iter().enumerate() {
        folded[i % folded.len()] ^= byte;
    }
    STANDARD.encode(folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tandem_core::{MarkSpec, NodeSpec};

    fn schema() -> Schema {
        Schema::new(
            "doc",
            vec![
                NodeSpec::new("doc").content("block+"),
                NodeSpec::new("paragraph").content("inline*").group("block"),
            ],
            vec![
                MarkSpec::new("strong"),
                MarkSpec::new("comment").attr("id", Value::Null).excludes(""),
            ],
        )
        .unwrap()
    }

    fn comment(schema: &Schema, id: i64) -> Mark {
        schema.mark("comment", json_to_attrs(Some(&json!({"id": id})))).unwrap()
    }

    #[test]
    fn test_plain_mark_key() {
        let schema = schema();
        let strong = schema.mark("strong", Attrs::new()).unwrap();
        assert_eq!(MarkCodec::new().attribute_key(&schema, &strong), "strong");
    }

    #[test]
    fn test_overlapping_keys_differ_by_attrs() {
        let schema = schema();
        let mut codec = MarkCodec::new();
        let a = codec.attribute_key(&schema, &comment(&schema, 1));
        let b = codec.attribute_key(&schema, &comment(&schema, 2));
        assert_ne!(a, b);
        assert!(a.starts_with("comment--"));
        assert_eq!(a.len(), "comment--".len() + 8);
        assert_eq!(a, codec.attribute_key(&schema, &comment(&schema, 1)));
    }

    #[test]
    fn test_decode_key() {
        assert_eq!(decode_key("comment--Xk3v9Q+/"), "comment");
        assert_eq!(decode_key("strong"), "strong");
        assert_eq!(decode_key("a--b"), "a--b");
        assert_eq!(decode_key("comment--not a hash"), "comment--not a hash");
    }

    #[test]
    fn test_encode_decode_marks() {
        let schema = schema();
        let mut codec = MarkCodec::new();
        let marks = vec![
            schema.mark("strong", Attrs::new()).unwrap(),
            comment(&schema, 1),
            comment(&schema, 2),
        ];
        let attrs = codec.encode(&schema, &marks);
        assert_eq!(attrs.len(), 3);
        let mut decoded = decode_marks(&schema, &attrs).unwrap();
        decoded.sort_by_key(|m| m.attrs().get("id").and_then(Value::as_i64));
        assert_eq!(decoded.len(), 3);
        assert!(decoded.iter().all(|m| m.is_in_set(&marks)));
    }

    #[test]
    fn test_decode_skips_nulls_and_rejects_unknown() {
        let schema = schema();
        let mut attrs = Attrs::new();
        attrs.insert("strong".into(), Value::Null);
        assert!(decode_marks(&schema, &attrs).unwrap().is_empty());
        attrs.insert("underline".into(), json!({}));
        assert!(decode_marks(&schema, &attrs).is_err());
    }
}
