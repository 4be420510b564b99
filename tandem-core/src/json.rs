//! JSON encoding of nodes and marks.
//!
//! Shape:
//!
//! ```text
//! { "type": "paragraph", "attrs": {..}, "content": [..] }
//! { "type": "text", "text": "hi", "marks": [{ "type": "em", "attrs": {..} }] }
//! ```
//!
//! Empty `attrs`, `content` and `marks` are omitted.

use serde_json::{Map, Value};

use crate::node::{Attrs, Mark, Node};
use crate::schema::{Schema, SchemaError, TEXT_TYPE};

impl Mark {
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), Value::String(self.type_name().to_string()));
        if !self.attrs().is_empty() {
            obj.insert("attrs".into(), attrs_to_json(self.attrs()));
        }
        Value::Object(obj)
    }
}

impl Node {
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), Value::String(self.type_name().to_string()));
        if !self.attrs().is_empty() {
            obj.insert("attrs".into(), attrs_to_json(self.attrs()));
        }
        if let Some(text) = self.text() {
            obj.insert("text".into(), Value::String(text.to_string()));
        }
        if !self.content().is_empty() {
            obj.insert(
                "content".into(),
                Value::Array(self.content().iter().map(Node::to_json).collect()),
            );
        }
        if !self.marks().is_empty() {
            obj.insert(
                "marks".into(),
                Value::Array(self.marks().iter().map(Mark::to_json).collect()),
            );
        }
        Value::Object(obj)
    }
}

impl Schema {
    pub fn node_from_json(&self, json: &Value) -> Result<Node, SchemaError> {
        let obj = json
            .as_object()
            .ok_or_else(|| SchemaError::InvalidJson("node must be an object".into()))?;
        let type_name = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SchemaError::InvalidJson("node without `type`".into()))?;

        if type_name == TEXT_TYPE {
            let text = obj
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| SchemaError::InvalidJson("text node without `text`".into()))?;
            let marks = match obj.get("marks") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|item| self.mark_from_json(item))
                    .collect::<Result<Vec<_>, _>>()?,
                _ => Vec::new(),
            };
            return self.text(text, marks);
        }

        let content = match obj.get("content") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| self.node_from_json(item))
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        self.node(type_name, json_to_attrs(obj.get("attrs")), content)
    }

    pub fn mark_from_json(&self, json: &Value) -> Result<Mark, SchemaError> {
        let type_name = json
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SchemaError::InvalidJson("mark without `type`".into()))?;
        self.mark(type_name, json_to_attrs(json.get("attrs")))
    }
}

pub fn attrs_to_json(attrs: &Attrs) -> Value {
    Value::Object(attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// Attributes from an optional JSON object. Anything that is not an object
/// yields no attributes.
pub fn json_to_attrs(json: Option<&Value>) -> Attrs {
    match json {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => Attrs::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MarkSpec, NodeSpec};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(
            "doc",
            vec![
                NodeSpec::new("doc").content("block+"),
                NodeSpec::new("heading")
                    .content("inline*")
                    .group("block")
                    .attr("level", json!(1)),
            ],
            vec![MarkSpec::new("link").required_attr("href")],
        )
        .unwrap()
    }

    #[test]
    fn test_json_shape() {
        let schema = schema();
        let link = schema
            .mark("link", json_to_attrs(Some(&json!({"href": "x"}))))
            .unwrap();
        let h = schema
            .node(
                "heading",
                json_to_attrs(Some(&json!({"level": 2}))),
                vec![schema.text("hi", vec![link]).unwrap()],
            )
            .unwrap();
        assert_eq!(
            h.to_json(),
            json!({
                "type": "heading",
                "attrs": {"level": 2},
                "content": [{"type": "text", "text": "hi", "marks": [{"type": "link", "attrs": {"href": "x"}}]}]
            })
        );
    }

    #[test]
    fn test_from_json() {
        let schema = schema();
        let json = json!({"type": "doc", "content": [{"type": "heading", "content": [{"type": "text", "text": "a"}]}]});
        let doc = schema.node_from_json(&json).unwrap();
        assert_eq!(doc.child(0).unwrap().attr("level"), Some(&json!(1)));
        assert_eq!(schema.node_from_json(&doc.to_json()).unwrap(), doc);
    }

    #[test]
    fn test_from_json_errors() {
        let schema = schema();
        assert!(matches!(
            schema.node_from_json(&json!("doc")),
            Err(SchemaError::InvalidJson(_))
        ));
        assert!(matches!(
            schema.node_from_json(&json!({"type": "text", "text": "a", "marks": [{"type": "link"}]})),
            Err(SchemaError::MissingAttribute { .. })
        ));
    }
}
