//! One-shot conversions between local documents, JSON and shared trees,
//! for seeding documents and server-side processing without a view.

use serde_json::{Map, Value};
use tandem_core::{Node, Schema};
use yrs::{Doc, Transact, TransactionMut, XmlFragmentRef};

use crate::diff::{sync, SyncContext};
use crate::error::BindingError;
use crate::mapping::Mapping;
use crate::marks::{decode_key, MarkCodec};
use crate::project::{project_root, ProjectContext};
use crate::shared::{element_attrs, new_shared_doc, text_chunks, SharedContainer, SharedNode};

// ───────────────────────────────────────────────────────────────────
// Shared → local
// ───────────────────────────────────────────────────────────────────

/// Local nodes for the children of `fragment`. Content the schema rejects
/// is removed from the shared tree, as during live projection.
pub fn shared_to_local_fragment(
    txn: &mut TransactionMut,
    fragment: &XmlFragmentRef,
    schema: &Schema,
) -> Vec<Node> {
    let mut mapping = Mapping::new();
    let client = txn.doc().client_id();
    project_root(txn, fragment, &mut ProjectContext::new(schema, &mut mapping, client))
}

/// The schema's top node holding the children of `fragment`.
pub fn shared_to_local_root(
    txn: &mut TransactionMut,
    fragment: &XmlFragmentRef,
    schema: &Schema,
) -> Result<Node, BindingError> {
    Ok(schema.top_node(shared_to_local_fragment(txn, fragment, schema))?)
}

/// Initial local document for `fragment`, with the mapping a binding
/// created through [`Binding::with_mapping`](crate::Binding::with_mapping)
/// can start from.
pub fn init_local_doc(
    doc: &Doc,
    fragment: &XmlFragmentRef,
    schema: &Schema,
) -> Result<(Node, Mapping), BindingError> {
    let mut mapping = Mapping::new();
    let mut txn = doc.transact_mut();
    let content = project_root(
        &mut txn,
        fragment,
        &mut ProjectContext::new(schema, &mut mapping, doc.client_id()),
    );
    let local = schema.top_node(content)?;
    mapping.set_element(SharedContainer::from(fragment.clone()).key(), local.clone());
    Ok((local, mapping))
}

/// Schema-free JSON of the shared tree under `fragment`, in the local node
/// JSON shape. Overlapping-mark keys are decoded back to type names.
pub fn fragment_to_json<T: yrs::ReadTxn>(txn: &T, fragment: &XmlFragmentRef) -> Value {
    let content = children_to_json(txn, &SharedContainer::from(fragment.clone()));
    let mut obj = Map::new();
    obj.insert("type".into(), Value::String("doc".into()));
    obj.insert("content".into(), Value::Array(content));
    Value::Object(obj)
}

fn children_to_json<T: yrs::ReadTxn>(txn: &T, container: &SharedContainer) -> Vec<Value> {
    let mut out = Vec::new();
    for child in container.children(txn) {
        match &child {
            SharedNode::Element(el) => {
                let mut obj = Map::new();
                obj.insert("type".into(), Value::String(el.tag().to_string()));
                let attrs = element_attrs(txn, el);
                if !attrs.is_empty() {
                    obj.insert("attrs".into(), Value::Object(attrs.into_iter().collect()));
                }
                let content = children_to_json(txn, &SharedContainer::from(el.clone()));
                if !content.is_empty() {
                    obj.insert("content".into(), Value::Array(content));
                }
                out.push(Value::Object(obj));
            }
            SharedNode::Text(text) => {
                for chunk in text_chunks(txn, text) {
                    let mut obj = Map::new();
                    obj.insert("type".into(), Value::String("text".into()));
                    obj.insert("text".into(), Value::String(chunk.text));
                    if !chunk.attrs.is_empty() {
                        let marks = chunk
                            .attrs
                            .iter()
                            .map(|(key, attrs)| {
                                let mut mark = Map::new();
                                mark.insert("type".into(), Value::String(decode_key(key).to_string()));
                                if attrs.as_object().is_some_and(|a| !a.is_empty()) {
                                    mark.insert("attrs".into(), attrs.clone());
                                }
                                Value::Object(mark)
                            })
                            .collect();
                        obj.insert("marks".into(), Value::Array(marks));
                    }
                    out.push(Value::Object(obj));
                }
            }
        }
    }
    out
}

// ───────────────────────────────────────────────────────────────────
// Local → shared
// ───────────────────────────────────────────────────────────────────

/// Write `local` into `fragment` with a fresh mapping.
pub fn local_to_fragment(
    txn: &mut TransactionMut,
    local: &Node,
    fragment: &XmlFragmentRef,
    schema: &Schema,
) -> Result<(), BindingError> {
    let mut mapping = Mapping::new();
    let mut codec = MarkCodec::new();
    sync(
        txn,
        &SharedContainer::from(fragment.clone()),
        local,
        &mut SyncContext {
            schema,
            mapping: &mut mapping,
            codec: &mut codec,
        },
    )?;
    Ok(())
}

/// A new shared document whose root `root_name` holds `local`.
pub fn local_to_shared_doc(local: &Node, schema: &Schema, root_name: &str) -> Result<Doc, BindingError> {
    let doc = new_shared_doc(None);
    let fragment = doc.get_or_insert_xml_fragment(root_name);
    {
        let mut txn = doc.transact_mut();
        local_to_fragment(&mut txn, local, &fragment, schema)?;
    }
    Ok(doc)
}

pub fn json_to_fragment(
    txn: &mut TransactionMut,
    json: &Value,
    fragment: &XmlFragmentRef,
    schema: &Schema,
) -> Result<(), BindingError> {
    let local = schema.node_from_json(json)?;
    local_to_fragment(txn, &local, fragment, schema)
}

pub fn json_to_shared_doc(json: &Value, schema: &Schema, root_name: &str) -> Result<Doc, BindingError> {
    let local = schema.node_from_json(json)?;
    local_to_shared_doc(&local, schema, root_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_core::json::json_to_attrs;
    use tandem_core::{MarkSpec, NodeSpec};

    fn schema() -> Schema {
        Schema::new(
            "doc",
            vec![
                NodeSpec::new("doc").content("block+"),
                NodeSpec::new("paragraph").content("text*").group("block"),
                NodeSpec::new("heading")
                    .content("text*")
                    .group("block")
                    .attr("level", json!(1)),
            ],
            vec![
                MarkSpec::new("bold"),
                MarkSpec::new("comment").attr("id", json!(0)).excludes(""),
            ],
        )
        .unwrap()
    }

    fn sample() -> Value {
        json!({
            "type": "doc",
            "content": [
                { "type": "heading", "attrs": { "level": 2 }, "content": [{ "type": "text", "text": "Title" }] },
                { "type": "paragraph", "content": [
                    { "type": "text", "text": "plain " },
                    { "type": "text", "text": "bold", "marks": [{ "type": "bold" }] }
                ]}
            ]
        })
    }

    #[test]
    fn test_json_through_shared_doc_and_back() {
        let schema = schema();
        let doc = json_to_shared_doc(&sample(), &schema, "prosemirror").unwrap();
        let fragment = doc.get_or_insert_xml_fragment("prosemirror");
        let (local, mapping) = init_local_doc(&doc, &fragment, &schema).unwrap();
        assert_eq!(local, schema.node_from_json(&sample()).unwrap());
        assert!(!mapping.is_empty());
        assert_eq!(local.to_json(), sample());
    }

    #[test]
    fn test_schema_free_json_decodes_overlap_keys() {
        let schema = schema();
        let comment = schema.mark("comment", json_to_attrs(Some(&json!({ "id": 4 })))).unwrap();
        let text = schema.text("note", vec![comment]).unwrap();
        let para = schema.node("paragraph", Default::default(), vec![text]).unwrap();
        let local = schema.top_node(vec![para]).unwrap();

        let doc = local_to_shared_doc(&local, &schema, "prosemirror").unwrap();
        let fragment = doc.get_or_insert_xml_fragment("prosemirror");
        let json = fragment_to_json(&doc.transact(), &fragment);
        let mark = &json["content"][0]["content"][0]["marks"][0];
        assert_eq!(mark["type"], "comment");
        assert_eq!(mark["attrs"]["id"], 4);
    }

    #[test]
    fn test_shared_root_conversion() {
        let schema = schema();
        let doc = json_to_shared_doc(&sample(), &schema, "r").unwrap();
        let fragment = doc.get_or_insert_xml_fragment("r");
        let mut txn = doc.transact_mut();
        let nodes = shared_to_local_fragment(&mut txn, &fragment, &schema);
        assert_eq!(nodes.len(), 2);
        let root = shared_to_local_root(&mut txn, &fragment, &schema).unwrap();
        assert_eq!(root.child_count(), 2);
    }
}
