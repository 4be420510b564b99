//! Adapter over the yrs XML types.
//!
//! Everything else in the crate talks to the shared tree through the types
//! here, so the yrs surface in use stays in one place:
//!
//! ```text
//! XmlFragmentRef ──► SharedContainer::Fragment
//! XmlElementRef  ──► SharedContainer::Element / SharedNode::Element
//! XmlTextRef     ──► SharedNode::Text ──► Vec<TextChunk>
//! Branch         ──► NodeKey (item id, or root name)
//! Snapshot       ──► materialize() ──► scratch Doc as of the snapshot
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Number, Value};
use tandem_core::Attrs;
use yrs::branch::Branch;
use yrs::types::text::{ChangeKind as YChangeKind, Diff, YChange};
use yrs::types::Attrs as YAttrs;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::{Encoder, EncoderV1};
use yrs::{
    Any, Assoc, BranchID, Doc, IndexedSequence, OffsetKind, Options, Out, ReadTxn, Snapshot,
    StickyIndex, Text, Transact, TransactionMut, Update, Xml, XmlElementPrelim, XmlElementRef,
    XmlFragment, XmlFragmentRef, XmlOut, XmlTextPrelim, XmlTextRef, ID,
};

use crate::error::BindingError;

pub type ClientId = yrs::block::ClientID;

/// Create a document suitable for binding: UTF-16 offsets so text lengths
/// agree with local node sizes, and no garbage collection so version
/// snapshots can still render deleted content.
pub fn new_shared_doc(client_id: Option<ClientId>) -> Doc {
    let mut options = match client_id {
        Some(id) => Options::with_client_id(id),
        None => Options::default(),
    };
    options.offset_kind = OffsetKind::Utf16;
    options.skip_gc = true;
    Doc::with_options(options)
}

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// Stable identity of a shared type: the id of the item holding it, or the
/// name of a root type. Survives merges and re-reads of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Root(Arc<str>),
    Item(ID),
}

impl NodeKey {
    pub fn of(branch: &Branch) -> Self {
        match branch.id() {
            BranchID::Nested(id) => NodeKey::Item(id),
            BranchID::Root(name) => NodeKey::Root(name),
        }
    }

    pub fn item_id(&self) -> Option<&ID> {
        match self {
            NodeKey::Item(id) => Some(id),
            NodeKey::Root(_) => None,
        }
    }

    /// Replica that created the node. Root types belong to nobody.
    pub fn client(&self) -> Option<ClientId> {
        self.item_id().map(|id| id.client)
    }
}

// ───────────────────────────────────────────────────────────────────
// Nodes and containers
// ───────────────────────────────────────────────────────────────────

/// A child of a shared container.
#[derive(Debug, Clone)]
pub enum SharedNode {
    Element(XmlElementRef),
    Text(XmlTextRef),
}

impl SharedNode {
    pub fn from_xml(out: XmlOut) -> Option<Self> {
        match out {
            XmlOut::Element(el) => Some(SharedNode::Element(el)),
            XmlOut::Text(text) => Some(SharedNode::Text(text)),
            XmlOut::Fragment(_) => None,
        }
    }

    pub fn key(&self) -> NodeKey {
        NodeKey::of(self.branch())
    }

    pub fn branch(&self) -> &Branch {
        match self {
            SharedNode::Element(el) => el.as_ref(),
            SharedNode::Text(text) => text.as_ref(),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, SharedNode::Text(_))
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            SharedNode::Element(el) => Some(el.tag().as_ref()),
            SharedNode::Text(_) => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.branch().is_deleted()
    }

    /// Whether the node is the very same shared type as `branch`.
    pub fn is(&self, branch: &Branch) -> bool {
        std::ptr::eq(self.branch(), branch)
    }
}

/// Something that holds an ordered list of shared nodes: the root fragment
/// or an element.
#[derive(Debug, Clone)]
pub enum SharedContainer {
    Fragment(XmlFragmentRef),
    Element(XmlElementRef),
}

impl SharedContainer {
    pub fn key(&self) -> NodeKey {
        NodeKey::of(self.branch())
    }

    pub fn branch(&self) -> &Branch {
        match self {
            SharedContainer::Fragment(frag) => frag.as_ref(),
            SharedContainer::Element(el) => el.as_ref(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            SharedContainer::Fragment(_) => None,
            SharedContainer::Element(el) => Some(el.tag().as_ref()),
        }
    }

    pub fn len<T: ReadTxn>(&self, txn: &T) -> u32 {
        match self {
            SharedContainer::Fragment(frag) => frag.len(txn),
            SharedContainer::Element(el) => el.len(txn),
        }
    }

    pub fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        self.len(txn) == 0
    }

    /// Live children in document order, in a single pass over the list.
    pub fn children<T: ReadTxn>(&self, txn: &T) -> Vec<SharedNode> {
        match self {
            SharedContainer::Fragment(frag) => frag.children(txn).filter_map(SharedNode::from_xml).collect(),
            SharedContainer::Element(el) => el.children(txn).filter_map(SharedNode::from_xml).collect(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.branch().is_deleted()
    }

    pub fn insert_element(&self, txn: &mut TransactionMut, index: u32, tag: &str) -> XmlElementRef {
        let prelim = XmlElementPrelim::empty(tag);
        match self {
            SharedContainer::Fragment(frag) => frag.insert(txn, index, prelim),
            SharedContainer::Element(el) => el.insert(txn, index, prelim),
        }
    }

    pub fn insert_text(&self, txn: &mut TransactionMut, index: u32) -> XmlTextRef {
        let prelim = XmlTextPrelim::new("");
        match self {
            SharedContainer::Fragment(frag) => frag.insert(txn, index, prelim),
            SharedContainer::Element(el) => el.insert(txn, index, prelim),
        }
    }

    pub fn remove_range(&self, txn: &mut TransactionMut, index: u32, len: u32) {
        if len == 0 {
            return;
        }
        match self {
            SharedContainer::Fragment(frag) => frag.remove_range(txn, index, len),
            SharedContainer::Element(el) => el.remove_range(txn, index, len),
        }
    }

    pub fn sticky_index(
        &self,
        txn: &mut TransactionMut,
        index: u32,
        assoc: Assoc,
    ) -> Option<StickyIndex> {
        match self {
            SharedContainer::Fragment(frag) => frag.sticky_index(txn, index, assoc),
            SharedContainer::Element(el) => el.sticky_index(txn, index, assoc),
        }
    }
}

impl From<XmlFragmentRef> for SharedContainer {
    fn from(frag: XmlFragmentRef) -> Self {
        SharedContainer::Fragment(frag)
    }
}

impl From<XmlElementRef> for SharedContainer {
    fn from(el: XmlElementRef) -> Self {
        SharedContainer::Element(el)
    }
}

// ───────────────────────────────────────────────────────────────────
// Attribute values
// ───────────────────────────────────────────────────────────────────

/// Integral numbers come back as JSON integers whatever peer wrote them,
/// so attribute equality does not flap between `1` and `1.0`.
pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => {
            if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                Value::from(*n as i64)
            } else {
                Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null)
            }
        }
        Any::BigInt(n) => Value::from(*n),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect::<Map<String, Value>>(),
        ),
    }
}

/// Largest integer a JavaScript peer reads back without loss.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Integers within the safe range are written as plain numbers, the way
/// JavaScript peers write them; only larger ones become `BigInt`.
pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i) => Any::Number(i as f64),
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect::<Vec<_>>().into()),
        Value::Object(map) => Any::Map(Arc::new(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect::<HashMap<String, Any>>(),
        )),
    }
}

/// A local value as it would read back from the shared tree.
pub fn normalize_json(value: &Value) -> Value {
    any_to_json(&json_to_any(value))
}

pub fn out_to_json(out: &Out) -> Value {
    match out {
        Out::Any(any) => any_to_json(any),
        _ => Value::Null,
    }
}

/// Attributes of an element, nulls dropped.
pub fn element_attrs<T: ReadTxn>(txn: &T, el: &XmlElementRef) -> Attrs {
    el.attributes(txn)
        .map(|(key, value)| (key.to_string(), out_to_json(&value)))
        .filter(|(_, value)| !value.is_null())
        .collect()
}

pub fn to_yrs_attrs(attrs: &Attrs) -> YAttrs {
    attrs
        .iter()
        .map(|(k, v)| (Arc::from(k.as_str()), json_to_any(v)))
        .collect()
}

// ───────────────────────────────────────────────────────────────────
// Text runs
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
        }
    }
}

/// Attribution of a chunk that differs between two versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkChange {
    pub kind: ChangeKind,
    pub id: ID,
}

impl From<YChange> for ChunkChange {
    fn from(change: YChange) -> Self {
        let kind = match change.kind {
            YChangeKind::Added => ChangeKind::Added,
            YChangeKind::Removed => ChangeKind::Removed,
        };
        ChunkChange { kind, id: change.id }
    }
}

/// A maximal run of characters sharing the same formatting attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    pub attrs: Attrs,
    pub change: Option<ChunkChange>,
}

fn chunks_from_diff(diff: Vec<Diff<YChange>>) -> Vec<TextChunk> {
    diff.into_iter()
        .filter_map(|d| {
            let text = match &d.insert {
                Out::Any(Any::String(s)) => s.to_string(),
                _ => return None,
            };
            let attrs = d
                .attributes
                .map(|attrs| {
                    attrs
                        .iter()
                        .map(|(k, v)| (k.to_string(), any_to_json(v)))
                        .filter(|(_, v)| !v.is_null())
                        .collect()
                })
                .unwrap_or_default();
            Some(TextChunk {
                text,
                attrs,
                change: d.ychange.map(ChunkChange::from),
            })
        })
        .collect()
}

pub fn text_chunks<T: ReadTxn>(txn: &T, text: &XmlTextRef) -> Vec<TextChunk> {
    chunks_from_diff(text.diff(txn, YChange::identity))
}

/// Chunks of `text` as visible in `hi`, with content that differs from
/// `lo` attributed via [`ChunkChange`].
pub fn text_chunks_between(
    txn: &mut TransactionMut,
    text: &XmlTextRef,
    hi: &Snapshot,
    lo: &Snapshot,
) -> Vec<TextChunk> {
    chunks_from_diff(text.diff_range(txn, Some(hi), Some(lo), YChange::identity))
}

pub fn text_len<T: ReadTxn>(txn: &T, text: &XmlTextRef) -> u32 {
    text.len(txn)
}

// ───────────────────────────────────────────────────────────────────
// History
// ───────────────────────────────────────────────────────────────────

pub fn is_visible(id: &ID, snapshot: &Snapshot) -> bool {
    snapshot.state_map.get(&id.client) > id.clock && !snapshot.delete_set.is_deleted(id)
}

/// Rebuild `root` as `snapshot` saw it, in a fresh document: every item
/// inserted before the snapshot's state vector, with only the snapshot's
/// deletions applied. Item ids are the same as in the source, so the copy
/// can be checked against other snapshots of the source.
///
/// The source must keep deleted content (see [`new_shared_doc`]).
pub fn materialize<T: ReadTxn>(
    txn: &T,
    root: &XmlFragmentRef,
    snapshot: &Snapshot,
) -> Result<(Doc, XmlFragmentRef), BindingError> {
    let mut encoder = EncoderV1::new();
    txn.encode_state_from_snapshot(snapshot, &mut encoder)?;
    let update = Update::decode_v1(&encoder.to_vec())?;

    let copy = new_shared_doc(None);
    copy.transact_mut()
        .apply_update(update)
        .map_err(|e| BindingError::Update(e.to_string()))?;
    let copy_root = match <XmlFragmentRef as AsRef<Branch>>::as_ref(root).id() {
        BranchID::Root(name) => copy.get_or_insert_xml_fragment(name.as_ref()),
        nested @ BranchID::Nested(_) => {
            let found = nested.get_branch(&copy.transact()).map(XmlFragmentRef::from);
            found.ok_or(BindingError::MissingRoot)?
        }
    };
    Ok((copy, copy_root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_any_json_numbers() {
        assert_eq!(any_to_json(&Any::Number(2.0)), json!(2));
        assert_eq!(any_to_json(&Any::Number(2.5)), json!(2.5));
        assert_eq!(json_to_any(&json!(3)), Any::Number(3.0));
        assert_eq!(json_to_any(&json!(-7)), Any::Number(-7.0));
        assert_eq!(json_to_any(&json!(1i64 << 60)), Any::BigInt(1 << 60));
        assert_eq!(any_to_json(&json_to_any(&json!(1i64 << 60))), json!(1i64 << 60));
        assert_eq!(any_to_json(&json_to_any(&json!({"a": [1, "x", null]}))), json!({"a": [1, "x", null]}));
    }

    #[test]
    fn test_container_children_and_keys() {
        let doc = new_shared_doc(Some(7));
        let root = doc.get_or_insert_xml_fragment("prosemirror");
        let container = SharedContainer::from(root);
        let mut txn = doc.transact_mut();
        let p = container.insert_element(&mut txn, 0, "paragraph");
        let text = SharedContainer::from(p.clone()).insert_text(&mut txn, 0);
        text.insert(&mut txn, 0, "hi");

        let children = container.children(&txn);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].tag(), Some("paragraph"));
        assert_eq!(children[0].key().client(), Some(7));
        assert_eq!(container.key(), NodeKey::Root(Arc::from("prosemirror")));
        assert!(children[0].is(p.as_ref()));
    }

    #[test]
    fn test_children_follow_document_order() {
        let doc = new_shared_doc(Some(3));
        let root = doc.get_or_insert_xml_fragment("prosemirror");
        let container = SharedContainer::from(root);
        let mut txn = doc.transact_mut();
        for i in 0..300u32 {
            let tag = if i % 2 == 0 { "even" } else { "odd" };
            container.insert_element(&mut txn, i, tag);
        }
        container.insert_text(&mut txn, 0);
        container.remove_range(&mut txn, 1, 100);

        let children = container.children(&txn);
        assert_eq!(children.len(), 201);
        assert!(children[0].is_text());
        assert_eq!(children[1].tag(), Some("even"));
        assert_eq!(children[2].tag(), Some("odd"));
        assert!(children.iter().all(|child| !child.is_deleted()));
        let clocks: Vec<_> = children[1..].iter().map(|c| c.key().item_id().map(|id| id.clock)).collect();
        assert!(clocks.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_text_chunks() {
        let doc = new_shared_doc(Some(1));
        let root = doc.get_or_insert_xml_fragment("prosemirror");
        let mut txn = doc.transact_mut();
        let text = SharedContainer::from(root).insert_text(&mut txn, 0);
        text.insert(&mut txn, 0, "hello");
        let mut bold = Attrs::new();
        bold.insert("strong".into(), json!({}));
        text.format(&mut txn, 0, 2, to_yrs_attrs(&bold));

        let chunks = text_chunks(&txn, &text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "he");
        assert_eq!(chunks[0].attrs, bold);
        assert!(chunks[1].attrs.is_empty());
    }

    #[test]
    fn test_materialize_keeps_what_the_snapshot_saw() {
        let doc = new_shared_doc(Some(1));
        let root = doc.get_or_insert_xml_fragment("prosemirror");
        let container = SharedContainer::from(root.clone());
        let before = {
            let mut txn = doc.transact_mut();
            container.insert_element(&mut txn, 0, "a");
            container.insert_element(&mut txn, 1, "b");
            txn.snapshot()
        };
        {
            let mut txn = doc.transact_mut();
            container.remove_range(&mut txn, 0, 1);
            container.insert_element(&mut txn, 1, "c");
        }
        assert_eq!(container.children(&doc.transact()).len(), 2);

        let (copy, copy_root) = materialize(&doc.transact(), &root, &before).unwrap();
        let txn = copy.transact();
        let children = SharedContainer::from(copy_root).children(&txn);
        let tags: Vec<_> = children.iter().map(|child| child.tag().map(str::to_string)).collect();
        assert_eq!(tags, vec![Some("a".to_string()), Some("b".to_string())]);
        let live = container.children(&doc.transact());
        assert_eq!(children[1].key(), live[0].key());
    }

    #[test]
    fn test_materialize_needs_deleted_content() {
        let mut options = Options::with_client_id(1);
        options.skip_gc = false;
        let doc = Doc::with_options(options);
        let root = doc.get_or_insert_xml_fragment("prosemirror");
        let snapshot = doc.transact().snapshot();
        assert!(materialize(&doc.transact(), &root, &snapshot).is_err());
    }
}
