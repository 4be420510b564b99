//! Position mapper: absolute local offsets ⇄ stable shared anchors.
//!
//! Local positions count boundaries the way local nodes do (a text character
//! is one unit, an element adds one unit for its opening and one for its
//! closing boundary). The shared tree only knows text lengths, so element
//! sizes come from the mapping table.
//!
//! ```text
//! offset ──to_anchor──► walk shared tree, consuming
//!                       text lengths / mapped element sizes
//!                              │
//!                              ▼
//!                       StickyIndex (item-relative or
//!                       container-edge + assoc)
//!                              │
//! offset ◄─to_offset─── resolve, then sum preceding sizes
//!                       on the way up to the root
//! ```
//!
//! An anchor whose target is gone resolves to `None`, which callers treat
//! as "no selection".

use tandem_core::{Node, Selection, SelectionKind};
use yrs::branch::Branch;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Assoc, IndexScope, IndexedSequence, ReadTxn, StickyIndex, TransactionMut, XmlFragmentRef};

use crate::error::BindingError;
use crate::mapping::Mapping;
use crate::shared::{text_len, NodeKey, SharedContainer, SharedNode};

/// A position in the shared tree that survives concurrent edits.
#[derive(Debug, Clone, PartialEq)]
pub struct Anchor(StickyIndex);

impl Anchor {
    pub fn sticky_index(&self) -> &StickyIndex {
        &self.0
    }

    pub fn encode(&self) -> Vec<u8> {
        self.0.encode_v1()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BindingError> {
        Ok(Anchor(StickyIndex::decode_v1(bytes)?))
    }
}

impl From<StickyIndex> for Anchor {
    fn from(index: StickyIndex) -> Self {
        Anchor(index)
    }
}

struct Frame {
    container: SharedContainer,
    children: Vec<SharedNode>,
    index: usize,
}

impl Frame {
    fn new<T: ReadTxn>(txn: &T, container: SharedContainer) -> Self {
        let children = container.children(txn);
        Self {
            container,
            children,
            index: 0,
        }
    }

    fn current(&self) -> Option<&SharedNode> {
        self.children.get(self.index)
    }

    fn has_next(&self) -> bool {
        self.index + 1 < self.children.len()
    }
}

/// Leave the current level until a next sibling exists. Every level left
/// consumes one closing boundary. Returns `false` once the root is left.
fn ascend(stack: &mut Vec<Frame>, pos: &mut i64) -> bool {
    loop {
        stack.pop();
        *pos -= 1;
        match stack.last_mut() {
            None => return false,
            Some(frame) if frame.has_next() => {
                frame.index += 1;
                return true;
            }
            Some(_) => {}
        }
    }
}

fn anchor_in(
    txn: &mut TransactionMut,
    container: &SharedContainer,
    index: u32,
    assoc: Assoc,
    root: &SharedContainer,
) -> Anchor {
    if let Some(sticky) = container.sticky_index(txn, index, assoc) {
        return Anchor(sticky);
    }
    root_edge(root, assoc)
}

fn root_edge(root: &SharedContainer, assoc: Assoc) -> Anchor {
    let name = match root.key() {
        NodeKey::Root(name) => name,
        NodeKey::Item(_) => std::sync::Arc::from(""),
    };
    Anchor(StickyIndex::new(IndexScope::Root(name), assoc))
}

fn end_of(txn: &mut TransactionMut, container: &SharedContainer, root: &SharedContainer) -> Anchor {
    let len = container.len(&*txn);
    anchor_in(txn, container, len, Assoc::After, root)
}

/// Anchor for local `offset`, walking the shared tree under `root`.
pub fn to_anchor(
    txn: &mut TransactionMut,
    root: &XmlFragmentRef,
    offset: u32,
    mapping: &Mapping,
) -> Anchor {
    let root = SharedContainer::from(root.clone());
    let assoc = if root.is_empty(&*txn) {
        Assoc::Before
    } else {
        Assoc::After
    };
    if offset == 0 {
        return anchor_in(txn, &root, 0, assoc, &root);
    }

    let mut pos = offset as i64;
    let mut stack = vec![Frame::new(&*txn, root.clone())];

    while let Some(node) = stack.last().and_then(Frame::current).cloned() {
        match &node {
            SharedNode::Text(text) => {
                let len = text_len(&*txn, text) as i64;
                if len >= pos {
                    return match text.sticky_index(txn, pos as u32, assoc) {
                        Some(sticky) => Anchor(sticky),
                        None => root_edge(&root, assoc),
                    };
                }
                pos -= len;
                let advanced = match stack.last_mut() {
                    Some(frame) if frame.has_next() => {
                        frame.index += 1;
                        true
                    }
                    _ => ascend(&mut stack, &mut pos),
                };
                if !advanced {
                    break;
                }
            }
            SharedNode::Element(el) => {
                let size = mapping.size(&node.key()) as i64;
                let element = SharedContainer::from(el.clone());
                let child_count = element.len(&*txn);
                if child_count > 0 && pos < size {
                    stack.push(Frame::new(&*txn, element));
                    pos -= 1;
                } else {
                    if pos == 1 && child_count == 0 && size > 1 {
                        return end_of(txn, &element, &root);
                    }
                    pos -= size;
                    let Some(frame) = stack.last_mut() else { break };
                    if frame.has_next() {
                        frame.index += 1;
                    } else {
                        if pos == 0 {
                            let container = frame.container.clone();
                            return end_of(txn, &container, &root);
                        }
                        if !ascend(&mut stack, &mut pos) {
                            break;
                        }
                    }
                }
            }
        }

        if pos == 0 {
            if let Some(frame) = stack.last() {
                if let Some(SharedNode::Element(_)) = frame.current() {
                    let container = frame.container.clone();
                    let index = frame.index as u32;
                    return anchor_in(txn, &container, index, Assoc::After, &root);
                }
            }
        }
    }

    let len = root.len(&*txn);
    anchor_in(txn, &root, len, assoc, &root)
}

fn child_size<T: ReadTxn>(txn: &T, child: &SharedNode, mapping: &Mapping) -> u32 {
    match child {
        SharedNode::Text(text) => text_len(txn, text),
        SharedNode::Element(_) => mapping.size(&child.key()),
    }
}

fn locate<T: ReadTxn>(
    txn: &T,
    children: &[SharedNode],
    target: &Branch,
    index: u32,
    base: u32,
    mapping: &Mapping,
) -> Option<u32> {
    let mut pos = base;
    for child in children {
        if child.is(target) {
            return Some(match child {
                SharedNode::Text(_) => pos + index,
                SharedNode::Element(el) => {
                    let inner = SharedContainer::from(el.clone()).children(txn);
                    pos + 1 + prefix_size(txn, &inner, index, mapping)
                }
            });
        }
        if let SharedNode::Element(el) = child {
            let inner = SharedContainer::from(el.clone()).children(txn);
            if !inner.is_empty() {
                if let Some(found) = locate(txn, &inner, target, index, pos + 1, mapping) {
                    return Some(found);
                }
            }
        }
        pos += child_size(txn, child, mapping);
    }
    None
}

fn prefix_size<T: ReadTxn>(txn: &T, children: &[SharedNode], index: u32, mapping: &Mapping) -> u32 {
    children
        .iter()
        .take(index as usize)
        .map(|child| child_size(txn, child, mapping))
        .sum()
}

/// Local offset of `anchor`, or `None` when its target is not reachable
/// from `root` (deleted, or part of another tree).
pub fn to_offset<T: ReadTxn>(
    txn: &T,
    root: &XmlFragmentRef,
    anchor: &Anchor,
    mapping: &Mapping,
) -> Option<u32> {
    let offset = anchor.0.get_offset(txn)?;
    let target: &Branch = &offset.branch;
    let root = SharedContainer::from(root.clone());
    let children = root.children(txn);
    if std::ptr::eq(root.branch(), target) {
        return Some(prefix_size(txn, &children, offset.index, mapping));
    }
    locate(txn, &children, target, offset.index, 0, mapping)
}

// ───────────────────────────────────────────────────────────────────
// Selection snapshots
// ───────────────────────────────────────────────────────────────────

/// A selection expressed in anchors, so it can be restored after the local
/// tree is rebuilt from a changed shared tree.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionSnapshot {
    pub kind: SelectionKind,
    pub anchor: Anchor,
    pub head: Anchor,
}

impl SelectionSnapshot {
    pub fn capture(
        txn: &mut TransactionMut,
        root: &XmlFragmentRef,
        selection: &Selection,
        mapping: &Mapping,
    ) -> Self {
        Self {
            kind: selection.kind,
            anchor: to_anchor(txn, root, selection.anchor, mapping),
            head: to_anchor(txn, root, selection.head, mapping),
        }
    }

    /// The selection in `doc`, or `None` when an anchor no longer resolves.
    pub fn restore<T: ReadTxn>(
        &self,
        txn: &T,
        root: &XmlFragmentRef,
        doc: &Node,
        mapping: &Mapping,
    ) -> Option<Selection> {
        let anchor = to_offset(txn, root, &self.anchor, mapping)?;
        let head = to_offset(txn, root, &self.head, mapping)?;
        match self.kind {
            SelectionKind::All => Some(Selection::all(doc)),
            SelectionKind::Node => Selection::node(doc, anchor),
            SelectionKind::Text => Some(Selection::text(anchor, head).clamp(doc)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::new_shared_doc;
    use tandem_core::{Attrs, NodeSpec, Schema};
    use yrs::{Text, Transact};

    fn schema() -> Schema {
        Schema::new(
            "doc",
            vec![
                NodeSpec::new("doc").content("block+"),
                NodeSpec::new("paragraph").content("inline*").group("block"),
            ],
            vec![],
        )
        .unwrap()
    }

    fn paragraph(schema: &Schema, text: &str) -> Node {
        let content = if text.is_empty() {
            vec![]
        } else {
            vec![schema.text(text, vec![]).unwrap()]
        };
        schema.node("paragraph", Attrs::new(), content).unwrap()
    }

    #[test]
    fn test_anchor_tracks_remote_insert() {
        let schema = schema();
        let doc = new_shared_doc(Some(1));
        let root = doc.get_or_insert_xml_fragment("prosemirror");
        let container = SharedContainer::from(root.clone());
        let mut mapping = Mapping::new();

        let mut txn = doc.transact_mut();
        let p = container.insert_element(&mut txn, 0, "paragraph");
        let text = SharedContainer::from(p.clone()).insert_text(&mut txn, 0);
        text.insert(&mut txn, 0, "hello");
        mapping.set_element(SharedNode::Element(p).key(), paragraph(&schema, "hello"));

        let anchor = to_anchor(&mut txn, &root, 3, &mapping);
        assert_eq!(to_offset(&txn, &root, &anchor, &mapping), Some(3));

        text.insert(&mut txn, 0, "XX");
        mapping.set_element(container.children(&txn)[0].key(), paragraph(&schema, "XXhello"));
        assert_eq!(to_offset(&txn, &root, &anchor, &mapping), Some(5));
    }

    #[test]
    fn test_anchor_between_blocks() {
        let schema = schema();
        let doc = new_shared_doc(Some(1));
        let root = doc.get_or_insert_xml_fragment("prosemirror");
        let container = SharedContainer::from(root.clone());
        let mut mapping = Mapping::new();

        let mut txn = doc.transact_mut();
        for (i, word) in ["ab", "cd"].iter().enumerate() {
            let p = container.insert_element(&mut txn, i as u32, "paragraph");
            let text = SharedContainer::from(p.clone()).insert_text(&mut txn, 0);
            text.insert(&mut txn, 0, word);
            mapping.set_element(SharedNode::Element(p).key(), paragraph(&schema, word));
        }

        // Offset 4 sits between the two paragraphs.
        let anchor = to_anchor(&mut txn, &root, 4, &mapping);
        assert_eq!(to_offset(&txn, &root, &anchor, &mapping), Some(4));
        // Offset 8 is the end of the document.
        let end = to_anchor(&mut txn, &root, 8, &mapping);
        assert_eq!(to_offset(&txn, &root, &end, &mapping), Some(8));
    }

    #[test]
    fn test_empty_root_anchor() {
        let doc = new_shared_doc(Some(1));
        let root = doc.get_or_insert_xml_fragment("prosemirror");
        let mapping = Mapping::new();
        let mut txn = doc.transact_mut();
        let anchor = to_anchor(&mut txn, &root, 0, &mapping);
        assert_eq!(to_offset(&txn, &root, &anchor, &mapping), Some(0));
    }

    #[test]
    fn test_deleted_target_is_unresolvable() {
        let schema = schema();
        let doc = new_shared_doc(Some(1));
        let root = doc.get_or_insert_xml_fragment("prosemirror");
        let container = SharedContainer::from(root.clone());
        let mut mapping = Mapping::new();

        let mut txn = doc.transact_mut();
        let p = container.insert_element(&mut txn, 0, "paragraph");
        let text = SharedContainer::from(p.clone()).insert_text(&mut txn, 0);
        text.insert(&mut txn, 0, "hello");
        mapping.set_element(SharedNode::Element(p).key(), paragraph(&schema, "hello"));
        let anchor = to_anchor(&mut txn, &root, 2, &mapping);

        container.remove_range(&mut txn, 0, 1);
        assert_eq!(to_offset(&txn, &root, &anchor, &mapping), None);
    }

    #[test]
    fn test_anchor_encoding() {
        let doc = new_shared_doc(Some(1));
        let root = doc.get_or_insert_xml_fragment("prosemirror");
        let mapping = Mapping::new();
        let mut txn = doc.transact_mut();
        let anchor = to_anchor(&mut txn, &root, 0, &mapping);
        assert_eq!(Anchor::decode(&anchor.encode()).unwrap(), anchor);
    }
}
