//! Immutable document nodes and marks.
//!
//! A [`Node`] is a cheap-to-clone handle to an immutable tree. Edits build
//! new nodes that share every untouched subtree with the old revision, so
//! identity (`Node::ptr_eq`) is a valid "unchanged" test between revisions.
//!
//! Sizes follow the position model used throughout the workspace:
//!
//! ```text
//! text node        → length in UTF-16 code units
//! leaf element     → 1
//! element          → content size + 2 (opening and closing boundary)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Attribute map of nodes and marks. Ordered so equal maps compare and
/// serialize identically.
pub type Attrs = BTreeMap<String, Value>;

// ───────────────────────────────────────────────────────────────────
// Marks
// ───────────────────────────────────────────────────────────────────

/// Inline formatting applied to a text node.
#[derive(Debug, Clone)]
pub struct Mark {
    type_name: String,
    attrs: Attrs,
    rank: usize,
}

impl Mark {
    pub(crate) fn new(type_name: &str, attrs: Attrs, rank: usize) -> Self {
        Self {
            type_name: type_name.to_string(),
            attrs,
            rank,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    /// Position of the mark type in its schema; mark sets are sorted by it.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn is_in_set(&self, set: &[Mark]) -> bool {
        set.iter().any(|mark| mark == self)
    }

    /// Two mark sets are the same when they hold equal marks in the same order.
    pub fn same_set(a: &[Mark], b: &[Mark]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
    }
}

impl PartialEq for Mark {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.attrs == other.attrs
    }
}

impl Eq for Mark {}

// ───────────────────────────────────────────────────────────────────
// Nodes
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct NodeData {
    type_name: String,
    attrs: Attrs,
    content: Vec<Node>,
    text: Option<String>,
    marks: Vec<Mark>,
    leaf: bool,
    size: u32,
}

#[derive(Clone)]
pub struct Node(Arc<NodeData>);

impl Node {
    pub(crate) fn element(type_name: &str, attrs: Attrs, content: Vec<Node>, leaf: bool) -> Self {
        let content = join_text(content);
        let size = if leaf {
            1
        } else {
            content.iter().map(Node::node_size).sum::<u32>() + 2
        };
        Node(Arc::new(NodeData {
            type_name: type_name.to_string(),
            attrs,
            content,
            text: None,
            marks: Vec::new(),
            leaf,
            size,
        }))
    }

    pub(crate) fn text_node(text: String, marks: Vec<Mark>) -> Self {
        let size = utf16_len(&text);
        Node(Arc::new(NodeData {
            type_name: crate::schema::TEXT_TYPE.to_string(),
            attrs: Attrs::new(),
            content: Vec::new(),
            text: Some(text),
            marks,
            leaf: true,
            size,
        }))
    }

    pub fn type_name(&self) -> &str {
        &self.0.type_name
    }

    pub fn attrs(&self) -> &Attrs {
        &self.0.attrs
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.0.attrs.get(name)
    }

    pub fn content(&self) -> &[Node] {
        &self.0.content
    }

    pub fn child_count(&self) -> usize {
        self.0.content.len()
    }

    pub fn child(&self, index: usize) -> Option<&Node> {
        self.0.content.get(index)
    }

    /// Text of a text node.
    pub fn text(&self) -> Option<&str> {
        self.0.text.as_deref()
    }

    pub fn marks(&self) -> &[Mark] {
        &self.0.marks
    }

    pub fn is_text(&self) -> bool {
        self.0.text.is_some()
    }

    /// Leaf elements and text nodes have no children.
    pub fn is_leaf(&self) -> bool {
        self.0.leaf
    }

    pub fn node_size(&self) -> u32 {
        self.0.size
    }

    /// Size of the content between the node's boundaries.
    pub fn content_size(&self) -> u32 {
        if self.is_text() {
            self.0.size
        } else if self.0.leaf {
            0
        } else {
            self.0.size - 2
        }
    }

    /// Whether both handles point at the very same node.
    pub fn ptr_eq(a: &Node, b: &Node) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Stable address of the node, usable as a map key while the node lives.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Same type, attributes and marks; content is not compared.
    pub fn same_markup(&self, other: &Node) -> bool {
        self.type_name() == other.type_name()
            && self.attrs() == other.attrs()
            && Mark::same_set(self.marks(), other.marks())
    }

    /// Concatenated text of every descendant text node.
    pub fn text_content(&self) -> String {
        match self.text() {
            Some(text) => text.to_string(),
            None => self.content().iter().map(Node::text_content).collect(),
        }
    }

    /// A copy with new content. Content types are not re-validated; callers
    /// only pass children that were accepted by the schema for this type.
    pub fn with_content(&self, content: Vec<Node>) -> Node {
        Node::element(self.type_name(), self.attrs().clone(), content, self.0.leaf)
    }

    pub fn replace_child(&self, index: usize, child: Node) -> Node {
        let mut content = self.0.content.clone();
        if index < content.len() {
            content[index] = child;
        }
        self.with_content(content)
    }

    pub fn insert_child(&self, index: usize, child: Node) -> Node {
        let mut content = self.0.content.clone();
        content.insert(index.min(content.len()), child);
        self.with_content(content)
    }

    pub fn remove_child(&self, index: usize) -> Node {
        let mut content = self.0.content.clone();
        if index < content.len() {
            content.remove(index);
        }
        self.with_content(content)
    }

    /// A text node with the same marks and different text.
    pub fn with_text(&self, text: impl Into<String>) -> Node {
        Node::text_node(text.into(), self.0.marks.clone())
    }

    /// Child index and start offset for a content position.
    pub fn find_index(&self, pos: u32) -> (usize, u32) {
        if pos == 0 {
            return (0, 0);
        }
        if pos >= self.content_size() {
            return (self.child_count(), self.content_size());
        }
        let mut cur = 0;
        for (i, child) in self.content().iter().enumerate() {
            let end = cur + child.node_size();
            if end >= pos {
                return if end == pos { (i + 1, end) } else { (i, cur) };
            }
            cur = end;
        }
        (self.child_count(), cur)
    }

    /// The node starting at `pos`, or the text node containing it.
    pub fn node_at(&self, mut pos: u32) -> Option<&Node> {
        let mut node = self;
        loop {
            let (index, offset) = node.find_index(pos);
            let child = node.child(index)?;
            if offset == pos || child.is_text() {
                return Some(child);
            }
            pos -= offset + 1;
            node = child;
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Node::ptr_eq(self, other)
            || (self.0.type_name == other.0.type_name
                && self.0.text == other.0.text
                && self.0.attrs == other.0.attrs
                && Mark::same_set(&self.0.marks, &other.0.marks)
                && self.0.content == other.0.content)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(text) = self.text() {
            let mut closing = 0;
            for mark in self.marks().iter().rev() {
                write!(f, "{}(", mark.type_name())?;
                closing += 1;
            }
            write!(f, "{text:?}")?;
            for _ in 0..closing {
                write!(f, ")")?;
            }
            return Ok(());
        }
        write!(f, "{}", self.type_name())?;
        if !self.content().is_empty() {
            write!(f, "(")?;
            for (i, child) in self.content().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{child}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub fn utf16_len(text: &str) -> u32 {
    text.encode_utf16().count() as u32
}

fn join_text(content: Vec<Node>) -> Vec<Node> {
    let mut joined: Vec<Node> = Vec::with_capacity(content.len());
    for node in content {
        if let (Some(prev), Some(text)) = (joined.last(), node.text()) {
            if let Some(prev_text) = prev.text() {
                if Mark::same_set(prev.marks(), node.marks()) {
                    let merged = prev.with_text(format!("{prev_text}{text}"));
                    let last = joined.len() - 1;
                    joined[last] = merged;
                    continue;
                }
            }
        }
        joined.push(node);
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MarkSpec, NodeSpec, Schema};

    fn schema() -> Schema {
        Schema::new(
            "doc",
            vec![
                NodeSpec::new("doc").content("block+"),
                NodeSpec::new("paragraph").content("inline*").group("block"),
                NodeSpec::new("hard_break").group("inline").inline(),
            ],
            vec![MarkSpec::new("em")],
        )
        .unwrap()
    }

    fn para(schema: &Schema, text: &str) -> Node {
        let content = if text.is_empty() {
            vec![]
        } else {
            vec![schema.text(text, vec![]).unwrap()]
        };
        schema.node("paragraph", Attrs::new(), content).unwrap()
    }

    #[test]
    fn test_sizes() {
        let schema = schema();
        let br = schema.node("hard_break", Attrs::new(), vec![]).unwrap();
        let text = schema.text("ab", vec![]).unwrap();
        let p = schema.node("paragraph", Attrs::new(), vec![text, br]).unwrap();
        assert_eq!(p.node_size(), 5);
        assert_eq!(p.content_size(), 3);
        let doc = schema.top_node(vec![p]).unwrap();
        assert_eq!(doc.content_size(), 5);
    }

    #[test]
    fn test_utf16_size() {
        let schema = schema();
        let text = schema.text("a😀", vec![]).unwrap();
        assert_eq!(text.node_size(), 3);
    }

    #[test]
    fn test_adjacent_text_joined() {
        let schema = schema();
        let em = schema.mark("em", Attrs::new()).unwrap();
        let content = vec![
            schema.text("a", vec![]).unwrap(),
            schema.text("b", vec![]).unwrap(),
            schema.text("c", vec![em]).unwrap(),
        ];
        let p = schema.node("paragraph", Attrs::new(), content).unwrap();
        assert_eq!(p.child_count(), 2);
        assert_eq!(p.child(0).unwrap().text(), Some("ab"));
    }

    #[test]
    fn test_structural_sharing() {
        let schema = schema();
        let doc = schema
            .top_node(vec![para(&schema, "one"), para(&schema, "two")])
            .unwrap();
        let edited = doc.replace_child(1, para(&schema, "changed"));
        assert!(Node::ptr_eq(doc.child(0).unwrap(), edited.child(0).unwrap()));
        assert_ne!(doc, edited);
    }

    #[test]
    fn test_structural_equality() {
        let schema = schema();
        let a = schema.top_node(vec![para(&schema, "x")]).unwrap();
        let b = schema.top_node(vec![para(&schema, "x")]).unwrap();
        assert!(!Node::ptr_eq(&a, &b));
        assert_eq!(a, b);
    }

    #[test]
    fn test_node_at() {
        let schema = schema();
        let doc = schema
            .top_node(vec![para(&schema, "ab"), para(&schema, "cd")])
            .unwrap();
        assert_eq!(doc.node_at(0).unwrap().type_name(), "paragraph");
        assert_eq!(doc.node_at(1).unwrap().text(), Some("ab"));
        assert_eq!(doc.node_at(4).unwrap().text_content(), "cd");
        assert!(doc.node_at(8).is_none());
    }

    #[test]
    fn test_display() {
        let schema = schema();
        let em = schema.mark("em", Attrs::new()).unwrap();
        let p = schema
            .node("paragraph", Attrs::new(), vec![schema.text("hi", vec![em]).unwrap()])
            .unwrap();
        assert_eq!(p.to_string(), "paragraph(em(\"hi\"))");
    }
}
