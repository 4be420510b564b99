//! Selections and the editor state a host view exposes.

use serde::{Deserialize, Serialize};

use crate::node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionKind {
    Text,
    Node,
    All,
}

/// A selection as absolute document positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub kind: SelectionKind,
    pub anchor: u32,
    pub head: u32,
}

impl Selection {
    pub fn text(anchor: u32, head: u32) -> Self {
        Self {
            kind: SelectionKind::Text,
            anchor,
            head,
        }
    }

    pub fn cursor(pos: u32) -> Self {
        Self::text(pos, pos)
    }

    /// Select the non-text node starting at `pos`.
    pub fn node(doc: &Node, pos: u32) -> Option<Self> {
        let node = doc.node_at(pos)?;
        if node.is_text() {
            return None;
        }
        Some(Self {
            kind: SelectionKind::Node,
            anchor: pos,
            head: pos + node.node_size(),
        })
    }

    pub fn all(doc: &Node) -> Self {
        Self {
            kind: SelectionKind::All,
            anchor: 0,
            head: doc.content_size(),
        }
    }

    /// Cursor at the first position inside the first textblock.
    pub fn at_start(doc: &Node) -> Self {
        let mut pos = 0;
        let mut node = doc;
        while let Some(first) = node.child(0) {
            if first.is_text() || first.is_leaf() {
                break;
            }
            pos += 1;
            node = first;
        }
        Self::cursor(pos)
    }

    pub fn from(&self) -> u32 {
        self.anchor.min(self.head)
    }

    pub fn to(&self) -> u32 {
        self.anchor.max(self.head)
    }

    pub fn is_empty(&self) -> bool {
        self.anchor == self.head
    }

    /// Keep the selection inside `doc`, degrading a node selection whose
    /// node is gone to a cursor.
    pub fn clamp(&self, doc: &Node) -> Self {
        let max = doc.content_size();
        match self.kind {
            SelectionKind::All => Self::all(doc),
            SelectionKind::Node => {
                Self::node(doc, self.anchor.min(max)).unwrap_or_else(|| Self::cursor(self.anchor.min(max)))
            }
            SelectionKind::Text => Self::text(self.anchor.min(max), self.head.min(max)),
        }
    }
}

/// Document plus selection, as seen by a host view.
#[derive(Debug, Clone, PartialEq)]
pub struct EditorState {
    pub doc: Node,
    pub selection: Selection,
}

impl EditorState {
    pub fn new(doc: Node) -> Self {
        let selection = Selection::at_start(&doc);
        Self { doc, selection }
    }

    pub fn with_selection(doc: Node, selection: Selection) -> Self {
        let selection = selection.clamp(&doc);
        Self { doc, selection }
    }
}
