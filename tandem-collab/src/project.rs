//! CRDT change projector: shared tree → local nodes.
//!
//! One recursive visitor covers live rendering and version rendering:
//!
//! ```text
//!                 ┌─ mapped & untouched ──► reuse cached Node
//! Element ────────┤
//!                 └─ otherwise ──► project children ──► schema.node()
//!                                        │                   │
//! Text ──► chunks ──► decode marks ──► text nodes      Err ──► Failed
//!                                                              │
//!                       live mode: parent deletes the child ◄──┘
//! ```
//!
//! In live mode the visitor also merges adjacent text runs written by this
//! replica into one run, and deletes shared nodes the schema rejects.
//!
//! Version mode runs over a scratch copy of the document rebuilt as the
//! listing snapshot saw it (see [`project_history`]): everything inserted by
//! the newer version and not yet deleted in the older one. Nothing is
//! written; visibility against the snapshot pair decides what is skipped
//! and how it is annotated.

use std::collections::HashSet;

use log::{debug, warn};
use serde_json::Value;
use tandem_core::json::json_to_attrs;
use tandem_core::{utf16_len, Node, Schema};
use yrs::{
    DeleteSet, ReadTxn, Snapshot, Text, Transact, TransactionMut, XmlElementRef, XmlFragmentRef,
    XmlTextRef,
};

use crate::error::BindingError;
use crate::mapping::Mapping;
use crate::marks::{decode_marks, CHANGE_MARK};
use crate::shared::{
    element_attrs, is_visible, materialize, text_chunks, text_chunks_between, text_len,
    to_yrs_attrs, ChangeKind, ClientId, NodeKey, SharedContainer, SharedNode,
};
use crate::version::{plain_annotation, ChangeAnnotator};

/// Outcome of projecting one shared node.
#[derive(Debug, Clone)]
pub enum Projection {
    Element(Node),
    Text(Vec<Node>),
    /// Not visible in either rendered version.
    Skipped,
    /// The schema rejected the node.
    Failed(String),
}

/// Snapshot pair for version rendering.
pub struct HistoryView<'a> {
    snapshot: &'a Snapshot,
    prev: &'a Snapshot,
    annotator: Option<&'a mut dyn ChangeAnnotator>,
}

impl<'a> HistoryView<'a> {
    pub fn new(
        snapshot: &'a Snapshot,
        prev: &'a Snapshot,
        annotator: Option<&'a mut dyn ChangeAnnotator>,
    ) -> Self {
        Self {
            snapshot,
            prev,
            annotator,
        }
    }

    /// Items that existed at `snapshot` and were not yet deleted at `prev`.
    pub fn listing(&self) -> Snapshot {
        Snapshot::new(self.snapshot.state_map.clone(), self.prev.delete_set.clone())
    }

    fn annotate(&mut self, kind: ChangeKind, id: &yrs::ID) -> Value {
        match self.annotator.as_mut() {
            Some(annotator) => annotator.annotate(kind, id),
            None => plain_annotation(kind),
        }
    }

    /// Change of an element item between the two versions, if any.
    fn change_of(&self, id: &yrs::ID) -> Option<ChangeKind> {
        if !is_visible(id, self.snapshot) {
            Some(ChangeKind::Removed)
        } else if !is_visible(id, self.prev) {
            Some(ChangeKind::Added)
        } else {
            None
        }
    }
}

pub struct ProjectContext<'a> {
    pub schema: &'a Schema,
    pub mapping: &'a mut Mapping,
    pub history: Option<HistoryView<'a>>,
    pub local_client: ClientId,
    visited: HashSet<NodeKey>,
}

impl<'a> ProjectContext<'a> {
    pub fn new(schema: &'a Schema, mapping: &'a mut Mapping, local_client: ClientId) -> Self {
        Self {
            schema,
            mapping,
            history: None,
            local_client,
            visited: HashSet::new(),
        }
    }

    pub fn with_history(mut self, history: HistoryView<'a>) -> Self {
        self.history = Some(history);
        self
    }

    fn is_live(&self) -> bool {
        self.history.is_none()
    }
}

/// Project every child of `root` and return the content of the local top
/// node. In live mode the mapping is pruned to what was visited.
pub fn project_root(txn: &mut TransactionMut, root: &XmlFragmentRef, ctx: &mut ProjectContext<'_>) -> Vec<Node> {
    let container = SharedContainer::from(root.clone());
    ctx.visited.insert(container.key());
    let content = project_children(txn, &container, ctx);
    if ctx.is_live() {
        let visited = std::mem::take(&mut ctx.visited);
        ctx.mapping.retain(&visited);
        debug!("projected {} top-level nodes, {} mapped", content.len(), ctx.mapping.len());
    }
    content
}

/// Render `root` as of `snapshot`, annotating changes since `prev`.
///
/// The document behind `txn` is only read: the listing is rebuilt into a
/// scratch copy and projected there.
pub fn project_history<T: ReadTxn>(
    txn: &T,
    root: &XmlFragmentRef,
    schema: &Schema,
    snapshot: &Snapshot,
    prev: &Snapshot,
    annotator: Option<&mut dyn ChangeAnnotator>,
) -> Result<Vec<Node>, BindingError> {
    let listing = Snapshot::new(snapshot.state_map.clone(), prev.delete_set.clone());
    let (copy, copy_root) = materialize(txn, root, &listing)?;
    let annotator: Option<&mut dyn ChangeAnnotator> = match annotator {
        Some(annotator) => Some(annotator),
        None => None,
    };
    let client = copy.client_id();
    let mut mapping = Mapping::new();
    let mut copy_txn = copy.transact_mut();
    let mut ctx = ProjectContext::new(schema, &mut mapping, client)
        .with_history(HistoryView::new(snapshot, prev, annotator));
    Ok(project_root(&mut copy_txn, &copy_root, &mut ctx))
}

/// Project a single shared node.
pub fn project(txn: &mut TransactionMut, node: &SharedNode, ctx: &mut ProjectContext<'_>) -> Projection {
    if let (Some(history), Some(id)) = (&ctx.history, node.key().item_id()) {
        if !is_visible(id, history.snapshot) && !is_visible(id, history.prev) {
            return Projection::Skipped;
        }
    }
    match node {
        SharedNode::Element(el) => project_element(txn, el, ctx),
        SharedNode::Text(text) => project_text(txn, text, ctx),
    }
}

fn project_children(
    txn: &mut TransactionMut,
    container: &SharedContainer,
    ctx: &mut ProjectContext<'_>,
) -> Vec<Node> {
    let mut children = container.children(&*txn);
    let mut content = Vec::new();
    let mut index = 0;
    while index < children.len() {
        let child = children[index].clone();
        if ctx.is_live() {
            if let SharedNode::Text(text) = &child {
                coalesce_runs(txn, container, &mut children, index, text, ctx);
            }
        }
        match project(txn, &child, ctx) {
            Projection::Element(node) => content.push(node),
            Projection::Text(nodes) => content.extend(nodes),
            Projection::Skipped => {}
            Projection::Failed(reason) => {
                ctx.mapping.remove(&child.key());
                if ctx.is_live() {
                    warn!("deleting shared node {:?} rejected by schema: {}", child.key(), reason);
                    container.remove_range(txn, index as u32, 1);
                    children.remove(index);
                    continue;
                }
            }
        }
        index += 1;
    }
    content
}

/// Move the content of following text runs written by this replica into
/// `text` and delete them.
fn coalesce_runs(
    txn: &mut TransactionMut,
    container: &SharedContainer,
    children: &mut Vec<SharedNode>,
    index: usize,
    text: &XmlTextRef,
    ctx: &mut ProjectContext<'_>,
) {
    loop {
        let next = match children.get(index + 1) {
            Some(node @ SharedNode::Text(_)) if node.key().client() == Some(ctx.local_client) => node.clone(),
            _ => return,
        };
        if let SharedNode::Text(next_text) = &next {
            let mut offset = text_len(&*txn, text);
            for chunk in text_chunks(&*txn, next_text) {
                text.insert_with_attributes(txn, offset, &chunk.text, to_yrs_attrs(&chunk.attrs));
                offset += utf16_len(&chunk.text);
            }
        }
        debug!("merged text run {:?} into its left neighbour", next.key());
        ctx.mapping.remove(&next.key());
        container.remove_range(txn, (index + 1) as u32, 1);
        children.remove(index + 1);
    }
}

/// Mark the keys of a reused subtree as visited so pruning keeps them.
fn visit_subtree(txn: &TransactionMut, el: &XmlElementRef, visited: &mut HashSet<NodeKey>) {
    for child in SharedContainer::from(el.clone()).children(txn) {
        visited.insert(child.key());
        if let SharedNode::Element(inner) = &child {
            visit_subtree(txn, inner, visited);
        }
    }
}

fn project_element(txn: &mut TransactionMut, el: &XmlElementRef, ctx: &mut ProjectContext<'_>) -> Projection {
    let container = SharedContainer::from(el.clone());
    let key = container.key();
    ctx.visited.insert(key.clone());

    if ctx.is_live() {
        if let Some(node) = ctx.mapping.element(&key).cloned() {
            visit_subtree(txn, el, &mut ctx.visited);
            return Projection::Element(node);
        }
    }

    let content = project_children(txn, &container, ctx);
    let mut attrs = element_attrs(&*txn, el);
    if let (Some(history), Some(id)) = (ctx.history.as_mut(), key.item_id()) {
        if let Some(kind) = history.change_of(id) {
            attrs.insert(CHANGE_MARK.to_string(), history.annotate(kind, id));
        }
    }

    match ctx.schema.node(el.tag().as_ref(), attrs, content) {
        Ok(node) => {
            ctx.mapping.set_element(key, node.clone());
            Projection::Element(node)
        }
        Err(err) => Projection::Failed(err.to_string()),
    }
}

fn project_text(txn: &mut TransactionMut, text: &XmlTextRef, ctx: &mut ProjectContext<'_>) -> Projection {
    let key = SharedNode::Text(text.clone()).key();
    ctx.visited.insert(key.clone());

    let chunks = match &ctx.history {
        Some(history) => text_chunks_between(txn, text, history.snapshot, history.prev),
        None => text_chunks(&*txn, text),
    };
    let annotate = ctx.schema.has_mark_type(CHANGE_MARK);

    let mut nodes = Vec::with_capacity(chunks.len());
    for chunk in chunks.into_iter().filter(|chunk| !chunk.text.is_empty()) {
        let mut marks = match decode_marks(ctx.schema, &chunk.attrs) {
            Ok(marks) => marks,
            Err(err) => return Projection::Failed(err.to_string()),
        };
        if let (Some(change), Some(history), true) = (chunk.change, ctx.history.as_mut(), annotate) {
            let annotation = history.annotate(change.kind, &change.id);
            match ctx.schema.mark(CHANGE_MARK, json_to_attrs(Some(&annotation))) {
                Ok(mark) => marks.push(mark),
                Err(err) => return Projection::Failed(err.to_string()),
            }
        }
        match ctx.schema.text(chunk.text, marks) {
            Ok(node) => nodes.push(node),
            Err(err) => return Projection::Failed(err.to_string()),
        }
    }
    if ctx.is_live() {
        ctx.mapping.set_text(key, nodes.clone());
    }
    Projection::Text(nodes)
}

/// Listing snapshot for rendering `snapshot` against an empty history.
pub fn empty_prev() -> Snapshot {
    Snapshot::new(Default::default(), DeleteSet::default())
}
