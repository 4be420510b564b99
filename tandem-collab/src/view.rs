//! The host view a binding drives.
//!
//! A binding never owns the editor. It reads the current [`EditorState`]
//! through [`HostView`] and hands back complete [`ViewUpdate`]s; the host
//! decides how to apply them. [`HeadlessView`] is a host without any UI,
//! used by tests, benchmarks and server-side rendering.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;
use tandem_core::{EditorState, Node, Schema, Selection};

/// Metadata carried by a view update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateMeta {
    /// Whether the host should record the update in its own history.
    pub add_to_history: bool,
    /// The update was produced by the binding from the shared tree.
    pub is_change_origin: bool,
    /// The update reflects an undo or redo of the shared history.
    pub is_undo_redo: bool,
    /// A version snapshot is being rendered; local edits are not pushed.
    pub snapshot_active: bool,
    /// Entries queued through `Binding::set_meta`.
    pub extra: BTreeMap<String, Value>,
}

/// A state change requested by the binding.
#[derive(Debug, Clone, Default)]
pub struct ViewUpdate {
    /// Replacement document, if the content changed.
    pub doc: Option<Node>,
    /// Replacement selection. `None` leaves mapping the old selection to
    /// the host.
    pub selection: Option<Selection>,
    pub scroll_into_view: bool,
    pub meta: UpdateMeta,
}

/// The editor a binding is attached to.
pub trait HostView {
    fn state(&self) -> EditorState;

    fn schema(&self) -> Arc<Schema>;

    fn dispatch(&self, update: ViewUpdate);

    fn has_focus(&self) -> bool {
        false
    }

    /// Whether the local selection head is currently visible.
    fn selection_in_viewport(&self) -> bool {
        true
    }
}

/// A local change the host reports to the binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalChange {
    /// `false` keeps the change out of the shared undo history.
    pub add_to_history: bool,
}

impl LocalChange {
    pub fn tracked() -> Self {
        Self {
            add_to_history: true,
        }
    }

    pub fn untracked() -> Self {
        Self {
            add_to_history: false,
        }
    }
}

impl Default for LocalChange {
    fn default() -> Self {
        Self::tracked()
    }
}

// ───────────────────────────────────────────────────────────────────
// Headless host
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct HeadlessInner {
    schema: Arc<Schema>,
    state: EditorState,
    updates: Vec<ViewUpdate>,
    focused: bool,
    in_viewport: bool,
}

/// In-memory host. Cloning yields another handle to the same view.
#[derive(Debug, Clone)]
pub struct HeadlessView {
    inner: Rc<RefCell<HeadlessInner>>,
}

impl HeadlessView {
    pub fn new(schema: Arc<Schema>, doc: Node) -> Self {
        Self {
            inner: Rc::new(RefCell::new(HeadlessInner {
                schema,
                state: EditorState::new(doc),
                updates: Vec::new(),
                focused: true,
                in_viewport: true,
            })),
        }
    }

    /// A view showing the schema's empty document.
    pub fn empty(schema: Arc<Schema>) -> Result<Self, tandem_core::SchemaError> {
        let doc = schema.empty_doc()?;
        Ok(Self::new(schema, doc))
    }

    pub fn doc(&self) -> Node {
        self.inner.borrow().state.doc.clone()
    }

    pub fn selection(&self) -> Selection {
        self.inner.borrow().state.selection
    }

    /// Replace the document as a local edit would. The caller reports the
    /// change to the binding.
    pub fn edit(&self, doc: Node) {
        let mut inner = self.inner.borrow_mut();
        let selection = inner.state.selection.clamp(&doc);
        inner.state = EditorState::with_selection(doc, selection);
    }

    pub fn set_selection(&self, selection: Selection) {
        let mut inner = self.inner.borrow_mut();
        let selection = selection.clamp(&inner.state.doc);
        inner.state.selection = selection;
    }

    pub fn set_focus(&self, focused: bool) {
        self.inner.borrow_mut().focused = focused;
    }

    pub fn set_in_viewport(&self, in_viewport: bool) {
        self.inner.borrow_mut().in_viewport = in_viewport;
    }

    pub fn dispatch_count(&self) -> usize {
        self.inner.borrow().updates.len()
    }

    pub fn last_update(&self) -> Option<ViewUpdate> {
        self.inner.borrow().updates.last().cloned()
    }

    pub fn updates(&self) -> Vec<ViewUpdate> {
        self.inner.borrow().updates.clone()
    }
}

impl HostView for HeadlessView {
    fn state(&self) -> EditorState {
        self.inner.borrow().state.clone()
    }

    fn schema(&self) -> Arc<Schema> {
        self.inner.borrow().schema.clone()
    }

    fn dispatch(&self, update: ViewUpdate) {
        let mut inner = self.inner.borrow_mut();
        if let Some(doc) = &update.doc {
            inner.state.doc = doc.clone();
        }
        let selection = update.selection.unwrap_or(inner.state.selection);
        inner.state.selection = selection.clamp(&inner.state.doc);
        inner.updates.push(update);
    }

    fn has_focus(&self) -> bool {
        self.inner.borrow().focused
    }

    fn selection_in_viewport(&self) -> bool {
        self.inner.borrow().in_viewport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::NodeSpec;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(
                "doc",
                vec![
                    NodeSpec::new("doc").content("paragraph+"),
                    NodeSpec::new("paragraph").content("text*").group("block"),
                ],
                vec![],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_dispatch_replaces_doc_and_clamps_selection() {
        let schema = schema();
        let view = HeadlessView::empty(schema.clone()).unwrap();
        let text = schema.text("hello", vec![]).unwrap();
        let para = schema.node("paragraph", Default::default(), vec![text]).unwrap();
        let doc = schema.top_node(vec![para]).unwrap();
        view.edit(doc);
        view.set_selection(Selection::cursor(6));
        assert_eq!(view.selection().head, 6);

        view.dispatch(ViewUpdate {
            doc: Some(schema.empty_doc().unwrap()),
            ..Default::default()
        });
        assert_eq!(view.dispatch_count(), 1);
        assert_eq!(view.doc(), schema.empty_doc().unwrap());
        assert!(view.selection().head <= view.doc().content_size());
    }

    #[test]
    fn test_meta_recorded() {
        let view = HeadlessView::empty(schema()).unwrap();
        let mut meta = UpdateMeta {
            is_change_origin: true,
            ..Default::default()
        };
        meta.extra.insert("k".into(), Value::Bool(true));
        view.dispatch(ViewUpdate {
            meta: meta.clone(),
            ..Default::default()
        });
        assert_eq!(view.last_update().unwrap().meta, meta);
        assert!(view.has_focus());
    }
}
