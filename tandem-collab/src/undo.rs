//! Undo history over a bound shared root.
//!
//! Wraps the engine's undo manager, tracking only the binding's tracked
//! origin (plus any configured extra origins). Each stack item carries the
//! binding's selection from just before the change; popping an item hands
//! that selection back to the binding for the next rebuild.
//!
//! ```text
//!   undo()/redo()
//!       │
//!       ├─ collect subjects: text runs and protected elements that hold
//!       │  content written by other replicas
//!       ├─ pop the stack item (engine inverse)
//!       └─ every subject the inverse removed and the delete filter refuses
//!          to let go is re-created with only the foreign content
//! ```
//!
//! The engine has no per-item delete hook, so the delete filter runs as
//! that protection pass around each pop.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::{Arc, PoisonError};

use log::{debug, warn};
use tandem_core::{utf16_len, Attrs};
use uuid::Uuid;
use yrs::undo::{Options, UndoManager};
use yrs::{Origin, ReadTxn, Snapshot, StateVector, Subscription, Text, Transact, TransactionMut, Xml};

use crate::binding::Binding;
use crate::position::SelectionSnapshot;
use crate::shared::{
    element_attrs, json_to_any, text_chunks_between, to_yrs_attrs, ClientId, NodeKey,
    SharedContainer, SharedNode, TextChunk,
};

/// Stack-item metadata: the selection to restore, per binding.
pub type SelectionMeta = HashMap<Uuid, SelectionSnapshot>;

/// What the delete filter is asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSubject {
    /// Element type name; `None` for a text run.
    pub type_name: Option<String>,
    /// Characters and elements inside written by other replicas.
    pub foreign_len: u32,
}

impl FilterSubject {
    pub fn is_text(&self) -> bool {
        self.type_name.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.foreign_len == 0
    }
}

/// Returns `true` when an undo or redo may remove the subject.
pub type DeleteFilter = Arc<dyn Fn(&FilterSubject) -> bool + Send + Sync>;

/// Only empty subjects may be removed.
pub fn default_delete_filter() -> DeleteFilter {
    Arc::new(|subject: &FilterSubject| subject.is_empty())
}

#[derive(Clone)]
pub struct UndoOptions {
    /// Element types never erased while they hold foreign content.
    pub protected_types: HashSet<String>,
    /// Origins tracked besides the binding's own.
    pub tracked_origins: Vec<Origin>,
    /// Changes closer together than this form one stack item.
    pub capture_timeout_millis: u64,
    pub delete_filter: DeleteFilter,
}

impl Default for UndoOptions {
    fn default() -> Self {
        Self {
            protected_types: HashSet::from(["paragraph".to_string()]),
            tracked_origins: Vec::new(),
            capture_timeout_millis: 500,
            delete_filter: default_delete_filter(),
        }
    }
}

impl UndoOptions {
    /// Every change becomes its own stack item.
    pub fn for_testing() -> Self {
        Self {
            capture_timeout_millis: 0,
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for UndoOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoOptions")
            .field("protected_types", &self.protected_types)
            .field("tracked_origins", &self.tracked_origins)
            .field("capture_timeout_millis", &self.capture_timeout_millis)
            .finish_non_exhaustive()
    }
}

// ───────────────────────────────────────────────────────────────────
// History
// ───────────────────────────────────────────────────────────────────

pub struct UndoHistory {
    binding: Binding,
    manager: Rc<RefCell<UndoManager<SelectionMeta>>>,
    options: UndoOptions,
    _subscriptions: Vec<Subscription>,
}

impl UndoHistory {
    pub fn new(binding: &Binding, options: UndoOptions) -> Self {
        let doc = binding.doc();
        let root = binding.root();
        let mut manager: UndoManager<SelectionMeta> = UndoManager::with_scope_and_options(
            &doc,
            &root,
            Options {
                capture_timeout_millis: options.capture_timeout_millis,
                ..Default::default()
            },
        );
        manager.include_origin(binding.tracked_origin());
        for origin in &options.tracked_origins {
            manager.include_origin(origin.clone());
        }

        let id = binding.id();
        let slot = binding.selection_slot();
        let added = manager.observe_item_added(move |_txn, event| {
            let slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(selection) = &slot.settled {
                event.meta_mut().insert(id, selection.clone());
            }
        });
        let slot = binding.selection_slot();
        let popped = manager.observe_item_popped(move |_txn, event| {
            if let Some(selection) = event.meta().get(&id) {
                let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                slot.pending_restore = Some(selection.clone());
            }
        });

        let manager = Rc::new(RefCell::new(manager));
        binding.attach_undo(Rc::downgrade(&manager));
        Self {
            binding: binding.clone(),
            manager,
            options,
            _subscriptions: vec![added, popped],
        }
    }

    /// Revert the latest stack item. Returns `false` when there was none.
    pub fn undo(&self) -> bool {
        self.pop(false)
    }

    pub fn redo(&self) -> bool {
        self.pop(true)
    }

    pub fn can_undo(&self) -> bool {
        self.manager.borrow().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.manager.borrow().can_redo()
    }

    /// Close the current capture group; the next change starts a new item.
    pub fn stop_capturing(&self) {
        self.manager.borrow_mut().reset();
    }

    pub fn clear(&self) {
        self.manager.borrow_mut().clear();
    }

    pub fn options(&self) -> &UndoOptions {
        &self.options
    }

    fn pop(&self, redo: bool) -> bool {
        let doc = self.binding.doc();
        let root = SharedContainer::from(self.binding.root());
        let local = self.binding.client_id();
        let subjects = {
            let mut txn = doc.transact_mut_with(self.binding.internal_origin());
            collect_subjects(&mut txn, &root, local, &self.options.protected_types)
        };

        self.set_in_progress(true);
        let popped = {
            let mut manager = self.manager.borrow_mut();
            if redo {
                manager.redo_blocking()
            } else {
                manager.undo_blocking()
            }
        };
        self.set_in_progress(false);
        if !popped {
            return false;
        }

        let mut txn = doc.transact_mut_with(self.binding.internal_origin());
        let restored = restore_subjects(&mut txn, &subjects, &self.options.delete_filter);
        debug!(
            "{} popped; {} of {} protected subject(s) kept",
            if redo { "redo" } else { "undo" },
            restored,
            subjects.len()
        );
        true
    }

    fn set_in_progress(&self, value: bool) {
        let slot = self.binding.selection_slot();
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.undo_in_progress = value;
    }
}

// ───────────────────────────────────────────────────────────────────
// Protection pass
// ───────────────────────────────────────────────────────────────────

/// Foreign-written content of a subject, enough to re-create it.
#[derive(Debug, Clone)]
enum Restorable {
    Text(Vec<TextChunk>),
    Element {
        tag: String,
        attrs: Attrs,
        foreign: bool,
        children: Vec<Restorable>,
    },
}

impl Restorable {
    fn foreign_len(&self) -> u32 {
        match self {
            Restorable::Text(chunks) => chunks.iter().map(|c| utf16_len(&c.text)).sum(),
            Restorable::Element { foreign, children, .. } => {
                u32::from(*foreign) + children.iter().map(Restorable::foreign_len).sum::<u32>()
            }
        }
    }
}

struct Subject {
    node: SharedNode,
    parent: SharedContainer,
    ancestors: Vec<NodeKey>,
    preceding: Vec<SharedNode>,
    content: Restorable,
    info: FilterSubject,
}

/// The current state minus everything `client` wrote.
fn without_client(snapshot: &Snapshot, client: ClientId) -> Snapshot {
    let mut sv = StateVector::default();
    for (other, clock) in snapshot.state_map.iter() {
        if *other != client {
            sv.set_max(*other, *clock);
        }
    }
    Snapshot::new(sv, snapshot.delete_set.clone())
}

fn foreign_part(
    txn: &mut TransactionMut,
    node: &SharedNode,
    current: &Snapshot,
    others: &Snapshot,
    local: ClientId,
) -> Option<Restorable> {
    match node {
        SharedNode::Text(text) => {
            let chunks: Vec<TextChunk> = text_chunks_between(txn, text, current, others)
                .into_iter()
                .filter(|chunk| chunk.change.is_none() && !chunk.text.is_empty())
                .collect();
            (!chunks.is_empty()).then_some(Restorable::Text(chunks))
        }
        SharedNode::Element(el) => {
            let container = SharedContainer::from(el.clone());
            let children: Vec<Restorable> = container
                .children(&*txn)
                .iter()
                .filter_map(|child| foreign_part(txn, child, current, others, local))
                .collect();
            let foreign = node.key().client() != Some(local);
            if children.is_empty() && !foreign {
                return None;
            }
            Some(Restorable::Element {
                tag: el.tag().to_string(),
                attrs: element_attrs(&*txn, el),
                foreign,
                children,
            })
        }
    }
}

fn collect_subjects(
    txn: &mut TransactionMut,
    root: &SharedContainer,
    local: ClientId,
    protected: &HashSet<String>,
) -> Vec<Subject> {
    let current = txn.snapshot();
    let others = without_client(&current, local);
    let mut subjects = Vec::new();
    let mut ancestors = Vec::new();
    collect_in(txn, root, &current, &others, local, protected, &mut ancestors, &mut subjects);
    subjects
}

#[allow(clippy::too_many_arguments)]
fn collect_in(
    txn: &mut TransactionMut,
    container: &SharedContainer,
    current: &Snapshot,
    others: &Snapshot,
    local: ClientId,
    protected: &HashSet<String>,
    ancestors: &mut Vec<NodeKey>,
    subjects: &mut Vec<Subject>,
) {
    let children = container.children(&*txn);
    for (index, child) in children.iter().enumerate() {
        let type_name = child.tag().map(str::to_string);
        let candidate = match &type_name {
            None => true,
            Some(name) => protected.contains(name),
        };
        if candidate {
            if let Some(content) = foreign_part(txn, child, current, others, local) {
                let info = FilterSubject {
                    type_name,
                    foreign_len: content.foreign_len(),
                };
                subjects.push(Subject {
                    node: child.clone(),
                    parent: container.clone(),
                    ancestors: ancestors.clone(),
                    preceding: children[..index].to_vec(),
                    content,
                    info,
                });
            }
        }
        if let SharedNode::Element(el) = child {
            ancestors.push(child.key());
            collect_in(
                txn,
                &SharedContainer::from(el.clone()),
                current,
                others,
                local,
                protected,
                ancestors,
                subjects,
            );
            ancestors.pop();
        }
    }
}

/// Re-create removed subjects the filter keeps. Returns how many were
/// re-created.
fn restore_subjects(txn: &mut TransactionMut, subjects: &[Subject], filter: &DeleteFilter) -> usize {
    let mut restored: HashSet<NodeKey> = HashSet::new();
    let mut inserted_in: HashMap<NodeKey, u32> = HashMap::new();
    for subject in subjects {
        if !subject.node.is_deleted() {
            continue;
        }
        if subject.ancestors.iter().any(|key| restored.contains(key)) {
            continue;
        }
        if filter(&subject.info) {
            continue;
        }
        if subject.parent.is_deleted() {
            warn!(
                "cannot keep {:?}: its container was removed as well",
                subject.node.key()
            );
            continue;
        }
        let parent_key = subject.parent.key();
        let before = inserted_in.entry(parent_key).or_insert(0);
        let alive = subject.preceding.iter().filter(|node| !node.is_deleted()).count() as u32;
        let index = (alive + *before).min(subject.parent.len(&*txn));
        rebuild(txn, &subject.parent, index, &subject.content);
        *before += 1;
        restored.insert(subject.node.key());
        warn!(
            "undo kept {:?} ({} unit(s) written by other replicas)",
            subject.node.key(),
            subject.info.foreign_len
        );
    }
    restored.len()
}

fn rebuild(txn: &mut TransactionMut, parent: &SharedContainer, index: u32, content: &Restorable) {
    match content {
        Restorable::Text(chunks) => {
            let text = parent.insert_text(txn, index);
            let mut offset = 0;
            for chunk in chunks {
                text.insert_with_attributes(txn, offset, &chunk.text, to_yrs_attrs(&chunk.attrs));
                offset += utf16_len(&chunk.text);
            }
        }
        Restorable::Element {
            tag,
            attrs,
            children,
            ..
        } => {
            let el = parent.insert_element(txn, index, tag);
            for (key, value) in attrs {
                el.insert_attribute(txn, key.as_str(), json_to_any(value));
            }
            let container = SharedContainer::from(el);
            for (i, child) in children.iter().enumerate() {
                rebuild(txn, &container, i as u32, child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingOptions;
    use crate::shared::new_shared_doc;
    use crate::view::{HeadlessView, HostView, LocalChange};
    use tandem_core::{Node, NodeSpec, Schema};

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

    fn doc_of(schema: &Schema, paragraphs: &[&str]) -> Node {
        let content = paragraphs
            .iter()
            .map(|text| {
                let content = if text.is_empty() {
                    vec![]
                } else {
                    vec![schema.text(*text, vec![]).unwrap()]
                };
                schema.node("paragraph", Attrs::new(), content).unwrap()
            })
            .collect();
        schema.top_node(content).unwrap()
    }

    fn attached(client: ClientId) -> (Binding, HeadlessView) {
        let binding = Binding::open(new_shared_doc(Some(client)), BindingOptions::for_testing());
        let view = HeadlessView::empty(schema()).unwrap();
        binding.init_view(Rc::new(view.clone())).unwrap();
        (binding, view)
    }

    #[test]
    fn test_default_filter() {
        let filter = default_delete_filter();
        assert!(filter(&FilterSubject {
            type_name: None,
            foreign_len: 0
        }));
        assert!(!filter(&FilterSubject {
            type_name: Some("paragraph".into()),
            foreign_len: 3
        }));
    }

    #[test]
    fn test_undo_redo_restores_documents() {
        let (binding, view) = attached(1);
        let history = UndoHistory::new(&binding, UndoOptions::for_testing());
        let schema = view.schema();
        let empty = view.doc();

        view.edit(doc_of(&schema, &["one"]));
        binding.local_changed(LocalChange::tracked()).unwrap();
        history.stop_capturing();
        view.edit(doc_of(&schema, &["one", "two"]));
        binding.local_changed(LocalChange::tracked()).unwrap();
        let full = view.doc();
        assert!(history.can_undo());

        assert!(history.undo());
        binding.run_pending().unwrap();
        assert_eq!(view.doc(), doc_of(&schema, &["one"]));
        assert!(view.last_update().unwrap().meta.is_undo_redo);

        assert!(history.undo());
        binding.run_pending().unwrap();
        assert_eq!(view.doc().text_content(), empty.text_content());
        assert!(!history.can_undo());

        assert!(history.redo());
        assert!(history.redo());
        binding.run_pending().unwrap();
        assert_eq!(view.doc(), full);
    }

    #[test]
    fn test_untracked_changes_are_not_undone() {
        let (binding, view) = attached(1);
        let history = UndoHistory::new(&binding, UndoOptions::for_testing());
        let schema = view.schema();

        view.edit(doc_of(&schema, &["kept"]));
        binding.local_changed(LocalChange::untracked()).unwrap();
        assert!(!history.can_undo());
        assert!(!history.undo());
    }

    #[test]
    fn test_undo_keeps_paragraph_with_foreign_text() {
        let (a, view_a) = attached(1);
        let (b, view_b) = attached(2);
        let history = UndoHistory::new(&a, UndoOptions::for_testing());
        let schema = view_a.schema();

        view_a.edit(doc_of(&schema, &["mine"]));
        a.local_changed(LocalChange::tracked()).unwrap();
        b.apply_update(&a.encode_diff(&b.state_vector()).unwrap()).unwrap();
        b.run_pending().unwrap();

        view_b.edit(doc_of(&schema, &["mine theirs"]));
        b.local_changed(LocalChange::tracked()).unwrap();
        a.apply_update(&b.encode_diff(&a.state_vector()).unwrap()).unwrap();
        a.run_pending().unwrap();
        assert_eq!(view_a.doc().text_content(), "mine theirs");

        assert!(history.undo());
        a.run_pending().unwrap();
        let text = view_a.doc().text_content();
        assert!(text.contains("theirs"), "foreign text lost: {text:?}");
        assert!(!text.contains("mine"));
    }
}
