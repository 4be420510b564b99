//! Binding coordinator: one shared root ⇄ one host view.
//!
//! ```text
//!             local_changed()                       run_pending()
//!   HostView ───────────────► sync ──► shared tree ─────────────────┐
//!      ▲     SyncingToRemote          (tracked /                    │
//!      │                               untracked origin)            │
//!      │                                   │ observe_deep           │
//!      │                                   ▼                        │
//!      │                             ┌───────────┐                  │
//!      │                             │ Scheduler │ ◄── ChangeNotice │
//!      │                             └─────┬─────┘                  │
//!      │  dispatch(ViewUpdate)             │ drain                  │
//!      └────────────────── project ◄───────┘ ◄──────────────────────┘
//!                        SyncingFromRemote
//! ```
//!
//! Both directions are guarded by a single [`SyncState`]: while one
//! direction runs, entering either direction is a no-op. Notices from this
//! binding's own origins are ignored by its observer, so a local push never
//! comes back as a rebuild.
//!
//! Selections survive rebuilds as anchors. `before_all_transactions` captures
//! the view selection before a remote transaction; the observer moves it into
//! the notice, and `run_pending` resolves it against the rebuilt tree.

use std::cell::{Cell, Ref, RefCell};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, trace};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::Node;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{
    DeepObservable, Doc, Origin, ReadTxn, Snapshot, StateVector, Subscription, Transact, Update,
    XmlFragment, XmlFragmentRef,
};

use crate::diff::{sync, SyncContext, SyncStats};
use crate::error::BindingError;
use crate::mapping::Mapping;
use crate::marks::MarkCodec;
use crate::position::{to_anchor, to_offset, Anchor, SelectionSnapshot};
use crate::project::{empty_prev, project_history, project_root, ProjectContext};
use crate::scheduler::{ChangeNotice, Scheduler};
use crate::shared::{new_shared_doc, ClientId, NodeKey, SharedContainer};
use crate::undo::SelectionMeta;
use crate::version::{ChangeAnnotator, ColorDef, UserAnnotator, UserRegistry, VersionSnapshot};
use crate::view::{HostView, LocalChange, UpdateMeta, ViewUpdate};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingOptions {
    /// Name of the shared root opened by [`Binding::open`].
    pub root_name: String,
    /// Palette for change attribution.
    pub colors: Vec<ColorDef>,
    /// Ask the view to scroll to a restored cursor that was visible.
    pub scroll_into_view: bool,
}

impl Default for BindingOptions {
    fn default() -> Self {
        Self {
            root_name: "prosemirror".to_string(),
            colors: vec![ColorDef::default()],
            scroll_into_view: true,
        }
    }
}

impl BindingOptions {
    pub fn for_testing() -> Self {
        Self {
            root_name: "test".to_string(),
            colors: vec![
                ColorDef::new("#30bced33", "#30bced"),
                ColorDef::new("#6eeb8333", "#6eeb83"),
                ColorDef::new("#ee634433", "#ee6344"),
            ],
            scroll_into_view: true,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// State
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    SyncingFromRemote,
    SyncingToRemote,
}

/// Resets the state to `Idle` when the sync leaves scope, early returns
/// included.
struct SyncGuard<'a> {
    state: &'a Cell<SyncState>,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.state.set(SyncState::Idle);
    }
}

/// Selection anchors shared with the shared-tree observer and the undo
/// history callbacks, which may not hold a binding handle.
#[derive(Debug, Default)]
pub(crate) struct SelectionSlot {
    /// View selection after the latest local sync or rebuild.
    pub(crate) settled: Option<SelectionSnapshot>,
    /// Captured before the current remote transaction.
    pub(crate) before_tx: Option<SelectionSnapshot>,
    /// Handed back by an undo/redo pop, restored by the next rebuild.
    pub(crate) pending_restore: Option<SelectionSnapshot>,
    pub(crate) undo_in_progress: bool,
}

#[derive(Debug, Clone)]
struct Origins {
    tracked: Origin,
    untracked: Origin,
    internal: Origin,
}

impl Origins {
    fn new(id: &Uuid) -> Self {
        Self {
            tracked: Origin::from(format!("y-sync:{id}").as_str()),
            untracked: Origin::from(format!("y-sync:{id}:untracked").as_str()),
            internal: Origin::from(format!("y-sync:{id}:internal").as_str()),
        }
    }

    fn is_own(&self, origin: &Origin) -> bool {
        *origin == self.tracked || *origin == self.untracked || *origin == self.internal
    }
}

/// A version being shown instead of the live tree.
struct RenderedVersion {
    snapshot: Snapshot,
    prev: Snapshot,
    annotator: Option<Box<dyn ChangeAnnotator>>,
    /// Document rebuilt from binary updates; `None` renders the live doc.
    source: Option<(Doc, XmlFragmentRef)>,
}

struct BindingInner {
    id: Uuid,
    options: BindingOptions,
    origins: Origins,
    doc: RefCell<Doc>,
    root: RefCell<XmlFragmentRef>,
    mapping: RefCell<Mapping>,
    codec: RefCell<MarkCodec>,
    view: RefCell<Option<Rc<dyn HostView>>>,
    state: Cell<SyncState>,
    scheduler: Arc<Scheduler>,
    slot: Arc<Mutex<SelectionSlot>>,
    subscription: RefCell<Option<Subscription>>,
    version: RefCell<Option<RenderedVersion>>,
    undo: RefCell<Option<Weak<RefCell<yrs::undo::UndoManager<SelectionMeta>>>>>,
    attribution: RefCell<Option<(Arc<Mutex<UserRegistry>>, String)>>,
    cursor_in_view: Cell<Option<bool>>,
}

/// Handle to a binding. Clones share the same binding.
#[derive(Clone)]
pub struct Binding {
    inner: Rc<BindingInner>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .field("mapped", &self.inner.mapping.borrow().len())
            .field("pending", &self.inner.scheduler.len())
            .finish()
    }
}

impl Binding {
    pub fn new(doc: Doc, root: XmlFragmentRef, options: BindingOptions) -> Self {
        Self::with_mapping(doc, root, Mapping::new(), options)
    }

    /// Bind with a mapping built beforehand, e.g. by
    /// [`init_local_doc`](crate::convert::init_local_doc).
    pub fn with_mapping(doc: Doc, root: XmlFragmentRef, mapping: Mapping, options: BindingOptions) -> Self {
        let id = Uuid::new_v4();
        Self {
            inner: Rc::new(BindingInner {
                id,
                origins: Origins::new(&id),
                options,
                doc: RefCell::new(doc),
                root: RefCell::new(root),
                mapping: RefCell::new(mapping),
                codec: RefCell::new(MarkCodec::new()),
                view: RefCell::new(None),
                state: Cell::new(SyncState::Idle),
                scheduler: Arc::new(Scheduler::new()),
                slot: Arc::new(Mutex::new(SelectionSlot::default())),
                subscription: RefCell::new(None),
                version: RefCell::new(None),
                undo: RefCell::new(None),
                attribution: RefCell::new(None),
                cursor_in_view: Cell::new(None),
            }),
        }
    }

    /// Bind the root named `options.root_name` of `doc`.
    pub fn open(doc: Doc, options: BindingOptions) -> Self {
        let root = doc.get_or_insert_xml_fragment(options.root_name.as_str());
        Self::new(doc, root, options)
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn options(&self) -> &BindingOptions {
        &self.inner.options
    }

    pub fn doc(&self) -> Doc {
        self.inner.doc.borrow().clone()
    }

    pub fn root(&self) -> XmlFragmentRef {
        self.inner.root.borrow().clone()
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.doc.borrow().client_id()
    }

    pub fn mapping(&self) -> Ref<'_, Mapping> {
        self.inner.mapping.borrow()
    }

    pub fn view(&self) -> Option<Rc<dyn HostView>> {
        self.inner.view.borrow().clone()
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.state.get()
    }

    pub fn pending(&self) -> usize {
        self.inner.scheduler.len()
    }

    pub fn is_rendering_snapshot(&self) -> bool {
        self.inner.version.borrow().is_some()
    }

    /// Origin of tracked local pushes; undo histories track it.
    pub fn tracked_origin(&self) -> Origin {
        self.inner.origins.tracked.clone()
    }

    pub fn untracked_origin(&self) -> Origin {
        self.inner.origins.untracked.clone()
    }

    pub(crate) fn internal_origin(&self) -> Origin {
        self.inner.origins.internal.clone()
    }

    pub(crate) fn selection_slot(&self) -> Arc<Mutex<SelectionSlot>> {
        Arc::clone(&self.inner.slot)
    }

    pub(crate) fn attach_undo(&self, manager: Weak<RefCell<yrs::undo::UndoManager<SelectionMeta>>>) {
        *self.inner.undo.borrow_mut() = Some(manager);
    }

    fn lock_slot(&self) -> MutexGuard<'_, SelectionSlot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, next: SyncState) -> Option<SyncGuard<'_>> {
        let current = self.inner.state.get();
        if current != SyncState::Idle {
            trace!("binding {} ignores {:?} while {:?}", self.inner.id, next, current);
            return None;
        }
        self.inner.state.set(next);
        Some(SyncGuard {
            state: &self.inner.state,
        })
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Attach `view`. A non-empty shared root is projected into the view;
    /// otherwise local content other than the schema's empty document is
    /// pushed to the shared tree.
    pub fn init_view(&self, view: Rc<dyn HostView>) -> Result<(), BindingError> {
        if self.view().is_some() {
            self.destroy();
        }
        *self.inner.view.borrow_mut() = Some(Rc::clone(&view));
        self.observe();

        let root_len = self.root().len(&self.doc().transact());
        if root_len > 0 {
            return self.force_rerender();
        }
        let state = view.state();
        if view.schema().empty_doc().ok().as_ref() == Some(&state.doc) {
            debug!("binding {} attached to an empty document", self.inner.id);
            self.settle_selection(&*view);
            return Ok(());
        }
        self.local_changed(LocalChange::untracked()).map(|_| ())
    }

    /// Detach from the view and stop observing the shared root.
    pub fn destroy(&self) {
        self.inner.subscription.borrow_mut().take();
        self.inner.view.borrow_mut().take();
        self.inner.version.borrow_mut().take();
        self.inner.scheduler.clear();
        let mut slot = self.lock_slot();
        slot.before_tx = None;
        slot.pending_restore = None;
        debug!("binding {} destroyed", self.inner.id);
    }

    /// Switch to another shared root and rebuild the view from it.
    pub fn change_root(&self, doc: Doc, root: XmlFragmentRef) -> Result<(), BindingError> {
        let view = self.view();
        self.destroy();
        *self.inner.doc.borrow_mut() = doc;
        *self.inner.root.borrow_mut() = root;
        self.inner.mapping.borrow_mut().clear();
        match view {
            Some(view) => {
                *self.inner.view.borrow_mut() = Some(view);
                self.observe();
                self.force_rerender()
            }
            None => Ok(()),
        }
    }

    fn observe(&self) {
        let scheduler = Arc::clone(&self.inner.scheduler);
        let slot = Arc::clone(&self.inner.slot);
        let origins = self.inner.origins.clone();
        let subscription = self.root().observe_deep(move |txn, _events| {
            if txn.origin().is_some_and(|origin| origins.is_own(origin)) {
                return;
            }
            let touched = txn
                .changed_parent_types()
                .iter()
                .map(|branch| NodeKey::of(branch))
                .collect();
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let notice = ChangeNotice {
                touched,
                is_undo_redo: slot.undo_in_progress,
                before_tx: slot.before_tx.take(),
            };
            drop(slot);
            scheduler.push(notice);
        });
        *self.inner.subscription.borrow_mut() = Some(subscription);
    }

    // ── Remote → local ─────────────────────────────────────────────

    /// Capture the view selection ahead of a remote transaction. Only the
    /// first call before the transaction commits has an effect.
    pub fn before_all_transactions(&self) {
        let Some(view) = self.view() else {
            return;
        };
        if self.lock_slot().before_tx.is_some() {
            return;
        }
        let selection = view.state().selection;
        let root = self.root();
        let snapshot = {
            let mapping = self.inner.mapping.borrow();
            let shared_doc = self.doc();
            let mut txn = shared_doc.transact_mut_with(self.internal_origin());
            SelectionSnapshot::capture(&mut txn, &root, &selection, &mapping)
        };
        self.lock_slot().before_tx = Some(snapshot);
    }

    /// Apply a v1-encoded update from a remote replica. The change is
    /// rendered by the next [`run_pending`](Self::run_pending).
    pub fn apply_update(&self, update: &[u8]) -> Result<(), BindingError> {
        let update = Update::decode_v1(update)?;
        self.before_all_transactions();
        let result = {
            let shared_doc = self.doc();
            let mut txn = shared_doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| BindingError::Update(e.to_string()))
        };
        self.lock_slot().before_tx = None;
        result
    }

    /// State vector of the bound document, v1-encoded.
    pub fn state_vector(&self) -> Vec<u8> {
        use yrs::updates::encoder::Encode;
        self.doc().transact().state_vector().encode_v1()
    }

    /// Everything the bound document has that a replica at `remote_sv`
    /// is missing, as a v1 update.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, BindingError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        Ok(self.doc().transact().encode_diff_v1(&sv))
    }

    /// Render every queued change notice and flush queued metadata.
    /// Returns the number of notices handled.
    pub fn run_pending(&self) -> Result<usize, BindingError> {
        if self.sync_state() != SyncState::Idle {
            trace!("binding {} defers pending work while {:?}", self.inner.id, self.sync_state());
            return Ok(0);
        }
        let notices = self.inner.scheduler.drain();
        let extra = self.inner.scheduler.take_metas();
        let Some(view) = self.view() else {
            return Ok(0);
        };
        let count = notices.len();
        if notices.is_empty() {
            if !extra.is_empty() {
                view.dispatch(ViewUpdate {
                    meta: UpdateMeta {
                        extra,
                        ..Default::default()
                    },
                    ..Default::default()
                });
            }
            return Ok(0);
        }

        let result = if self.is_rendering_snapshot() {
            self.render_version(&*view, extra)
        } else {
            self.rebuild(&*view, notices, extra)
        };
        self.inner.cursor_in_view.set(None);
        result.map(|_| count)
    }

    fn rebuild(
        &self,
        view: &dyn HostView,
        notices: Vec<ChangeNotice>,
        extra: std::collections::BTreeMap<String, Value>,
    ) -> Result<(), BindingError> {
        let Some(_guard) = self.enter(SyncState::SyncingFromRemote) else {
            return Ok(());
        };
        let is_undo_redo = notices.iter().any(|notice| notice.is_undo_redo);
        let pending_restore = if is_undo_redo {
            self.lock_slot().pending_restore.take()
        } else {
            None
        };
        // Changes that did not arrive through `apply_update` (another binding
        // on the same document, direct writes by the host) carry no capture;
        // the selection settled after the last sync stands in for it.
        let restore = pending_restore
            .or_else(|| notices.iter().find_map(|n| n.before_tx.clone()))
            .or_else(|| self.lock_slot().settled.clone());

        let schema = view.schema();
        let root = self.root();
        let (doc, selection) = {
            let mut mapping = self.inner.mapping.borrow_mut();
            for notice in &notices {
                mapping.invalidate(&notice.touched);
            }
            let shared_doc = self.doc();
            let mut txn = shared_doc.transact_mut_with(self.internal_origin());
            let content = project_root(
                &mut txn,
                &root,
                &mut ProjectContext::new(&schema, &mut mapping, self.client_id()),
            );
            let doc = match schema.top_node(content) {
                Ok(doc) => doc,
                Err(err) => {
                    error!("shared root cannot form a `{}`: {err}", schema.top_node_type());
                    return Err(err.into());
                }
            };
            mapping.set_element(SharedContainer::from(root.clone()).key(), doc.clone());
            let selection = restore
                .as_ref()
                .and_then(|snapshot| snapshot.restore(&txn, &root, &doc, &mapping));
            (doc, selection)
        };

        let scroll_into_view =
            restore.is_some() && self.inner.options.scroll_into_view && self.local_cursor_in_view(view);
        debug!(
            "binding {} rebuilt from {} notice(s), selection restored: {}",
            self.inner.id,
            notices.len(),
            selection.is_some()
        );
        view.dispatch(ViewUpdate {
            doc: Some(doc),
            selection,
            scroll_into_view,
            meta: UpdateMeta {
                add_to_history: false,
                is_change_origin: true,
                is_undo_redo,
                snapshot_active: false,
                extra,
            },
        });
        self.settle_selection(view);
        Ok(())
    }

    /// Drop every cached local node and rebuild the view from the shared
    /// root.
    pub fn force_rerender(&self) -> Result<(), BindingError> {
        let view = self.view().ok_or(BindingError::NoView)?;
        let Some(_guard) = self.enter(SyncState::SyncingFromRemote) else {
            return Ok(());
        };
        let has_before_tx = self.lock_slot().before_tx.is_some();
        let schema = view.schema();
        let root = self.root();
        let doc = {
            let mut mapping = self.inner.mapping.borrow_mut();
            mapping.clear();
            let shared_doc = self.doc();
            let mut txn = shared_doc.transact_mut_with(self.internal_origin());
            let content = project_root(
                &mut txn,
                &root,
                &mut ProjectContext::new(&schema, &mut mapping, self.client_id()),
            );
            let doc = schema.top_node(content)?;
            mapping.set_element(SharedContainer::from(root.clone()).key(), doc.clone());
            doc
        };
        let selection = (!has_before_tx).then(|| view.state().selection.clamp(&doc));
        debug!("binding {} rerendered {} top-level nodes", self.inner.id, doc.child_count());
        view.dispatch(ViewUpdate {
            doc: Some(doc),
            selection,
            scroll_into_view: false,
            meta: UpdateMeta {
                is_change_origin: true,
                ..Default::default()
            },
        });
        self.settle_selection(&*view);
        Ok(())
    }

    /// Queue a metadata entry for the next view update.
    pub fn set_meta(&self, key: impl Into<String>, value: Value) {
        self.inner.scheduler.set_meta(key, value);
    }

    fn local_cursor_in_view(&self, view: &dyn HostView) -> bool {
        if let Some(cached) = self.inner.cursor_in_view.get() {
            return cached;
        }
        let in_view = view.has_focus() && view.selection_in_viewport();
        self.inner.cursor_in_view.set(Some(in_view));
        in_view
    }

    // ── Local → remote ─────────────────────────────────────────────

    /// Push the view's current document into the shared tree.
    pub fn local_changed(&self, change: LocalChange) -> Result<SyncStats, BindingError> {
        let view = self.view().ok_or(BindingError::NoView)?;
        if self.is_rendering_snapshot() {
            trace!("binding {} renders a snapshot; local change not pushed", self.inner.id);
            return Ok(SyncStats::default());
        }
        let Some(_guard) = self.enter(SyncState::SyncingToRemote) else {
            return Ok(SyncStats::default());
        };
        let origin = if change.add_to_history {
            self.tracked_origin()
        } else {
            self.stop_undo_capture();
            self.untracked_origin()
        };

        let state = view.state();
        let schema = view.schema();
        let root = self.root();
        let mut mapping = self.inner.mapping.borrow_mut();
        let mut codec = self.inner.codec.borrow_mut();
        let shared_doc = self.doc();
        let mut txn = shared_doc.transact_mut_with(origin);
        let mut ctx = SyncContext {
            schema: &schema,
            mapping: &mut *mapping,
            codec: &mut *codec,
        };
        let stats = match sync(&mut txn, &SharedContainer::from(root.clone()), &state.doc, &mut ctx) {
            Ok(stats) => stats,
            Err(err) => {
                error!("binding {} failed to push local change: {err}", self.inner.id);
                return Err(err);
            }
        };
        if let Some((registry, user)) = &*self.inner.attribution.borrow() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record_deletions(user, txn.delete_set());
        }
        // Undo items created by this commit keep the selection from before
        // the change, so the slot is updated only after the commit.
        let settled = SelectionSnapshot::capture(&mut txn, &root, &state.selection, &mapping);
        drop(txn);
        self.lock_slot().settled = Some(settled);

        if !stats.is_noop() {
            debug!("binding {} pushed local change: {:?}", self.inner.id, stats);
        }
        Ok(stats)
    }

    /// The view selection moved without a document change.
    pub fn selection_changed(&self) {
        if let Some(view) = self.view() {
            self.settle_selection(&*view);
        }
    }

    fn settle_selection(&self, view: &dyn HostView) {
        let selection = view.state().selection;
        let root = self.root();
        let snapshot = {
            let mapping = self.inner.mapping.borrow();
            let shared_doc = self.doc();
            let mut txn = shared_doc.transact_mut_with(self.internal_origin());
            SelectionSnapshot::capture(&mut txn, &root, &selection, &mapping)
        };
        self.lock_slot().settled = Some(snapshot);
    }

    fn stop_undo_capture(&self) {
        let manager = self.inner.undo.borrow().as_ref().and_then(Weak::upgrade);
        if let Some(manager) = manager {
            manager.borrow_mut().reset();
        }
    }

    /// Record this binding's writes and deletions under `user`.
    pub fn attribute_to(&self, registry: Arc<Mutex<UserRegistry>>, user: &str) {
        registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register_client(self.client_id(), user);
        *self.inner.attribution.borrow_mut() = Some((registry, user.to_string()));
    }

    /// An annotator over `registry` using this binding's palette.
    pub fn user_annotator(&self, registry: UserRegistry) -> UserAnnotator {
        UserAnnotator::new(registry, self.inner.options.colors.clone())
    }

    // ── Positions ──────────────────────────────────────────────────

    /// Anchor for a position in the current local document.
    pub fn anchor_at(&self, offset: u32) -> Anchor {
        let root = self.root();
        let mapping = self.inner.mapping.borrow();
        let shared_doc = self.doc();
        let mut txn = shared_doc.transact_mut_with(self.internal_origin());
        to_anchor(&mut txn, &root, offset, &mapping)
    }

    /// Position of `anchor` in the current local document.
    pub fn offset_of(&self, anchor: &Anchor) -> Option<u32> {
        let root = self.root();
        let mapping = self.inner.mapping.borrow();
        let shared_doc = self.doc();
        let txn = shared_doc.transact();
        to_offset(&txn, &root, anchor, &mapping)
    }

    // ── Versions ───────────────────────────────────────────────────

    /// Show the document as of `snapshot`, with changes since `prev`
    /// annotated. `None` stands for the current state and the empty
    /// history respectively.
    pub fn render_snapshot(
        &self,
        snapshot: Option<&VersionSnapshot>,
        prev: Option<&VersionSnapshot>,
        annotator: Option<Box<dyn ChangeAnnotator>>,
    ) -> Result<(), BindingError> {
        let view = self.view().ok_or(BindingError::NoView)?;
        let snapshot = match snapshot {
            Some(snapshot) => snapshot.snapshot().clone(),
            None => self.doc().transact().snapshot(),
        };
        let prev = prev.map(|prev| prev.snapshot().clone()).unwrap_or_else(empty_prev);
        *self.inner.version.borrow_mut() = Some(RenderedVersion {
            snapshot,
            prev,
            annotator,
            source: None,
        });
        self.render_version(&*view, Default::default())
    }

    /// Show the changes `update` makes on top of `prev_update`, both
    /// v1-encoded, without touching the live document.
    pub fn render_update_range(
        &self,
        prev_update: &[u8],
        update: &[u8],
        annotator: Option<Box<dyn ChangeAnnotator>>,
    ) -> Result<(), BindingError> {
        let view = self.view().ok_or(BindingError::NoView)?;
        let name = match SharedContainer::from(self.root()).key() {
            NodeKey::Root(name) => name.to_string(),
            NodeKey::Item(_) => self.inner.options.root_name.clone(),
        };
        let history = new_shared_doc(None);
        let root = history.get_or_insert_xml_fragment(name.as_str());
        let prev = {
            let mut txn = history.transact_mut();
            txn.apply_update(Update::decode_v1(prev_update)?)
                .map_err(|e| BindingError::Update(e.to_string()))?;
            txn.snapshot()
        };
        let snapshot = {
            let mut txn = history.transact_mut();
            txn.apply_update(Update::decode_v1(update)?)
                .map_err(|e| BindingError::Update(e.to_string()))?;
            txn.snapshot()
        };
        *self.inner.version.borrow_mut() = Some(RenderedVersion {
            snapshot,
            prev,
            annotator,
            source: Some((history, root)),
        });
        self.render_version(&*view, Default::default())
    }

    fn render_version(
        &self,
        view: &dyn HostView,
        extra: std::collections::BTreeMap<String, Value>,
    ) -> Result<(), BindingError> {
        let Some(_guard) = self.enter(SyncState::SyncingFromRemote) else {
            return Ok(());
        };
        let schema = view.schema();
        let doc = {
            let mut version = self.inner.version.borrow_mut();
            let Some(version) = version.as_mut() else {
                return Ok(());
            };
            let annotator: Option<&mut dyn ChangeAnnotator> = match version.annotator.as_mut() {
                Some(annotator) => Some(annotator.as_mut()),
                None => None,
            };
            let content = match &version.source {
                Some((doc, root)) => {
                    project_history(&doc.transact(), root, &schema, &version.snapshot, &version.prev, annotator)?
                }
                None => {
                    let doc = self.doc();
                    let txn = doc.transact();
                    project_history(&txn, &self.root(), &schema, &version.snapshot, &version.prev, annotator)?
                }
            };
            match schema.top_node(content) {
                Ok(doc) => doc,
                Err(err) => {
                    error!("version cannot form a `{}`: {err}", schema.top_node_type());
                    return Err(err.into());
                }
            }
        };
        self.inner.mapping.borrow_mut().clear();
        debug!("binding {} rendered a version snapshot", self.inner.id);
        view.dispatch(ViewUpdate {
            doc: Some(doc),
            selection: None,
            scroll_into_view: false,
            meta: UpdateMeta {
                is_change_origin: true,
                snapshot_active: true,
                extra,
                ..Default::default()
            },
        });
        Ok(())
    }

    /// Return from a rendered version to the live document.
    pub fn unrender_snapshot(&self) -> Result<(), BindingError> {
        self.inner.version.borrow_mut().take();
        self.inner.scheduler.drain();
        self.force_rerender()
    }

    /// Make the document as of `snapshot` the current content. The restore
    /// is a tracked local change, so it can be undone.
    pub fn restore_snapshot(&self, snapshot: &VersionSnapshot) -> Result<SyncStats, BindingError> {
        let view = self.view().ok_or(BindingError::NoView)?;
        self.inner.version.borrow_mut().take();
        let restored = self.project_version(&*view, snapshot.snapshot())?;
        view.dispatch(ViewUpdate {
            doc: Some(restored),
            selection: None,
            scroll_into_view: false,
            meta: UpdateMeta {
                add_to_history: true,
                ..Default::default()
            },
        });
        self.inner.mapping.borrow_mut().clear();
        self.local_changed(LocalChange::tracked())
    }

    /// The live document as it was at `snapshot`, without annotations.
    fn project_version(&self, view: &dyn HostView, snapshot: &Snapshot) -> Result<Node, BindingError> {
        let schema = view.schema();
        let doc = self.doc();
        let txn = doc.transact();
        let content = project_history(&txn, &self.root(), &schema, snapshot, snapshot, None)?;
        Ok(schema.top_node(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::HeadlessView;
    use tandem_core::{Attrs, NodeSpec, Schema, Selection};

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
        let schema = schema();
        let binding = Binding::open(new_shared_doc(Some(client)), BindingOptions::for_testing());
        let view = HeadlessView::empty(schema).unwrap();
        binding.init_view(Rc::new(view.clone())).unwrap();
        (binding, view)
    }

    #[test]
    fn test_empty_document_is_not_pushed() {
        let (binding, _view) = attached(1);
        assert_eq!(binding.root().len(&binding.doc().transact()), 0);
        assert_eq!(binding.sync_state(), SyncState::Idle);
    }

    #[test]
    fn test_local_change_reaches_shared_tree_without_echo() {
        let (binding, view) = attached(1);
        let schema = view.schema();
        view.edit(doc_of(&schema, &["hello"]));
        let stats = binding.local_changed(LocalChange::tracked()).unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(binding.root().len(&binding.doc().transact()), 1);

        // own origin: nothing queued, nothing dispatched
        assert_eq!(binding.pending(), 0);
        assert_eq!(binding.run_pending().unwrap(), 0);
        assert_eq!(view.dispatch_count(), 0);
    }

    #[test]
    fn test_remote_update_rebuilds_view() {
        let (a, view_a) = attached(1);
        let (b, view_b) = attached(2);
        let schema = view_a.schema();
        view_a.edit(doc_of(&schema, &["one", "two"]));
        a.local_changed(LocalChange::tracked()).unwrap();

        b.apply_update(&a.encode_diff(&b.state_vector()).unwrap()).unwrap();
        assert_eq!(b.pending(), 1);
        assert_eq!(b.run_pending().unwrap(), 1);
        assert_eq!(view_b.doc(), view_a.doc());

        let update = view_b.last_update().unwrap();
        assert!(update.meta.is_change_origin);
        assert!(!update.meta.add_to_history);
    }

    #[test]
    fn test_guard_suppresses_nested_entry() {
        let (binding, _view) = attached(1);
        let guard = binding.enter(SyncState::SyncingFromRemote).unwrap();
        assert!(binding.enter(SyncState::SyncingToRemote).is_none());
        assert_eq!(binding.local_changed(LocalChange::tracked()).unwrap(), SyncStats::default());
        drop(guard);
        assert_eq!(binding.sync_state(), SyncState::Idle);
    }

    #[test]
    fn test_metas_flush_without_changes() {
        let (binding, view) = attached(1);
        binding.set_meta("cursor", Value::from(3));
        binding.run_pending().unwrap();
        let update = view.last_update().unwrap();
        assert!(update.doc.is_none());
        assert_eq!(update.meta.extra["cursor"], Value::from(3));
    }

    #[test]
    fn test_anchor_round_trip_through_binding() {
        let (binding, view) = attached(1);
        let schema = view.schema();
        view.edit(doc_of(&schema, &["abc", "def"]));
        view.set_selection(Selection::cursor(7));
        binding.local_changed(LocalChange::tracked()).unwrap();
        let anchor = binding.anchor_at(7);
        assert_eq!(binding.offset_of(&anchor), Some(7));
    }

    #[test]
    fn test_change_root_rerenders() {
        let (binding, view) = attached(1);
        let other = new_shared_doc(Some(5));
        let other_root = other.get_or_insert_xml_fragment("test");
        {
            let schema = view.schema();
            let mut mapping = Mapping::new();
            let mut codec = MarkCodec::new();
            let mut txn = other.transact_mut();
            sync(
                &mut txn,
                &SharedContainer::from(other_root.clone()),
                &doc_of(&schema, &["moved"]),
                &mut SyncContext {
                    schema: &schema,
                    mapping: &mut mapping,
                    codec: &mut codec,
                },
            )
            .unwrap();
        }
        binding.change_root(other, other_root).unwrap();
        assert_eq!(view.doc().text_content(), "moved");
        assert_eq!(binding.client_id(), 5);
    }
}
