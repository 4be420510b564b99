//! # tandem-collab — CRDT binding for structured documents
//!
//! Keeps a schema-checked local document tree and a shared yrs XML tree in
//! agreement, in both directions, while several replicas edit concurrently.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────┐  local_changed   ┌──────────────┐   sync (diff)   ┌──────────────┐
//!  │  HostView   │ ───────────────► │   Binding    │ ──────────────► │  yrs Doc     │
//!  │ (editor)    │                  │ (mutex guard,│                 │  XmlFragment │
//!  │             │ ◄─────────────── │  mapping)    │ ◄────────────── │              │
//!  └─────────────┘  ViewUpdate      └──────┬───────┘  observe_deep   └──────┬───────┘
//!                                          │            │                   │
//!                                          │            ▼                   │
//!                                          │     ┌─────────────┐            │
//!                                          └─────│  Scheduler  │            │
//!                             run_pending        │ (notices)   │            │
//!                             (project)          └─────────────┘            │
//!                                                                           │
//!                               ┌──────────────┐   scope / origins          │
//!                               │ UndoHistory  │ ───────────────────────────┘
//!                               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`shared`] — thin helpers over the yrs XML types
//! - [`mapping`] — shared node identity → local node cache
//! - [`marks`] — local marks ⇄ shared text attributes
//! - [`position`] — absolute offsets ⇄ CRDT anchors, selection snapshots
//! - [`project`] — shared tree → local tree, with optional history view
//! - [`diff`] — local tree → shared tree, minimal edits
//! - [`binding`] — the coordinator tying a view to a shared root
//! - [`scheduler`] — deferred remote-change notices
//! - [`undo`] — scoped undo/redo with selection restore
//! - [`version`] — snapshots and per-user change attribution
//! - [`presence`] — peer cursors encoded as anchors
//! - [`convert`] — one-shot conversions without a view
//! - [`debug`] — text dump of a shared tree

pub mod binding;
pub mod convert;
pub mod debug;
pub mod diff;
pub mod error;
pub mod mapping;
pub mod marks;
pub mod position;
pub mod presence;
pub mod project;
pub mod scheduler;
pub mod shared;
pub mod undo;
pub mod version;
pub mod view;

pub use binding::{Binding, BindingOptions, SyncState};
pub use convert::{
    fragment_to_json, init_local_doc, json_to_fragment, json_to_shared_doc,
    local_to_fragment, local_to_shared_doc, shared_to_local_fragment, shared_to_local_root,
};
pub use debug::debug_shared_tree;
pub use diff::{simple_diff, sync, SyncContext, SyncStats, TextDiff};
pub use error::BindingError;
pub use mapping::{Mapped, Mapping};
pub use marks::{decode_key, decode_marks, MarkCodec, CHANGE_MARK};
pub use position::{to_anchor, to_offset, Anchor, SelectionSnapshot};
pub use presence::{local_cursor_state, CursorColor, CursorState, PresenceMap, RemoteSelection};
pub use project::{
    empty_prev, project, project_history, project_root, HistoryView, ProjectContext, Projection,
};
pub use scheduler::{ChangeNotice, Scheduler};
pub use shared::{new_shared_doc, ChangeKind, ClientId, NodeKey, SharedContainer, SharedNode};
pub use undo::{
    default_delete_filter, DeleteFilter, FilterSubject, SelectionMeta, UndoHistory, UndoOptions,
};
pub use version::{
    plain_annotation, ChangeAnnotator, ColorDef, UserAnnotator, UserRegistry, VersionSnapshot,
};
pub use view::{HeadlessView, HostView, LocalChange, UpdateMeta, ViewUpdate};
