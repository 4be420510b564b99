//! # tandem-core — local document model
//!
//! The editor-side half of a tandem binding: an immutable, schema-checked
//! document tree that a host view renders and edits, and that
//! `tandem-collab` keeps in step with a shared CRDT tree.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  node()/text()/mark()  ┌─────────────┐
//! │  Schema    │ ─────────────────────► │ Node (Arc)  │
//! │ (specs +   │                        │ immutable,  │
//! │  rules)    │ ◄───── from_json ───── │ shared      │
//! └────────────┘                        └──────┬──────┘
//!                                              │
//!                                              ▼
//!                                       ┌─────────────┐
//!                                       │ EditorState │
//!                                       │ doc + sel   │
//!                                       └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`schema`] — node/mark types, content rules, attribute defaults
//! - [`node`] — immutable nodes, marks, sizes and positions
//! - [`selection`] — selections and editor state
//! - [`json`] — JSON encoding

pub mod json;
pub mod node;
pub mod schema;
pub mod selection;

pub use node::{utf16_len, Attrs, Mark, Node};
pub use schema::{AttrSpec, MarkSpec, NodeSpec, Schema, SchemaError, TEXT_TYPE};
pub use selection::{EditorState, Selection, SelectionKind};
