//! Collaborator cursors.
//!
//! A replica publishes its selection as a pair of encoded anchors, so a
//! peer can resolve it against its own local tree even when both trees
//! have changed since.
//!
//! ```text
//! local selection ──anchor_at──► CursorState { anchor, head } (base64)
//!                                      │
//!                                      ▼   (any awareness transport)
//! PresenceMap::update(client, state)
//!       │
//!       ▼
//! resolve(&binding) ──offset_of──► RemoteSelection { from, to, color }
//! ```
//!
//! Anchors that no longer resolve drop the cursor for that round.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::binding::Binding;
use crate::error::BindingError;
use crate::position::Anchor;
use crate::shared::ClientId;

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for rendering a remote cursor and its selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// A stable, distinct color for a replica. Consecutive client ids are
    /// spread around the hue circle by the golden ratio.
    pub fn from_client(client: ClientId) -> Self {
        let hue = (client as f64 * 0.618_033_988_749_895).fract() as f32;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb` for style sheets.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }

    pub fn with_alpha(self, a: f32) -> Self {
        Self { a, ..self }
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Cursor state
// ───────────────────────────────────────────────────────────────────

/// A selection as published to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub anchor: String,
    pub head: String,
}

impl CursorState {
    pub fn new(anchor: &Anchor, head: &Anchor) -> Self {
        Self {
            anchor: STANDARD.encode(anchor.encode()),
            head: STANDARD.encode(head.encode()),
        }
    }

    pub fn anchors(&self) -> Result<(Anchor, Anchor), BindingError> {
        let decode = |text: &str| {
            let bytes = STANDARD
                .decode(text)
                .map_err(|e| BindingError::Decode(e.to_string()))?;
            Anchor::decode(&bytes)
        };
        Ok((decode(&self.anchor)?, decode(&self.head)?))
    }
}

/// The cursor state to publish for the binding's current view selection.
pub fn local_cursor_state(binding: &Binding) -> Option<CursorState> {
    let selection = binding.view()?.state().selection;
    let anchor = binding.anchor_at(selection.anchor);
    let head = binding.anchor_at(selection.head);
    Some(CursorState::new(&anchor, &head))
}

/// A peer's selection in local positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteSelection {
    pub client: ClientId,
    pub anchor: u32,
    pub head: u32,
    pub color: CursorColor,
}

impl RemoteSelection {
    pub fn from(&self) -> u32 {
        self.anchor.min(self.head)
    }

    pub fn to(&self) -> u32 {
        self.anchor.max(self.head)
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

/// Cursor states of the other replicas, keyed by client id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceMap {
    states: HashMap<ClientId, CursorState>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer's state; `None` means the peer cleared its cursor.
    pub fn update(&mut self, client: ClientId, state: Option<CursorState>) {
        match state {
            Some(state) => {
                self.states.insert(client, state);
            }
            None => {
                self.states.remove(&client);
            }
        }
    }

    pub fn remove(&mut self, client: ClientId) -> Option<CursorState> {
        self.states.remove(&client)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Resolve every peer cursor against the binding's local tree, sorted
    /// by client id. The binding's own client and cursors whose anchors no
    /// longer resolve are left out; positions are clamped to the document.
    pub fn resolve(&self, binding: &Binding) -> Vec<RemoteSelection> {
        let Some(view) = binding.view() else {
            return Vec::new();
        };
        let max = view.state().doc.content_size();
        let own = binding.client_id();
        let mut resolved: Vec<RemoteSelection> = self
            .states
            .iter()
            .filter(|(client, _)| **client != own)
            .filter_map(|(client, state)| {
                let (anchor, head) = match state.anchors() {
                    Ok(anchors) => anchors,
                    Err(err) => {
                        log::debug!("dropping cursor of client {client}: {err}");
                        return None;
                    }
                };
                let anchor = binding.offset_of(&anchor)?.min(max);
                let head = binding.offset_of(&head)?.min(max);
                Some(RemoteSelection {
                    client: *client,
                    anchor,
                    head,
                    color: CursorColor::from_client(*client),
                })
            })
            .collect();
        resolved.sort_by_key(|selection| selection.client);
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingOptions;
    use crate::shared::new_shared_doc;
    use crate::view::{HeadlessView, HostView, LocalChange};
    use std::rc::Rc;
    use std::sync::Arc;
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

    fn attached(client: ClientId) -> (Binding, HeadlessView) {
        let binding = Binding::open(new_shared_doc(Some(client)), BindingOptions::for_testing());
        let view = HeadlessView::empty(schema()).unwrap();
        binding.init_view(Rc::new(view.clone())).unwrap();
        (binding, view)
    }

    #[test]
    fn test_color_stable_and_hex() {
        let a = CursorColor::from_client(7);
        assert_eq!(a, CursorColor::from_client(7));
        assert_ne!(a, CursorColor::from_client(8));
        let hex = a.to_hex();
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
    }

    #[test]
    fn test_invalid_state_does_not_decode() {
        let state = CursorState {
            anchor: "not base64!".into(),
            head: String::new(),
        };
        assert!(state.anchors().is_err());
    }

    #[test]
    fn test_remote_cursor_resolves_on_peer() {
        let (a, view_a) = attached(1);
        let (b, _view_b) = attached(2);
        let schema = view_a.schema();
        let text = schema.text("hello", vec![]).unwrap();
        let para = schema.node("paragraph", Attrs::new(), vec![text]).unwrap();
        view_a.edit(schema.top_node(vec![para]).unwrap());
        a.local_changed(LocalChange::tracked()).unwrap();
        b.apply_update(&a.encode_diff(&b.state_vector()).unwrap()).unwrap();
        b.run_pending().unwrap();

        view_a.set_selection(Selection::text(2, 4));
        let state = local_cursor_state(&a).unwrap();

        let mut presence = PresenceMap::new();
        presence.update(1, Some(state.clone()));
        presence.update(2, Some(state));
        let remote = presence.resolve(&b);
        assert_eq!(remote.len(), 1, "own client must be skipped");
        assert_eq!(remote[0].client, 1);
        assert_eq!((remote[0].from(), remote[0].to()), (2, 4));

        presence.update(1, None);
        assert!(presence.resolve(&b).is_empty());
    }
}
