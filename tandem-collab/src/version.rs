//! Version snapshots and change attribution.
//!
//! A [`VersionSnapshot`] fixes a visible subset of the shared tree's history.
//! Rendering the difference between two of them needs to know who wrote or
//! removed each piece of content; [`UserRegistry`] keeps that record and
//! [`UserAnnotator`] turns it into the annotation attached to changed nodes.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{DeleteSet, ReadTxn, Snapshot, StateVector, ID};

use crate::error::BindingError;
use crate::shared::{is_visible, ChangeKind, ClientId};

// ───────────────────────────────────────────────────────────────────
// Snapshots
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct VersionSnapshot(Snapshot);

impl VersionSnapshot {
    pub fn capture<T: ReadTxn>(txn: &T) -> Self {
        Self(txn.snapshot())
    }

    /// The version before anything was written.
    pub fn empty() -> Self {
        Self(Snapshot::new(StateVector::default(), DeleteSet::default()))
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.0
    }

    pub fn encode(&self) -> Vec<u8> {
        self.0.encode_v1()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BindingError> {
        Ok(Self(Snapshot::decode_v1(bytes)?))
    }

    /// Whether the item `id` exists and is not deleted in this version.
    pub fn contains(&self, id: &ID) -> bool {
        is_visible(id, &self.0)
    }
}

impl From<Snapshot> for VersionSnapshot {
    fn from(snapshot: Snapshot) -> Self {
        Self(snapshot)
    }
}

/// Produces the annotation value attached to content that differs between
/// two rendered versions.
pub trait ChangeAnnotator {
    fn annotate(&mut self, kind: ChangeKind, id: &ID) -> Value;
}

/// Annotation used when no annotator is supplied.
pub fn plain_annotation(kind: ChangeKind) -> Value {
    json!({ "type": kind.as_str() })
}

// ───────────────────────────────────────────────────────────────────
// Attribution
// ───────────────────────────────────────────────────────────────────

/// Which user wrote with which replica id, and which deletions each user
/// made.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct UserRegistry {
    clients: BTreeMap<ClientId, String>,
    /// User → v1-encoded delete set of everything they removed.
    deletions: BTreeMap<String, Vec<u8>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_client(&mut self, client: ClientId, user: &str) {
        self.clients.insert(client, user.to_string());
    }

    pub fn record_deletions(&mut self, user: &str, deleted: &DeleteSet) {
        if deleted.is_empty() {
            return;
        }
        let mut merged = self
            .deletions
            .get(user)
            .and_then(|bytes| DeleteSet::decode_v1(bytes).ok())
            .unwrap_or_default();
        merged.merge(deleted.clone());
        merged.squash();
        self.deletions.insert(user.to_string(), merged.encode_v1());
    }

    pub fn user_by_client(&self, client: ClientId) -> Option<&str> {
        self.clients.get(&client).map(String::as_str)
    }

    pub fn user_by_deleted_id(&self, id: &ID) -> Option<&str> {
        self.deletions.iter().find_map(|(user, bytes)| {
            let deleted = DeleteSet::decode_v1(bytes).ok()?;
            deleted.is_deleted(id).then_some(user.as_str())
        })
    }

    pub fn users(&self) -> impl Iterator<Item = &str> {
        let mut users: Vec<&str> = self.clients.values().map(String::as_str).collect();
        users.sort_unstable();
        users.dedup();
        users.into_iter()
    }
}

/// Highlight colors for one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorDef {
    pub light: String,
    pub dark: String,
}

impl ColorDef {
    pub fn new(light: impl Into<String>, dark: impl Into<String>) -> Self {
        Self {
            light: light.into(),
            dark: dark.into(),
        }
    }
}

impl Default for ColorDef {
    fn default() -> Self {
        Self::new("#ecd44433", "#ecd444")
    }
}

/// Attributes changes to users and gives each user a stable color: the first
/// color nobody uses yet, then a reuse derived from the user name once the
/// palette is exhausted.
#[derive(Debug, Clone)]
pub struct UserAnnotator {
    registry: UserRegistry,
    colors: Vec<ColorDef>,
    assigned: HashMap<String, ColorDef>,
}

impl UserAnnotator {
    pub fn new(registry: UserRegistry, colors: Vec<ColorDef>) -> Self {
        let colors = if colors.is_empty() {
            vec![ColorDef::default()]
        } else {
            colors
        };
        Self {
            registry,
            colors,
            assigned: HashMap::new(),
        }
    }

    pub fn color_of(&mut self, user: &str) -> ColorDef {
        if let Some(color) = self.assigned.get(user) {
            return color.clone();
        }
        let unused = self
            .colors
            .iter()
            .find(|color| !self.assigned.values().any(|used| used == *color))
            .cloned();
        let color = unused.unwrap_or_else(|| {
            let seed = user.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
            self.colors[seed % self.colors.len()].clone()
        });
        self.assigned.insert(user.to_string(), color.clone());
        color
    }
}

impl ChangeAnnotator for UserAnnotator {
    fn annotate(&mut self, kind: ChangeKind, id: &ID) -> Value {
        let user = match kind {
            ChangeKind::Added => self.registry.user_by_client(id.client),
            ChangeKind::Removed => self.registry.user_by_deleted_id(id),
        }
        .map(str::to_string);
        let color = self.color_of(user.as_deref().unwrap_or_default());
        json!({
            "type": kind.as_str(),
            "user": user,
            "color": { "light": color.light, "dark": color.dark },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::new_shared_doc;
    use yrs::{Text, Transact};

    #[test]
    fn test_snapshot_encoding_and_visibility() {
        let doc = new_shared_doc(Some(4));
        let text = doc.get_or_insert_text("t");
        let before = VersionSnapshot::capture(&doc.transact());
        text.insert(&mut doc.transact_mut(), 0, "abc");
        let after = VersionSnapshot::capture(&doc.transact());

        let first = ID::new(4, 0);
        assert!(!before.contains(&first));
        assert!(after.contains(&first));
        assert_eq!(VersionSnapshot::decode(&after.encode()).unwrap(), after);
        assert!(!VersionSnapshot::empty().contains(&first));
    }

    #[test]
    fn test_registry_attributes_deletions() {
        let doc = new_shared_doc(Some(9));
        let text = doc.get_or_insert_text("t");
        text.insert(&mut doc.transact_mut(), 0, "abc");

        let mut registry = UserRegistry::new();
        registry.register_client(9, "ada");
        {
            let mut txn = doc.transact_mut();
            text.remove_range(&mut txn, 0, 1);
            registry.record_deletions("grace", txn.delete_set());
        }
        assert_eq!(registry.user_by_client(9), Some("ada"));
        assert_eq!(registry.user_by_deleted_id(&ID::new(9, 0)), Some("grace"));
        assert_eq!(registry.user_by_deleted_id(&ID::new(9, 2)), None);

        let restored: UserRegistry =
            serde_json::from_str(&serde_json::to_string(&registry).unwrap()).unwrap();
        assert_eq!(restored.user_by_deleted_id(&ID::new(9, 0)), Some("grace"));
    }

    #[test]
    fn test_colors_unique_until_exhausted() {
        let colors = vec![ColorDef::new("#a1", "#a"), ColorDef::new("#b1", "#b")];
        let mut annotator = UserAnnotator::new(UserRegistry::new(), colors.clone());
        let a = annotator.color_of("ada");
        let b = annotator.color_of("grace");
        assert_ne!(a, b);
        assert_eq!(annotator.color_of("ada"), a);
        assert!(colors.contains(&annotator.color_of("linus")));
    }

    #[test]
    fn test_annotation_shape() {
        let mut registry = UserRegistry::new();
        registry.register_client(3, "ada");
        let mut annotator = UserAnnotator::new(registry, vec![]);
        let value = annotator.annotate(ChangeKind::Added, &ID::new(3, 0));
        assert_eq!(value["type"], "added");
        assert_eq!(value["user"], "ada");
        assert_eq!(value["color"]["dark"], "#ecd444");
    }
}
