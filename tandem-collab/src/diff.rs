//! Tree diff synchronizer: make a shared subtree equal to a local subtree
//! with as few shared operations as possible.
//!
//! Children are compared as sequences. Local text nodes are grouped into
//! runs first, so each shared text node lines up with one group:
//!
//! ```text
//! shared:  [ p ][ p ][ text ][ h ]
//! local:   [ p ][ p' ][ "ab" "cd"(em) ][ h ]
//!            └─ equal prefix ─┘         └ equal suffix
//!                  └── middle: update in place, or replace ──┘
//! ```
//!
//! Prefix and suffix are matched through the mapping table (identity) and
//! then deep equality. In the middle, an element whose type matches is
//! updated recursively. When both ends could be updated, the side with the
//! better equality factor wins. Anything else is deleted and recreated.

use serde_json::Value;
use tandem_core::{utf16_len, Attrs, Node, Schema};
use yrs::{Text, TransactionMut, Xml, XmlElementRef, XmlTextRef};

use crate::error::BindingError;
use crate::mapping::Mapping;
use crate::marks::MarkCodec;
use crate::shared::{
    element_attrs, json_to_any, normalize_json, text_chunks, text_len, to_yrs_attrs,
    SharedContainer, SharedNode,
};

/// Everything a sync pass reads and updates besides the trees.
pub struct SyncContext<'a> {
    pub schema: &'a Schema,
    pub mapping: &'a mut Mapping,
    pub codec: &'a mut MarkCodec,
}

/// Shared operations issued by one sync pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub inserted: usize,
    pub deleted: usize,
    pub text_patches: usize,
    pub attr_updates: usize,
}

impl SyncStats {
    pub fn is_noop(&self) -> bool {
        *self == SyncStats::default()
    }
}

/// Local child as seen by the sequence diff.
enum LocalChild<'a> {
    Element(&'a Node),
    Text(&'a [Node]),
}

fn local_children(node: &Node) -> Vec<LocalChild<'_>> {
    let content = node.content();
    let mut children = Vec::new();
    let mut i = 0;
    while i < content.len() {
        if content[i].is_text() {
            let start = i;
            while i < content.len() && content[i].is_text() {
                i += 1;
            }
            children.push(LocalChild::Text(&content[start..i]));
        } else {
            children.push(LocalChild::Element(&content[i]));
            i += 1;
        }
    }
    children
}

fn name_matches(shared: &SharedNode, local: &LocalChild<'_>) -> bool {
    match (shared, local) {
        (SharedNode::Element(el), LocalChild::Element(node)) => el.tag().as_ref() == node.type_name(),
        _ => false,
    }
}

struct EqualityFactor {
    factor: usize,
    found_mapped: bool,
}

impl SyncContext<'_> {
    fn is_mapped(&self, shared: &SharedNode, local: &LocalChild<'_>) -> bool {
        match (self.mapping.get(&shared.key()), local) {
            (Some(mapped), LocalChild::Element(node)) => mapped.is_element(node),
            (Some(mapped), LocalChild::Text(nodes)) => mapped.is_text_group(nodes),
            (None, _) => false,
        }
    }

    fn record(&mut self, shared: &SharedNode, local: &LocalChild<'_>) {
        match local {
            LocalChild::Element(node) => self.mapping.set_element(shared.key(), (*node).clone()),
            LocalChild::Text(nodes) => self.mapping.set_text(shared.key(), nodes.to_vec()),
        }
    }

    /// Shared attributes for a local text node's marks.
    fn text_attrs(&mut self, node: &Node) -> Attrs {
        self.codec
            .encode(self.schema, node.marks())
            .into_iter()
            .map(|(key, value)| (key, normalize_json(&value)))
            .collect()
    }

    fn equal_text(&mut self, txn: &TransactionMut, text: &XmlTextRef, nodes: &[Node]) -> bool {
        let chunks = text_chunks(txn, text);
        chunks.len() == nodes.len()
            && chunks.iter().zip(nodes).all(|(chunk, node)| {
                node.text() == Some(chunk.text.as_str()) && self.text_attrs(node) == chunk.attrs
            })
    }

    fn equal_node(&mut self, txn: &TransactionMut, shared: &SharedNode, local: &LocalChild<'_>) -> bool {
        match (shared, local) {
            (SharedNode::Element(el), LocalChild::Element(node)) => {
                if el.tag().as_ref() != node.type_name() {
                    return false;
                }
                let local_children = local_children(node);
                let shared_children = SharedContainer::from(el.clone()).children(txn);
                shared_children.len() == local_children.len()
                    && equal_attrs(&element_attrs(txn, el), node.attrs())
                    && shared_children
                        .iter()
                        .zip(&local_children)
                        .all(|(s, l)| self.equal_node(txn, s, l))
            }
            (SharedNode::Text(text), LocalChild::Text(nodes)) => self.equal_text(txn, text, nodes),
            _ => false,
        }
    }

    /// How many children of `shared` match `local` from both ends, and
    /// whether any of them matched through the mapping table.
    fn equality_factor(&mut self, txn: &TransactionMut, shared: &XmlElementRef, local: &Node) -> EqualityFactor {
        let y_children = SharedContainer::from(shared.clone()).children(txn);
        let p_children = local_children(local);
        let (yc, pc) = (y_children.len(), p_children.len());
        let min = yc.min(pc);
        let mut found_mapped = false;
        let mut left = 0;
        while left < min {
            let (y, p) = (&y_children[left], &p_children[left]);
            if self.is_mapped(y, p) {
                found_mapped = true;
            } else if !self.equal_node(txn, y, p) {
                break;
            }
            left += 1;
        }
        let mut right = 0;
        while left + right < min {
            let (y, p) = (&y_children[yc - right - 1], &p_children[pc - right - 1]);
            if self.is_mapped(y, p) {
                found_mapped = true;
            } else if !self.equal_node(txn, y, p) {
                break;
            }
            right += 1;
        }
        EqualityFactor {
            factor: left + right,
            found_mapped,
        }
    }
}

/// Attribute equality after dropping nulls and normalizing numbers.
fn equal_attrs(shared: &Attrs, local: &Attrs) -> bool {
    let local: Attrs = local
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), normalize_json(v)))
        .collect();
    *shared == local
}

/// Make `shared` equal to `local`. For an element container the types must
/// match; the root fragment has no type.
pub fn sync(
    txn: &mut TransactionMut,
    shared: &SharedContainer,
    local: &Node,
    ctx: &mut SyncContext<'_>,
) -> Result<SyncStats, BindingError> {
    let mut stats = SyncStats::default();
    sync_container(txn, shared, local, ctx, &mut stats)?;
    Ok(stats)
}

fn sync_container(
    txn: &mut TransactionMut,
    shared: &SharedContainer,
    local: &Node,
    ctx: &mut SyncContext<'_>,
    stats: &mut SyncStats,
) -> Result<(), BindingError> {
    if let Some(tag) = shared.tag() {
        if tag != local.type_name() {
            return Err(BindingError::NodeNameMismatch {
                shared: tag.to_string(),
                local: local.type_name().to_string(),
            });
        }
    }
    ctx.mapping.set_element(shared.key(), local.clone());
    if let SharedContainer::Element(el) = shared {
        stats.attr_updates += sync_attrs(txn, el, local.attrs());
    }

    let p_children = local_children(local);
    let y_children = shared.children(&*txn);
    let (pc, yc) = (p_children.len(), y_children.len());
    let min = pc.min(yc);

    let mut left = 0;
    while left < min {
        let (y, p) = (&y_children[left], &p_children[left]);
        if !ctx.is_mapped(y, p) {
            if ctx.equal_node(txn, y, p) {
                ctx.record(y, p);
            } else {
                break;
            }
        }
        left += 1;
    }
    let mut right = 0;
    while left + right < min {
        let (y, p) = (&y_children[yc - right - 1], &p_children[pc - right - 1]);
        if !ctx.is_mapped(y, p) {
            if ctx.equal_node(txn, y, p) {
                ctx.record(y, p);
            } else {
                break;
            }
        }
        right += 1;
    }

    while yc > left + right && pc > left + right {
        let (left_y, left_p) = (&y_children[left], &p_children[left]);
        let (right_y, right_p) = (&y_children[yc - right - 1], &p_children[pc - right - 1]);

        if let (SharedNode::Text(text), LocalChild::Text(nodes)) = (left_y, left_p) {
            if ctx.equal_text(txn, text, nodes) {
                ctx.record(left_y, left_p);
            } else {
                update_text(txn, text, nodes, ctx);
                stats.text_patches += 1;
            }
            left += 1;
            continue;
        }

        let mut update_left = name_matches(left_y, left_p);
        let mut update_right = name_matches(right_y, right_p);
        if update_left && update_right {
            if let (
                SharedNode::Element(ly),
                LocalChild::Element(lp),
                SharedNode::Element(ry),
                LocalChild::Element(rp),
            ) = (left_y, left_p, right_y, right_p)
            {
                let l = ctx.equality_factor(txn, ly, lp);
                let r = ctx.equality_factor(txn, ry, rp);
                if l.found_mapped && !r.found_mapped {
                    update_right = false;
                } else if !l.found_mapped && r.found_mapped {
                    update_left = false;
                } else if l.factor < r.factor {
                    update_left = false;
                } else {
                    update_right = false;
                }
            }
        }

        match (update_left, update_right) {
            (true, _) => {
                if let (SharedNode::Element(el), LocalChild::Element(node)) = (left_y, left_p) {
                    sync_container(txn, &SharedContainer::from(el.clone()), node, ctx, stats)?;
                }
                left += 1;
            }
            (false, true) => {
                if let (SharedNode::Element(el), LocalChild::Element(node)) = (right_y, right_p) {
                    sync_container(txn, &SharedContainer::from(el.clone()), node, ctx, stats)?;
                }
                right += 1;
            }
            (false, false) => {
                ctx.mapping.remove(&left_y.key());
                shared.remove_range(txn, left as u32, 1);
                create_child(txn, shared, left as u32, left_p, ctx);
                stats.deleted += 1;
                stats.inserted += 1;
                left += 1;
            }
        }
    }

    let del_len = yc - left - right;
    match y_children.first() {
        // A lone text run losing all its local content keeps its shared
        // node, so concurrent remote insertions into it survive.
        Some(SharedNode::Text(text)) if yc == 1 && pc == 0 => {
            ctx.mapping.remove(&y_children[0].key());
            let len = text_len(&*txn, text);
            if len > 0 {
                text.remove_range(txn, 0, len);
                stats.text_patches += 1;
            }
        }
        _ if del_len > 0 => {
            for child in &y_children[left..left + del_len] {
                ctx.mapping.remove(&child.key());
            }
            shared.remove_range(txn, left as u32, del_len as u32);
            stats.deleted += del_len;
        }
        _ => {}
    }

    for (offset, child) in p_children[left..pc - right].iter().enumerate() {
        create_child(txn, shared, (left + offset) as u32, child, ctx);
        stats.inserted += 1;
    }
    Ok(())
}

/// Write local attributes onto a shared element. Returns the number of
/// attribute writes and removals issued.
fn sync_attrs(txn: &mut TransactionMut, el: &XmlElementRef, local: &Attrs) -> usize {
    let shared = element_attrs(&*txn, el);
    let mut updates = 0;
    for (key, value) in local {
        if value.is_null() {
            if shared.contains_key(key) {
                el.remove_attribute(txn, key);
                updates += 1;
            }
            continue;
        }
        if shared.get(key) != Some(&normalize_json(value)) {
            el.insert_attribute(txn, key.as_str(), json_to_any(value));
            updates += 1;
        }
    }
    for key in shared.keys().filter(|key| !local.contains_key(*key)) {
        el.remove_attribute(txn, key);
        updates += 1;
    }
    updates
}

/// Create the shared counterpart of a local child at `index` of `parent`.
fn create_child(
    txn: &mut TransactionMut,
    parent: &SharedContainer,
    index: u32,
    child: &LocalChild<'_>,
    ctx: &mut SyncContext<'_>,
) {
    match child {
        LocalChild::Element(node) => {
            let el = parent.insert_element(txn, index, node.type_name());
            for (key, value) in node.attrs().iter().filter(|(_, v)| !v.is_null()) {
                el.insert_attribute(txn, key.as_str(), json_to_any(value));
            }
            let container = SharedContainer::from(el);
            for (i, grandchild) in local_children(node).iter().enumerate() {
                create_child(txn, &container, i as u32, grandchild, ctx);
            }
            ctx.mapping.set_element(container.key(), (*node).clone());
        }
        LocalChild::Text(nodes) => {
            let text = parent.insert_text(txn, index);
            let mut offset = 0;
            for node in nodes.iter() {
                let chunk = node.text().unwrap_or_default();
                let attrs = ctx.text_attrs(node);
                text.insert_with_attributes(txn, offset, chunk, to_yrs_attrs(&attrs));
                offset += utf16_len(chunk);
            }
            ctx.mapping.set_text(SharedNode::Text(text).key(), nodes.to_vec());
        }
    }
}

/// Patch a shared text run to the content of a local text group: one
/// contiguous replace, then a formatting pass that clears stale keys.
fn update_text(txn: &mut TransactionMut, text: &XmlTextRef, nodes: &[Node], ctx: &mut SyncContext<'_>) {
    ctx.mapping
        .set_text(SharedNode::Text(text.clone()).key(), nodes.to_vec());
    let chunks = text_chunks(&*txn, text);
    let stale: Attrs = chunks
        .iter()
        .flat_map(|chunk| chunk.attrs.keys())
        .map(|key| (key.clone(), Value::Null))
        .collect();
    let current: String = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
    let target: String = nodes.iter().filter_map(Node::text).collect();

    let diff = simple_diff(&current, &target);
    if diff.remove > 0 {
        text.remove_range(txn, diff.index, diff.remove);
    }
    if !diff.insert.is_empty() {
        text.insert(txn, diff.index, &diff.insert);
    }

    let mut offset = 0;
    for node in nodes {
        let len = utf16_len(node.text().unwrap_or_default());
        let mut attrs = stale.clone();
        attrs.extend(ctx.text_attrs(node));
        if !attrs.is_empty() {
            text.format(txn, offset, len, to_yrs_attrs(&attrs));
        }
        offset += len;
    }
}

/// A single contiguous replacement turning one string into another, in
/// UTF-16 units. Surrogate pairs are never split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDiff {
    pub index: u32,
    pub remove: u32,
    pub insert: String,
}

fn is_high_surrogate(unit: u16) -> bool {
    (0xD800..0xDC00).contains(&unit)
}

fn is_low_surrogate(unit: u16) -> bool {
    (0xDC00..0xE000).contains(&unit)
}

pub fn simple_diff(a: &str, b: &str) -> TextDiff {
    let a: Vec<u16> = a.encode_utf16().collect();
    let b: Vec<u16> = b.encode_utf16().collect();
    let mut left = 0;
    while left < a.len() && left < b.len() && a[left] == b[left] {
        left += 1;
    }
    if left > 0 && is_high_surrogate(a[left - 1]) {
        left -= 1;
    }
    let mut right = 0;
    while right + left < a.len() && right + left < b.len() && a[a.len() - right - 1] == b[b.len() - right - 1]
    {
        right += 1;
    }
    if right > 0 && is_low_surrogate(a[a.len() - right]) {
        right -= 1;
    }
    TextDiff {
        index: left as u32,
        remove: (a.len() - left - right) as u32,
        insert: String::from_utf16_lossy(&b[left..b.len() - right]),
    }
}
