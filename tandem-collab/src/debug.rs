//! Human-readable dump of a shared tree, for logs and failing tests.
//!
//! ```text
//! prosemirror
//! ├─ <paragraph> [1:0] align="left"
//! │  └─ text [1:1] "hello " | "world" {bold}
//! └─ <heading> [2:7] level=2
//! ```

use std::fmt::Write;

use tandem_core::Attrs;
use yrs::ReadTxn;

use crate::shared::{element_attrs, text_chunks, NodeKey, SharedContainer, SharedNode};

/// Render every node under `root` with its identity, attributes and text
/// chunks.
pub fn debug_shared_tree<T: ReadTxn>(txn: &T, root: &SharedContainer) -> String {
    let mut out = String::new();
    let title = match root.key() {
        NodeKey::Root(name) => name.to_string(),
        NodeKey::Item(id) => format!("<{}> {}", root.tag().unwrap_or("?"), identity(&id)),
    };
    out.push_str(&title);
    out.push('\n');
    write_children(txn, root, "", &mut out);
    out
}

fn identity(id: &yrs::ID) -> String {
    format!("[{}:{}]", id.client, id.clock)
}

fn format_attrs(attrs: &Attrs) -> String {
    attrs
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => format!("{key}=\"{s}\""),
            other => format!("{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_children<T: ReadTxn>(txn: &T, container: &SharedContainer, indent: &str, out: &mut String) {
    let children = container.children(txn);
    let count = children.len();
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == count;
        let branch = if last { "└─ " } else { "├─ " };
        let id = child
            .key()
            .item_id()
            .map(identity)
            .unwrap_or_default();
        match child {
            SharedNode::Element(el) => {
                let attrs = format_attrs(&element_attrs(txn, el));
                let _ = writeln!(out, "{indent}{branch}<{}> {id} {attrs}", el.tag());
                let nested = format!("{indent}{}", if last { "   " } else { "│  " });
                write_children(txn, &SharedContainer::from(el.clone()), &nested, out);
            }
            SharedNode::Text(text) => {
                let chunks: Vec<String> = text_chunks(txn, text)
                    .iter()
                    .map(|chunk| {
                        if chunk.attrs.is_empty() {
                            format!("{:?}", chunk.text)
                        } else {
                            let keys: Vec<&str> = chunk.attrs.keys().map(String::as_str).collect();
                            format!("{:?} {{{}}}", chunk.text, keys.join(", "))
                        }
                    })
                    .collect();
                let _ = writeln!(out, "{indent}{branch}text {id} {}", chunks.join(" | "));
            }
        }
    }
}
