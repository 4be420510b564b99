//! Document schema: node types, mark types, content rules and attribute
//! defaults.
//!
//! A schema is the only way to build [`Node`]s and [`Mark`]s, so every tree
//! handed out by this crate has passed the checks below:
//!
//! - the node type exists and is not `text` (text goes through [`Schema::text`])
//! - every attribute without a default was supplied
//! - every child type is admitted by the parent's content rule
//! - leaf types carry no content
//!
//! Cardinality (`+`) is only enforced by [`Schema::create_and_fill`]; a
//! transiently empty container produced by a concurrent merge is still a
//! valid node.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::node::{Attrs, Mark, Node};

/// Name of the built-in text node type.
pub const TEXT_TYPE: &str = "text";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("unknown node type `{0}`")]
    UnknownNodeType(String),

    #[error("unknown mark type `{0}`")]
    UnknownMarkType(String),

    #[error("missing required attribute `{attr}` on `{type_name}`")]
    MissingAttribute { type_name: String, attr: String },

    #[error("`{child}` is not allowed inside `{parent}`")]
    InvalidContent { parent: String, child: String },

    #[error("empty text nodes are not allowed")]
    EmptyText,

    #[error("invalid content expression `{expr}` on `{type_name}`: {reason}")]
    InvalidContentExpr {
        type_name: String,
        expr: String,
        reason: String,
    },

    #[error("schema does not define the top node type `{0}`")]
    MissingTopNode(String),

    #[error("cannot fill required content of `{0}`")]
    CannotFill(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(String),
}

// ───────────────────────────────────────────────────────────────────
// Specs
// ───────────────────────────────────────────────────────────────────

/// One attribute of a node or mark type. `default: None` means required.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrSpec {
    pub name: String,
    pub default: Option<Value>,
}

/// Declarative description of a node type.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    /// Content expression, e.g. `"block+"`, `"inline*"`, `"(paragraph | heading)+"`.
    /// `None` makes the type a leaf.
    pub content: Option<String>,
    /// Space separated group names, e.g. `"block"`.
    pub group: Option<String>,
    pub inline: bool,
    pub attrs: Vec<AttrSpec>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: None,
            group: None,
            inline: false,
            attrs: Vec::new(),
        }
    }

    pub fn content(mut self, expr: impl Into<String>) -> Self {
        self.content = Some(expr.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn inline(mut self) -> Self {
        self.inline = true;
        self
    }

    pub fn attr(mut self, name: impl Into<String>, default: Value) -> Self {
        self.attrs.push(AttrSpec {
            name: name.into(),
            default: Some(default),
        });
        self
    }

    pub fn required_attr(mut self, name: impl Into<String>) -> Self {
        self.attrs.push(AttrSpec {
            name: name.into(),
            default: None,
        });
        self
    }
}

/// Declarative description of a mark type.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkSpec {
    pub name: String,
    pub attrs: Vec<AttrSpec>,
    /// Space separated mark names this mark excludes. `None` excludes only
    /// marks of the same type, `Some("")` excludes nothing (the mark may
    /// overlap itself), `Some("_")` excludes every mark.
    pub excludes: Option<String>,
}

impl MarkSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            excludes: None,
        }
    }

    pub fn attr(mut self, name: impl Into<String>, default: Value) -> Self {
        self.attrs.push(AttrSpec {
            name: name.into(),
            default: Some(default),
        });
        self
    }

    pub fn required_attr(mut self, name: impl Into<String>) -> Self {
        self.attrs.push(AttrSpec {
            name: name.into(),
            default: None,
        });
        self
    }

    pub fn excludes(mut self, expr: impl Into<String>) -> Self {
        self.excludes = Some(expr.into());
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Compiled schema
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct ContentRule {
    allowed: Vec<String>,
    min: usize,
    max: Option<usize>,
}

impl ContentRule {
    fn allows(&self, type_name: &str) -> bool {
        self.allowed.iter().any(|name| name == type_name)
    }
}

#[derive(Debug, Clone)]
struct NodeType {
    spec: NodeSpec,
    content: Option<ContentRule>,
}

#[derive(Debug, Clone)]
struct MarkType {
    spec: MarkSpec,
    /// `None` = excludes every mark.
    excluded: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Schema {
    top: String,
    nodes: Vec<NodeType>,
    node_index: HashMap<String, usize>,
    marks: Vec<MarkType>,
    mark_index: HashMap<String, usize>,
}

impl Schema {
    /// Compile a schema. A `text` node type is added (in group `inline`)
    /// when `nodes` does not declare one.
    pub fn new(
        top: impl Into<String>,
        nodes: Vec<NodeSpec>,
        marks: Vec<MarkSpec>,
    ) -> Result<Self, SchemaError> {
        let top = top.into();
        let mut specs = nodes;
        if !specs.iter().any(|spec| spec.name == TEXT_TYPE) {
            specs.push(NodeSpec::new(TEXT_TYPE).group("inline").inline());
        }

        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for spec in &specs {
            if let Some(group) = &spec.group {
                for name in group.split_whitespace() {
                    groups.entry(name.to_string()).or_default().push(spec.name.clone());
                }
            }
        }

        let mut node_index = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            node_index.insert(spec.name.clone(), i);
        }
        if !node_index.contains_key(&top) {
            return Err(SchemaError::MissingTopNode(top));
        }

        let mut compiled = Vec::with_capacity(specs.len());
        for spec in specs {
            let content = match &spec.content {
                Some(expr) if spec.name != TEXT_TYPE => {
                    Some(parse_content(&spec.name, expr, &node_index, &groups)?)
                }
                _ => None,
            };
            compiled.push(NodeType { spec, content });
        }

        let mut mark_index = HashMap::new();
        for (i, spec) in marks.iter().enumerate() {
            mark_index.insert(spec.name.clone(), i);
        }
        let marks = marks
            .into_iter()
            .map(|spec| {
                let excluded = match spec.excludes.as_deref() {
                    None => Some(vec![spec.name.clone()]),
                    Some("_") => None,
                    Some(expr) => Some(expr.split_whitespace().map(str::to_string).collect()),
                };
                MarkType { spec, excluded }
            })
            .collect();

        Ok(Self {
            top,
            nodes: compiled,
            node_index,
            marks,
            mark_index,
        })
    }

    /// Name of the document's top node type.
    pub fn top_node_type(&self) -> &str {
        &self.top
    }

    pub fn has_node_type(&self, name: &str) -> bool {
        self.node_index.contains_key(name)
    }

    pub fn has_mark_type(&self, name: &str) -> bool {
        self.mark_index.contains_key(name)
    }

    pub fn node_spec(&self, name: &str) -> Option<&NodeSpec> {
        self.node_index.get(name).map(|&i| &self.nodes[i].spec)
    }

    pub fn mark_spec(&self, name: &str) -> Option<&MarkSpec> {
        self.mark_index.get(name).map(|&i| &self.marks[i].spec)
    }

    /// Whether marks of type `a` exclude marks of type `b`. A type that does
    /// not exclude itself can be applied several times with different
    /// attributes over the same range.
    pub fn mark_excludes(&self, a: &str, b: &str) -> bool {
        match self.mark_index.get(a).map(|&i| &self.marks[i].excluded) {
            Some(None) => true,
            Some(Some(names)) => names.iter().any(|name| name == b),
            None => false,
        }
    }

    /// Build an element node. Unknown attributes are dropped, missing ones
    /// take their defaults, and adjacent text children with equal marks are
    /// joined.
    pub fn node(
        &self,
        type_name: &str,
        attrs: Attrs,
        content: Vec<Node>,
    ) -> Result<Node, SchemaError> {
        let node_type = self
            .node_index
            .get(type_name)
            .filter(|_| type_name != TEXT_TYPE)
            .map(|&i| &self.nodes[i])
            .ok_or_else(|| SchemaError::UnknownNodeType(type_name.to_string()))?;

        let attrs = compute_attrs(type_name, &node_type.spec.attrs, attrs)?;

        match &node_type.content {
            None => {
                if let Some(child) = content.first() {
                    return Err(SchemaError::InvalidContent {
                        parent: type_name.to_string(),
                        child: child.type_name().to_string(),
                    });
                }
                Ok(Node::element(type_name, attrs, Vec::new(), true))
            }
            Some(rule) => {
                if let Some(child) = content.iter().find(|c| !rule.allows(c.type_name())) {
                    return Err(SchemaError::InvalidContent {
                        parent: type_name.to_string(),
                        child: child.type_name().to_string(),
                    });
                }
                Ok(Node::element(type_name, attrs, content, false))
            }
        }
    }

    /// Build the top node from `content`.
    pub fn top_node(&self, content: Vec<Node>) -> Result<Node, SchemaError> {
        self.node(&self.top, Attrs::new(), content)
    }

    /// Build a text node. Marks are sorted by schema rank.
    pub fn text(&self, text: impl Into<String>, marks: Vec<Mark>) -> Result<Node, SchemaError> {
        let text = text.into();
        if text.is_empty() {
            return Err(SchemaError::EmptyText);
        }
        for mark in &marks {
            if !self.has_mark_type(mark.type_name()) {
                return Err(SchemaError::UnknownMarkType(mark.type_name().to_string()));
            }
        }
        Ok(Node::text_node(text, sort_marks(marks)))
    }

    /// Build a mark, filling attribute defaults.
    pub fn mark(&self, type_name: &str, attrs: Attrs) -> Result<Mark, SchemaError> {
        let rank = *self
            .mark_index
            .get(type_name)
            .ok_or_else(|| SchemaError::UnknownMarkType(type_name.to_string()))?;
        let attrs = compute_attrs(type_name, &self.marks[rank].spec.attrs, attrs)?;
        Ok(Mark::new(type_name, attrs, rank))
    }

    /// Build a node of `type_name` with the minimal content its rule
    /// requires, filled recursively.
    pub fn create_and_fill(&self, type_name: &str) -> Result<Node, SchemaError> {
        let node_type = self
            .node_index
            .get(type_name)
            .map(|&i| &self.nodes[i])
            .ok_or_else(|| SchemaError::UnknownNodeType(type_name.to_string()))?;

        let mut content = Vec::new();
        if let Some(rule) = &node_type.content {
            if rule.min > 0 {
                let filler = rule
                    .allowed
                    .iter()
                    .filter(|name| name.as_str() != TEXT_TYPE && name.as_str() != type_name)
                    .find_map(|name| self.create_and_fill(name).ok())
                    .ok_or_else(|| SchemaError::CannotFill(type_name.to_string()))?;
                content = vec![filler; rule.min];
            }
        }
        self.node(type_name, Attrs::new(), content)
    }

    /// The document a fresh editor starts with.
    pub fn empty_doc(&self) -> Result<Node, SchemaError> {
        self.create_and_fill(&self.top)
    }

    /// Maximum child count of `type_name`, when its rule bounds it.
    pub fn max_children(&self, type_name: &str) -> Option<usize> {
        self.node_index
            .get(type_name)
            .and_then(|&i| self.nodes[i].content.as_ref())
            .and_then(|rule| rule.max)
    }
}

fn compute_attrs(type_name: &str, specs: &[AttrSpec], mut given: Attrs) -> Result<Attrs, SchemaError> {
    let mut attrs = Attrs::new();
    for spec in specs {
        let value = match given.remove(&spec.name) {
            Some(value) => value,
            None => spec.default.clone().ok_or_else(|| SchemaError::MissingAttribute {
                type_name: type_name.to_string(),
                attr: spec.name.clone(),
            })?,
        };
        attrs.insert(spec.name.clone(), value);
    }
    if !given.is_empty() {
        log::trace!(
            "dropping unknown attributes {:?} of `{type_name}`",
            given.keys().collect::<Vec<_>>()
        );
    }
    Ok(attrs)
}

/// Rank order; marks of one type (overlapping applications) are ordered by
/// their attributes so equal sets always compare equal.
fn sort_marks(mut marks: Vec<Mark>) -> Vec<Mark> {
    marks.sort_by_cached_key(|mark| (mark.rank(), crate::json::attrs_to_json(mark.attrs()).to_string()));
    marks
}

fn parse_content(
    type_name: &str,
    expr: &str,
    node_index: &HashMap<String, usize>,
    groups: &HashMap<String, Vec<String>>,
) -> Result<ContentRule, SchemaError> {
    let invalid = |reason: &str| SchemaError::InvalidContentExpr {
        type_name: type_name.to_string(),
        expr: expr.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Ok(ContentRule {
            allowed: Vec::new(),
            min: 0,
            max: Some(0),
        });
    }

    let (body, min, max) = match trimmed.as_bytes()[trimmed.len() - 1] {
        b'*' => (&trimmed[..trimmed.len() - 1], 0, None),
        b'+' => (&trimmed[..trimmed.len() - 1], 1, None),
        b'?' => (&trimmed[..trimmed.len() - 1], 0, Some(1)),
        _ => (trimmed, 1, Some(1)),
    };

    let mut body = body.trim();
    if body.starts_with('(') {
        body = body
            .strip_prefix('(')
            .and_then(|b| b.strip_suffix(')'))
            .ok_or_else(|| invalid("unbalanced parentheses"))?;
    }

    let mut allowed = Vec::new();
    for name in body.split('|').map(str::trim).filter(|name| !name.is_empty()) {
        if node_index.contains_key(name) {
            allowed.push(name.to_string());
        } else if let Some(members) = groups.get(name) {
            allowed.extend(members.iter().cloned());
        } else {
            return Err(invalid(&format!("unknown type or group `{name}`")));
        }
    }
    if allowed.is_empty() {
        return Err(invalid("no node types"));
    }

    Ok(ContentRule { allowed, min, max })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(
            "doc",
            vec![
                NodeSpec::new("doc").content("block+"),
                NodeSpec::new("paragraph").content("inline*").group("block"),
                NodeSpec::new("heading")
                    .content("inline*")
                    .group("block")
                    .attr("level", json!(1)),
                NodeSpec::new("image").group("inline").inline().required_attr("src"),
            ],
            vec![
                MarkSpec::new("strong"),
                MarkSpec::new("comment").attr("id", Value::Null).excludes(""),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_text_type_added_implicitly() {
        let schema = schema();
        assert!(schema.has_node_type("text"));
        assert!(schema.text("hi", vec![]).is_ok());
    }

    #[test]
    fn test_missing_top_node() {
        let err = Schema::new("doc", vec![NodeSpec::new("paragraph")], vec![]).unwrap_err();
        assert_eq!(err, SchemaError::MissingTopNode("doc".into()));
    }

    #[test]
    fn test_unknown_content_name() {
        let err = Schema::new("doc", vec![NodeSpec::new("doc").content("section+")], vec![]);
        assert!(matches!(err, Err(SchemaError::InvalidContentExpr { .. })));
    }

    #[test]
    fn test_attribute_defaults_and_unknown_dropped() {
        let schema = schema();
        let mut attrs = Attrs::new();
        attrs.insert("bogus".into(), json!(true));
        let heading = schema.node("heading", attrs, vec![]).unwrap();
        assert_eq!(heading.attrs().get("level"), Some(&json!(1)));
        assert!(heading.attrs().get("bogus").is_none());
    }

    #[test]
    fn test_required_attribute() {
        let schema = schema();
        let err = schema.node("image", Attrs::new(), vec![]).unwrap_err();
        assert!(matches!(err, SchemaError::MissingAttribute { .. }));
    }

    #[test]
    fn test_content_rule_rejects_block_in_paragraph() {
        let schema = schema();
        let inner = schema.node("paragraph", Attrs::new(), vec![]).unwrap();
        let err = schema.node("paragraph", Attrs::new(), vec![inner]).unwrap_err();
        assert_eq!(
            err,
            SchemaError::InvalidContent {
                parent: "paragraph".into(),
                child: "paragraph".into()
            }
        );
    }

    #[test]
    fn test_unknown_node_type() {
        let schema = schema();
        assert!(matches!(
            schema.node("table", Attrs::new(), vec![]),
            Err(SchemaError::UnknownNodeType(_))
        ));
        assert!(matches!(
            schema.node("text", Attrs::new(), vec![]),
            Err(SchemaError::UnknownNodeType(_))
        ));
    }

    #[test]
    fn test_empty_text_rejected() {
        assert_eq!(schema().text("", vec![]).unwrap_err(), SchemaError::EmptyText);
    }

    #[test]
    fn test_mark_exclusion() {
        let schema = schema();
        assert!(schema.mark_excludes("strong", "strong"));
        assert!(!schema.mark_excludes("comment", "comment"));
        assert!(!schema.mark_excludes("strong", "comment"));
    }

    #[test]
    fn test_empty_doc_has_one_paragraph() {
        let doc = schema().empty_doc().unwrap();
        assert_eq!(doc.child_count(), 1);
        assert_eq!(doc.child(0).unwrap().type_name(), "paragraph");
        assert_eq!(doc.content_size(), 2);
    }

    #[test]
    fn test_marks_sorted_by_rank() {
        let schema = schema();
        let comment = schema.mark("comment", Attrs::new()).unwrap();
        let strong = schema.mark("strong", Attrs::new()).unwrap();
        let text = schema.text("x", vec![comment, strong]).unwrap();
        assert_eq!(text.marks()[0].type_name(), "strong");
    }
}
