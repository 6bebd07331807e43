//! Population tree: flat association paths with modifiers into a nested traversal tree.
//!
//! Modifiers on a path apply to its last segment:
//! - trailing `*`: required (parents without a match are filtered out)
//! - leading `+`: include soft-deleted children
//! - leading `-`: fetch in a separate query instead of a join
//! - leading `+-`: both of the above

use serde::Serialize;
use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PopulateNode {
    pub path: String,
    /// Projected fields; None means all.
    pub attributes: Option<Vec<String>>,
    pub required: bool,
    pub include_deleted: bool,
    pub fetch_separately: bool,
    pub children: Vec<PopulateNode>,
}

impl PopulateNode {
    fn new(path: &str) -> Self {
        PopulateNode {
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn child(&self, path: &str) -> Option<&PopulateNode> {
        self.children.iter().find(|c| c.path == path)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Modifiers {
    required: bool,
    include_deleted: bool,
    fetch_separately: bool,
}

/// Strip modifier characters. Returns the bare dotted path.
fn parse_modifiers(raw: &str) -> (&str, Modifiers) {
    let mut m = Modifiers::default();
    let mut s = raw.trim();
    if let Some(rest) = s.strip_suffix('*') {
        m.required = true;
        s = rest;
    }
    if let Some(rest) = s.strip_prefix("+-") {
        m.include_deleted = true;
        m.fetch_separately = true;
        s = rest;
    } else if let Some(rest) = s.strip_prefix('+') {
        m.include_deleted = true;
        s = rest;
    } else if let Some(rest) = s.strip_prefix('-') {
        m.fetch_separately = true;
        s = rest;
    }
    (s, m)
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Build the tree. `attributes_by_path` is keyed by bare dotted path ("author.profile").
///
/// Any malformed path (empty segment, stray characters) yields an empty tree.
pub fn build_populate_tree(
    paths: &[String],
    attributes_by_path: &HashMap<String, Vec<String>>,
) -> Vec<PopulateNode> {
    let mut roots: Vec<PopulateNode> = Vec::new();
    for raw in paths {
        let (bare, modifiers) = parse_modifiers(raw);
        let segments: Vec<&str> = bare.split('.').collect();
        if !segments.iter().all(|s| valid_segment(s)) {
            tracing::warn!(path = %raw, "malformed populate path, ignoring populate");
            return Vec::new();
        }
        let mut level = &mut roots;
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            let idx = match level.iter().position(|n| n.path == *segment) {
                Some(idx) => idx,
                None => {
                    level.push(PopulateNode::new(segment));
                    level.len() - 1
                }
            };
            let node = &mut level[idx];
            if i == last {
                node.required |= modifiers.required;
                node.include_deleted |= modifiers.include_deleted;
                node.fetch_separately |= modifiers.fetch_separately;
                if let Some(attrs) = attributes_by_path.get(bare) {
                    node.attributes = Some(attrs.clone());
                }
            }
            level = &mut node.children;
        }
    }
    roots
}
