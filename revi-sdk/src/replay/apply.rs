//! Applying a change stream to a snapshot.
//!
//! This is the consumer side of the replay contract: starting from an
//! initial snapshot and applying the ordered change stream yields a tree
//! node-equivalent to a snapshot taken at the stream's final timestamp, up
//! to ordering-insensitive attribute maps and omitted cross-origin
//! resources. The reconstruction here exists so the contract is testable in
//! this crate and usable by replay tooling.

use super::mutation::{declaration_from, ChangePayload, DomChange};
use super::snapshot::{NodeId, SerializedElement, SerializedNode};

/// Apply an ordered change stream to a snapshot tree.
///
/// Changes whose target no longer exists are skipped; a mutation feed may
/// legitimately reference nodes removed by an earlier change in the same
/// stream.
pub fn apply_changes(root: &mut SerializedNode, changes: &[DomChange]) {
    for change in changes {
        apply_change(root, change);
    }
}

fn apply_change(root: &mut SerializedNode, change: &DomChange) {
    let Some(target) = find_node_mut(root, change.target) else {
        return;
    };

    match (&change.payload, target) {
        (ChangePayload::ChildList { added, removed }, SerializedNode::Element(element)) => {
            element
                .children
                .retain(|child| !removed.contains(&child.id()));
            for addition in added {
                let index = addition
                    .index
                    .unwrap_or(element.children.len())
                    .min(element.children.len());
                element.children.insert(index, addition.node.clone());
            }
        }
        (ChangePayload::Attributes { name, new, .. }, SerializedNode::Element(element)) => {
            match new {
                Some(value) => {
                    element.attributes.insert(name.clone(), value.clone());
                }
                None => {
                    element.attributes.remove(name);
                }
            }
        }
        (ChangePayload::CharacterData { new, .. }, SerializedNode::Text(text)) => {
            text.content = new.clone();
        }
        (ChangePayload::Style { changes }, SerializedNode::Element(element)) => {
            for (property, delta) in changes {
                element.inline_style.retain(|decl| decl.property != *property);
                if let Some(value) = &delta.new {
                    element.inline_style.push(declaration_from(property, value));
                }
            }
        }
        (ChangePayload::Class { added, removed }, SerializedNode::Element(element)) => {
            let current = element.attributes.get("class").cloned().unwrap_or_default();
            let mut classes: Vec<String> = current
                .split_whitespace()
                .filter(|class| !removed.iter().any(|r| r == class))
                .map(|class| class.to_string())
                .collect();
            for class in added {
                if !classes.iter().any(|c| c == class) {
                    classes.push(class.clone());
                }
            }
            if classes.is_empty() {
                element.attributes.remove("class");
            } else {
                element.attributes.insert("class".to_string(), classes.join(" "));
            }
        }
        // Payload/node type mismatch: the feed is inconsistent, skip.
        _ => {}
    }
}

/// Find a node by id anywhere in the tree.
pub fn find_node_mut(root: &mut SerializedNode, id: NodeId) -> Option<&mut SerializedNode> {
    if root.id() == id {
        return Some(root);
    }
    match root {
        SerializedNode::Text(_) => None,
        SerializedNode::Element(element) => element
            .children
            .iter_mut()
            .find_map(|child| find_node_mut(child, id)),
    }
}

/// Structural equivalence of two trees: same ids, tags, attributes, content
/// and child order; inline style compared as property→(value, important)
/// sets.
pub fn node_equivalent(a: &SerializedNode, b: &SerializedNode) -> bool {
    match (a, b) {
        (SerializedNode::Text(a), SerializedNode::Text(b)) => {
            a.id == b.id && a.content == b.content
        }
        (SerializedNode::Element(a), SerializedNode::Element(b)) => {
            element_equivalent(a, b)
                && a.children.len() == b.children.len()
                && a.children
                    .iter()
                    .zip(b.children.iter())
                    .all(|(a, b)| node_equivalent(a, b))
        }
        _ => false,
    }
}

fn element_equivalent(a: &SerializedElement, b: &SerializedElement) -> bool {
    let styles = |element: &SerializedElement| {
        let mut declarations: Vec<(String, String, bool)> = element
            .inline_style
            .iter()
            .map(|decl| (decl.property.clone(), decl.value.clone(), decl.important))
            .collect();
        declarations.sort();
        declarations
    };
    a.id == b.id && a.tag == b.tag && a.attributes == b.attributes && styles(a) == styles(b)
}
