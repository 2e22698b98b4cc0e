//! The incremental change stream.
//!
//! DOM mutations, element resizes and layout-shift entries from the host's
//! observers feed one ordered [`DomChange`] stream. `class` and `style`
//! attribute mutations become structured deltas; added subtrees are fully
//! serialized, reusing ids the identity map already knows; each change
//! carries a coarse visual-impact tag computed from the target's bounding
//! area against the viewport.
//!
//! A consumer starting from the initial snapshot and applying the stream in
//! order reconstructs the tree a fresh snapshot would produce (see
//! [`super::apply`]).

use std::collections::BTreeMap;

use revi::common::now_millis;
use revi::config::{PrivacyConfig, ReplayConfig};
use serde::{Deserialize, Serialize};

use super::dom::{DomNode, NodeKey, Rect, StyleDeclaration, Viewport};
use super::snapshot::{DomSerializer, NodeId, SerializedNode};

/// Layout-shift score above which the next change is escalated one impact
/// level.
const SHIFT_BOOST_THRESHOLD: f64 = 0.1;
/// Area ratios for impact classification.
const MAJOR_AREA_RATIO: f64 = 0.25;
const MODERATE_AREA_RATIO: f64 = 0.05;

/// How strongly a change altered what the user sees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisualImpact {
    /// Small or invisible region.
    Minor,
    /// A noticeable region.
    Moderate,
    /// A dominant part of the viewport.
    Major,
}

/// A subtree inserted by a `childList` change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddedNode {
    /// Position among the target's children; `None` appends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// The serialized subtree.
    pub node: SerializedNode,
}

/// Old/new pair of one style property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StyleDelta {
    /// Previous value, `None` when newly set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    /// New value, `None` when removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
}

/// Type-specific payload of a [`DomChange`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChangePayload {
    /// Children added and/or removed.
    ChildList {
        /// Inserted subtrees.
        added: Vec<AddedNode>,
        /// Removed node ids.
        removed: Vec<NodeId>,
    },
    /// A plain attribute changed.
    Attributes {
        /// Attribute name.
        name: String,
        /// Previous value.
        #[serde(skip_serializing_if = "Option::is_none")]
        old: Option<String>,
        /// New value, `None` when removed.
        #[serde(skip_serializing_if = "Option::is_none")]
        new: Option<String>,
    },
    /// Text content changed.
    CharacterData {
        /// Previous content.
        old: String,
        /// New content.
        new: String,
    },
    /// Inline style properties changed.
    Style {
        /// Per-property deltas.
        changes: BTreeMap<String, StyleDelta>,
    },
    /// The class list changed.
    Class {
        /// Classes added.
        added: Vec<String>,
        /// Classes removed.
        removed: Vec<String>,
    },
}

/// One entry of the ordered change stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomChange {
    /// Capture time, ms since epoch.
    pub timestamp: u64,
    /// Target node id.
    pub target: NodeId,
    /// Type-specific payload.
    #[serde(flatten)]
    pub payload: ChangePayload,
    /// Coarse visual impact.
    pub impact: VisualImpact,
}

/// A subtree insertion as reported by the host observer.
#[derive(Clone, Debug)]
pub struct AddedSubtree {
    /// The inserted subtree.
    pub node: DomNode,
    /// Position among the target's children; `None` appends.
    pub index: Option<usize>,
}

/// One record from the host's observers.
#[derive(Clone, Debug)]
pub enum DomMutation {
    /// Children were added and/or removed.
    ChildList {
        /// Parent whose child list changed.
        target: NodeKey,
        /// Inserted subtrees.
        added: Vec<AddedSubtree>,
        /// Keys of removed children.
        removed: Vec<NodeKey>,
        /// Parent bounding rect, for impact classification.
        target_rect: Option<Rect>,
    },
    /// An attribute changed. `class` and `style` are reported as structured
    /// deltas.
    Attribute {
        /// Element whose attribute changed.
        target: NodeKey,
        /// Attribute name.
        name: String,
        /// Previous value.
        old: Option<String>,
        /// New value, `None` when removed.
        new: Option<String>,
        /// Element bounding rect, for impact classification.
        target_rect: Option<Rect>,
    },
    /// A text node's content changed.
    CharacterData {
        /// The text node.
        target: NodeKey,
        /// Previous content.
        old: String,
        /// New content.
        new: String,
    },
    /// An element was resized (resize-observer entry).
    Resize {
        /// The resized element.
        target: NodeKey,
        /// Previous rect.
        old: Rect,
        /// New rect.
        new: Rect,
    },
    /// A layout-shift entry (performance observer). Carries no target; it
    /// escalates the impact of the change that caused it.
    LayoutShift {
        /// Cumulative shift score of the entry.
        score: f64,
    },
}

impl DomSerializer {
    /// Convert one observer record into a serialized change.
    ///
    /// Returns `None` for records that produce no stream entry: layout
    /// shifts (absorbed into impact classification), no-op deltas, and
    /// mutations whose target the identity map has never seen.
    pub fn record_mutation(
        &mut self,
        mutation: DomMutation,
        viewport: &Viewport,
        privacy: &PrivacyConfig,
        replay: &ReplayConfig,
    ) -> Option<DomChange> {
        let timestamp = now_millis();
        match mutation {
            DomMutation::LayoutShift { score } => {
                self.pending_shift += score;
                None
            }
            DomMutation::ChildList {
                target,
                added,
                removed,
                target_rect,
            } => {
                let target = self.ids.existing(target)?;
                let mut resources = Vec::new();
                let added: Vec<AddedNode> = added
                    .into_iter()
                    .map(|subtree| AddedNode {
                        index: subtree.index,
                        node: self.serialize_node(
                            &subtree.node,
                            false,
                            privacy,
                            replay,
                            &mut resources,
                        ),
                    })
                    .collect();
                let removed: Vec<NodeId> = removed
                    .into_iter()
                    .filter_map(|key| self.ids.existing(key))
                    .collect();
                if added.is_empty() && removed.is_empty() {
                    return None;
                }
                Some(DomChange {
                    timestamp,
                    target,
                    payload: ChangePayload::ChildList { added, removed },
                    impact: self.classify(target_rect, viewport),
                })
            }
            DomMutation::Attribute {
                target,
                name,
                old,
                new,
                target_rect,
            } => {
                let target = self.ids.existing(target)?;
                let payload = match name.as_str() {
                    "class" => class_delta(old.as_deref(), new.as_deref())?,
                    "style" => style_delta(old.as_deref(), new.as_deref())?,
                    _ => {
                        if old == new {
                            return None;
                        }
                        ChangePayload::Attributes { name, old, new }
                    }
                };
                Some(DomChange {
                    timestamp,
                    target,
                    payload,
                    impact: self.classify(target_rect, viewport),
                })
            }
            DomMutation::CharacterData { target, old, new } => {
                let target = self.ids.existing(target)?;
                if old == new {
                    return None;
                }
                Some(DomChange {
                    timestamp,
                    target,
                    payload: ChangePayload::CharacterData { old, new },
                    impact: self.classify(None, viewport),
                })
            }
            DomMutation::Resize { target, old, new } => {
                let target = self.ids.existing(target)?;
                let mut changes = BTreeMap::new();
                if (old.width - new.width).abs() > f64::EPSILON {
                    changes.insert(
                        "width".to_string(),
                        StyleDelta {
                            old: Some(format!("{}px", old.width)),
                            new: Some(format!("{}px", new.width)),
                        },
                    );
                }
                if (old.height - new.height).abs() > f64::EPSILON {
                    changes.insert(
                        "height".to_string(),
                        StyleDelta {
                            old: Some(format!("{}px", old.height)),
                            new: Some(format!("{}px", new.height)),
                        },
                    );
                }
                if changes.is_empty() {
                    return None;
                }
                Some(DomChange {
                    timestamp,
                    target,
                    payload: ChangePayload::Style { changes },
                    impact: self.classify(Some(new), viewport),
                })
            }
        }
    }

    fn classify(&mut self, rect: Option<Rect>, viewport: &Viewport) -> VisualImpact {
        let viewport_area = f64::from(viewport.width) * f64::from(viewport.height);
        let ratio = match (rect, viewport_area > 0.0) {
            (Some(rect), true) => rect.area() / viewport_area,
            _ => 0.0,
        };
        let mut impact = if ratio >= MAJOR_AREA_RATIO {
            VisualImpact::Major
        } else if ratio >= MODERATE_AREA_RATIO {
            VisualImpact::Moderate
        } else {
            VisualImpact::Minor
        };

        if self.pending_shift > SHIFT_BOOST_THRESHOLD {
            impact = match impact {
                VisualImpact::Minor => VisualImpact::Moderate,
                _ => VisualImpact::Major,
            };
        }
        self.pending_shift = 0.0;
        impact
    }
}

fn class_delta(old: Option<&str>, new: Option<&str>) -> Option<ChangePayload> {
    let old_set: Vec<&str> = old.unwrap_or_default().split_whitespace().collect();
    let new_set: Vec<&str> = new.unwrap_or_default().split_whitespace().collect();
    let added: Vec<String> = new_set
        .iter()
        .filter(|class| !old_set.contains(class))
        .map(|class| class.to_string())
        .collect();
    let removed: Vec<String> = old_set
        .iter()
        .filter(|class| !new_set.contains(class))
        .map(|class| class.to_string())
        .collect();
    if added.is_empty() && removed.is_empty() {
        return None;
    }
    Some(ChangePayload::Class { added, removed })
}

fn style_delta(old: Option<&str>, new: Option<&str>) -> Option<ChangePayload> {
    let old_map = parse_inline_style(old.unwrap_or_default());
    let new_map = parse_inline_style(new.unwrap_or_default());

    let mut changes = BTreeMap::new();
    for (property, value) in &new_map {
        let previous = old_map.get(property);
        if previous != Some(value) {
            changes.insert(
                property.clone(),
                StyleDelta {
                    old: previous.cloned(),
                    new: Some(value.clone()),
                },
            );
        }
    }
    for (property, value) in &old_map {
        if !new_map.contains_key(property) {
            changes.insert(
                property.clone(),
                StyleDelta {
                    old: Some(value.clone()),
                    new: None,
                },
            );
        }
    }
    if changes.is_empty() {
        return None;
    }
    Some(ChangePayload::Style { changes })
}

/// Parse `prop: value; prop: value` inline style text.
pub(crate) fn parse_inline_style(text: &str) -> BTreeMap<String, String> {
    text.split(';')
        .filter_map(|declaration| {
            let (property, value) = declaration.split_once(':')?;
            let property = property.trim();
            let value = value.trim();
            (!property.is_empty() && !value.is_empty())
                .then(|| (property.to_string(), value.to_string()))
        })
        .collect()
}

/// Convert a style map back to declarations, preserving `!important` flags.
pub(crate) fn declaration_from(property: &str, value: &str) -> StyleDeclaration {
    match value.strip_suffix("!important") {
        Some(bare) => StyleDeclaration {
            property: property.to_string(),
            value: bare.trim_end().to_string(),
            important: true,
        },
        None => StyleDeclaration::new(property, value),
    }
}
