//! Full-document serialization.
//!
//! A snapshot is a depth-first walk of the host document: every visited node
//! gets (or reuses) a session-stable integer id from the serializer's
//! identity map, element attributes are scrubbed of event handlers,
//! sensitive values are masked before anything is buffered, computed style
//! is reduced to a curated allow-list, and stylesheets the host could not
//! read degrade to omission. Node ids are unique, start at 1, and every
//! parent appears before its children in serialization order.

use std::collections::{BTreeMap, HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use revi::common::now_millis;
use revi::config::{PrivacyConfig, ReplayConfig};
use serde::{Deserialize, Serialize};

use super::dom::{
    CssRuleSource, DomDocument, DomNode, ElementNode, EnvironmentInfo, NodeKey, Rect,
    StyleDeclaration, StyleSheetSource, Viewport,
};

/// Replacement for masked form values.
pub const MASKED_VALUE: &str = "[Masked]";
/// Replacement for text under sensitive ancestors.
pub const MASKED_TEXT: &str = "[Masked Text]";
/// Attribute marking a subtree as sensitive.
const SENSITIVE_ATTR: &str = "data-sensitive";

/// The computed-style properties a snapshot keeps: layout, flex/grid,
/// typography, background, effects and animation. Everything else is noise
/// for reconstruction and is dropped.
pub const COMPUTED_STYLE_ALLOWLIST: &[&str] = &[
    // layout
    "display", "position", "top", "right", "bottom", "left", "width", "height",
    "min-width", "min-height", "max-width", "max-height", "margin", "padding",
    "box-sizing", "overflow", "float", "clear",
    // flex and grid
    "flex-direction", "flex-wrap", "flex-grow", "flex-shrink", "flex-basis",
    "justify-content", "align-items", "align-content", "align-self", "gap",
    "grid-template-columns", "grid-template-rows", "grid-auto-flow", "grid-area",
    // typography
    "font-family", "font-size", "font-weight", "font-style", "line-height",
    "letter-spacing", "text-align", "text-decoration", "text-transform",
    "white-space", "color", "word-break",
    // background
    "background-color", "background-image", "background-size",
    "background-position", "background-repeat",
    // effects
    "opacity", "visibility", "z-index", "border", "border-radius", "box-shadow",
    "outline", "transform", "filter", "cursor", "pointer-events",
    // animation
    "transition", "animation-name", "animation-duration", "animation-timing-function",
];

static CREDIT_CARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\d\s\-]{13,19}$").expect("static regex"));

/// A session-stable integer node id, ≥ 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The identity map from host node keys to session-stable ids.
///
/// Ids are assigned on first visit and reused while the host node lives.
/// Detached subtrees do not pin memory: [`NodeIdMap::prune`] drops ids whose
/// owners are no longer reachable by tree walk.
#[derive(Debug, Default)]
pub struct NodeIdMap {
    map: HashMap<u64, NodeId>,
    next: u32,
}

impl NodeIdMap {
    /// An empty map; the first assigned id is 1.
    pub fn new() -> Self {
        NodeIdMap {
            map: HashMap::new(),
            next: 1,
        }
    }

    /// The id for `key`, assigning the next id on first sight.
    pub fn id_for(&mut self, key: NodeKey) -> NodeId {
        if let Some(id) = self.map.get(&key.0) {
            return *id;
        }
        let id = NodeId(self.next);
        self.next += 1;
        self.map.insert(key.0, id);
        id
    }

    /// The id for `key` if it has one.
    pub fn existing(&self, key: NodeKey) -> Option<NodeId> {
        self.map.get(&key.0).copied()
    }

    /// Drop ids whose keys are not in `live`. Assigned ids are never reused.
    pub fn prune(&mut self, live: &HashSet<u64>) {
        self.map.retain(|key, _| live.contains(key));
    }

    /// Number of tracked nodes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no nodes are tracked.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Visibility triple of a serialized element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityInfo {
    /// Whether the element renders at all.
    pub visible: bool,
    /// Effective opacity.
    pub opacity: f64,
    /// Computed `display`.
    pub display: String,
    /// Computed `z-index`, when not `auto`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i32>,
}

/// Interaction state of a serialized element.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionInfo {
    /// Has focus.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub focused: bool,
    /// Pointer is over it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hovered: bool,
    /// Being pressed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pressed: bool,
    /// Disabled form control.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    /// Checked or selected.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub checked: bool,
}

/// A serialized node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SerializedNode {
    /// An element subtree.
    Element(SerializedElement),
    /// A text node.
    Text(SerializedText),
}

impl SerializedNode {
    /// The session-stable id of this node.
    pub fn id(&self) -> NodeId {
        match self {
            SerializedNode::Element(element) => element.id,
            SerializedNode::Text(text) => text.id,
        }
    }
}

/// A serialized text node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedText {
    /// Session-stable id.
    pub id: NodeId,
    /// Content, masked under sensitive ancestors.
    pub content: String,
}

/// A serialized element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedElement {
    /// Session-stable id.
    pub id: NodeId,
    /// Lowercased tag name.
    pub tag: String,
    /// Attributes with `on*` handlers dropped and `style` represented by
    /// `inline_style` instead.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Allow-listed computed style.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub computed_style: BTreeMap<String, String>,
    /// Inline declarations, `!important` preserved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inline_style: Vec<StyleDeclaration>,
    /// Bounding rectangle.
    pub rect: Rect,
    /// Visibility triple.
    pub visibility: VisibilityInfo,
    /// Interaction state.
    #[serde(default)]
    pub interaction: InteractionInfo,
    /// Form value, masked when sensitive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Scroll offsets when the element overflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll: Option<(f64, f64)>,
    /// Children in document order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SerializedNode>,
}

/// A serialized stylesheet with per-rule specificity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StyleSheet {
    /// Sheet URL, when external.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    /// Processed rules.
    pub rules: Vec<CssRule>,
}

/// A serialized CSS rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CssRule {
    /// Selector text.
    pub selector: String,
    /// Specificity as `ids*100 + (classes+attrs+pseudo-classes)*10 + types`.
    pub specificity: u32,
    /// Declarations.
    pub declarations: Vec<StyleDeclaration>,
}

/// A resource the page references.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource kind: `image`, `script`, `stylesheet`, `media`.
    pub kind: String,
    /// Resource URL.
    pub url: String,
}

/// A full snapshot of the page.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomSnapshot {
    /// Capture time, ms since epoch.
    pub timestamp: u64,
    /// Page URL.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Viewport geometry.
    pub viewport: Viewport,
    /// Environment facts.
    pub environment: EnvironmentInfo,
    /// Readable stylesheets; cross-origin sheets are omitted.
    pub stylesheets: Vec<StyleSheet>,
    /// Referenced resources.
    pub resources: Vec<ResourceDescriptor>,
    /// The serialized tree.
    pub root: SerializedNode,
}

/// Serializes host documents and mutations against one identity map.
///
/// Owned by the monitor; snapshotting and mutation recording run on the
/// host's main thread.
#[derive(Debug, Default)]
pub struct DomSerializer {
    pub(crate) ids: NodeIdMap,
    pub(crate) pending_shift: f64,
}

impl DomSerializer {
    /// A serializer with an empty identity map.
    pub fn new() -> Self {
        DomSerializer {
            ids: NodeIdMap::new(),
            pending_shift: 0.0,
        }
    }

    /// Take a full snapshot, assigning or reusing node ids.
    pub fn snapshot(
        &mut self,
        document: &DomDocument,
        privacy: &PrivacyConfig,
        replay: &ReplayConfig,
    ) -> DomSnapshot {
        let mut resources = Vec::new();
        let root = self.serialize_node(&document.root, false, privacy, replay, &mut resources);

        DomSnapshot {
            timestamp: now_millis(),
            url: document.url.clone(),
            title: document.title.clone(),
            viewport: document.viewport,
            environment: document.environment.clone(),
            stylesheets: document
                .stylesheets
                .iter()
                .filter(|sheet| sheet.accessible)
                .map(serialize_stylesheet)
                .collect(),
            resources,
            root,
        }
    }

    /// Drop identity-map entries for nodes no longer in `document`.
    pub fn prune_to(&mut self, document: &DomDocument) {
        let mut live = HashSet::new();
        collect_keys(&document.root, &mut live);
        self.ids.prune(&live);
    }

    /// Nodes currently tracked in the identity map.
    pub fn tracked_nodes(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn serialize_node(
        &mut self,
        node: &DomNode,
        sensitive_ancestor: bool,
        privacy: &PrivacyConfig,
        replay: &ReplayConfig,
        resources: &mut Vec<ResourceDescriptor>,
    ) -> SerializedNode {
        match node {
            DomNode::Text(text) => {
                let id = self.ids.id_for(text.key);
                let content = if sensitive_ancestor || replay.mask_all_text {
                    MASKED_TEXT.to_string()
                } else {
                    text.content.clone()
                };
                SerializedNode::Text(SerializedText { id, content })
            }
            DomNode::Element(element) => {
                let id = self.ids.id_for(element.key);
                let sensitive = sensitive_ancestor || is_sensitive(element, privacy, replay);
                collect_resource(element, resources);

                let attributes: BTreeMap<String, String> = element
                    .attributes
                    .iter()
                    .filter(|(name, _)| !name.starts_with("on") && *name != "style")
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();

                let computed_style: BTreeMap<String, String> = element
                    .computed_style
                    .iter()
                    .filter(|(property, _)| COMPUTED_STYLE_ALLOWLIST.contains(&property.as_str()))
                    .map(|(property, value)| (property.clone(), value.clone()))
                    .collect();

                let value = element.value.as_ref().map(|value| {
                    if sensitive {
                        MASKED_VALUE.to_string()
                    } else {
                        value.clone()
                    }
                });

                let children = element
                    .children
                    .iter()
                    .map(|child| {
                        self.serialize_node(child, sensitive, privacy, replay, resources)
                    })
                    .collect();

                SerializedNode::Element(SerializedElement {
                    id,
                    tag: element.tag.to_lowercase(),
                    attributes,
                    computed_style,
                    inline_style: element.inline_style.clone(),
                    rect: element.rect,
                    visibility: VisibilityInfo {
                        visible: element.opacity > 0.0 && element.display != "none",
                        opacity: element.opacity,
                        display: element.display.clone(),
                        z_index: element.z_index,
                    },
                    interaction: InteractionInfo {
                        focused: element.focused,
                        hovered: element.hovered,
                        pressed: element.pressed,
                        disabled: element.disabled,
                        checked: element.checked,
                    },
                    value,
                    scroll: element.scroll,
                    children,
                })
            }
        }
    }
}

fn collect_keys(node: &DomNode, live: &mut HashSet<u64>) {
    live.insert(node.key().0);
    if let DomNode::Element(element) = node {
        for child in &element.children {
            collect_keys(child, live);
        }
    }
}

fn is_sensitive(element: &ElementNode, privacy: &PrivacyConfig, replay: &ReplayConfig) -> bool {
    if element.attributes.contains_key(SENSITIVE_ATTR) {
        return true;
    }
    let input_type = element.attributes.get("type").map(String::as_str);
    if privacy.mask_passwords && input_type == Some("password") {
        return true;
    }
    let is_input = matches!(element.tag.to_lowercase().as_str(), "input" | "textarea" | "select");
    if is_input && (replay.mask_all_inputs || privacy.mask_inputs) {
        return true;
    }
    if privacy.mask_credit_cards {
        if let Some(value) = &element.value {
            let digits = value.chars().filter(char::is_ascii_digit).count();
            if digits >= 13 && CREDIT_CARD_RE.is_match(value.trim()) {
                return true;
            }
        }
    }
    false
}

fn collect_resource(element: &ElementNode, resources: &mut Vec<ResourceDescriptor>) {
    let tag = element.tag.to_lowercase();
    let (kind, attr) = match tag.as_str() {
        "img" => ("image", "src"),
        "script" => ("script", "src"),
        "link" => ("stylesheet", "href"),
        "video" | "audio" | "source" => ("media", "src"),
        _ => return,
    };
    if tag == "link"
        && element.attributes.get("rel").map(String::as_str) != Some("stylesheet")
    {
        return;
    }
    if let Some(url) = element.attributes.get(attr) {
        resources.push(ResourceDescriptor {
            kind: kind.to_string(),
            url: url.clone(),
        });
    }
}

fn serialize_stylesheet(sheet: &StyleSheetSource) -> StyleSheet {
    StyleSheet {
        href: sheet.href.clone(),
        rules: sheet
            .rules
            .iter()
            .map(|rule| CssRule {
                selector: rule.selector.clone(),
                specificity: specificity(&rule.selector),
                declarations: rule.declarations.clone(),
            })
            .collect(),
    }
}

static PSEUDO_ELEMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"::[\w\-]+").expect("static regex"));
static ID_SEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"#[\w\-]+").expect("static regex"));
static ATTR_SEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[^\]]*\]").expect("static regex"));
static CLASS_SEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.[\w\-]+").expect("static regex"));
static PSEUDO_CLASS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":[\w\-]+").expect("static regex"));
static TYPE_SEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[\s>+~(,])[a-zA-Z][\w\-]*").expect("static regex"));

/// CSS specificity as `ids*100 + (classes+attributes+pseudo-classes)*10 +
/// (types+pseudo-elements)`. Each component is stripped before counting the
/// next so compound selectors count every part once.
pub fn specificity(selector: &str) -> u32 {
    let pseudo_elements = PSEUDO_ELEMENT_RE.find_iter(selector).count() as u32;
    let stripped = PSEUDO_ELEMENT_RE.replace_all(selector, " ");
    let ids = ID_SEL_RE.find_iter(&stripped).count() as u32;
    let stripped = ID_SEL_RE.replace_all(&stripped, " ");
    let attrs = ATTR_SEL_RE.find_iter(&stripped).count() as u32;
    let stripped = ATTR_SEL_RE.replace_all(&stripped, " ");
    let classes = CLASS_SEL_RE.find_iter(&stripped).count() as u32;
    let stripped = CLASS_SEL_RE.replace_all(&stripped, " ");
    let pseudo_classes = PSEUDO_CLASS_RE.find_iter(&stripped).count() as u32;
    let stripped = PSEUDO_CLASS_RE.replace_all(&stripped, " ");
    let types = TYPE_SEL_RE.find_iter(&stripped).count() as u32;
    ids * 100 + (attrs + classes + pseudo_classes) * 10 + types + pseudo_elements
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(root: ElementNode) -> DomDocument {
        DomDocument {
            url: "https://app.test/checkout".to_string(),
            title: "Checkout".to_string(),
            viewport: Viewport::default(),
            environment: EnvironmentInfo::default(),
            stylesheets: Vec::new(),
            root: DomNode::Element(root),
        }
    }

    fn defaults() -> (PrivacyConfig, ReplayConfig) {
        (PrivacyConfig::default(), ReplayConfig::default())
    }

    #[test]
    fn ids_are_stable_across_snapshots() {
        let (privacy, replay) = defaults();
        let mut serializer = DomSerializer::new();
        let doc = document(
            ElementNode::new("div", NodeKey(1)).with_child(ElementNode::new("span", NodeKey(2))),
        );

        let first = serializer.snapshot(&doc, &privacy, &replay);
        let second = serializer.snapshot(&doc, &privacy, &replay);
        assert_eq!(first.root.id(), second.root.id());
        assert_eq!(first.root.id(), NodeId(1));

        // A new node gets a fresh id, existing ids are reused.
        let doc = document(
            ElementNode::new("div", NodeKey(1))
                .with_child(ElementNode::new("span", NodeKey(2)))
                .with_child(ElementNode::new("em", NodeKey(3))),
        );
        let third = serializer.snapshot(&doc, &privacy, &replay);
        let SerializedNode::Element(root) = &third.root else {
            panic!("root must be an element")
        };
        assert_eq!(root.children[0].id(), NodeId(2));
        assert_eq!(root.children[1].id(), NodeId(3));
    }

    #[test]
    fn event_handler_attributes_are_dropped() {
        let (privacy, replay) = defaults();
        let mut serializer = DomSerializer::new();
        let doc = document(
            ElementNode::new("button", NodeKey(1))
                .with_attr("onclick", "steal()")
                .with_attr("id", "buy"),
        );

        let snapshot = serializer.snapshot(&doc, &privacy, &replay);
        let SerializedNode::Element(root) = &snapshot.root else {
            panic!("root must be an element")
        };
        assert!(!root.attributes.contains_key("onclick"));
        assert_eq!(root.attributes.get("id").map(String::as_str), Some("buy"));
    }

    #[test]
    fn password_inputs_and_sensitive_subtrees_are_masked() {
        let (privacy, replay) = defaults();
        let mut serializer = DomSerializer::new();
        let doc = document(
            ElementNode::new("form", NodeKey(1))
                .with_attr("data-sensitive", "true")
                .with_child(
                    ElementNode::new("input", NodeKey(2))
                        .with_attr("type", "password")
                        .with_value("hunter2"),
                )
                .with_text(NodeKey(3), "Account number 12345"),
        );

        let snapshot = serializer.snapshot(&doc, &privacy, &replay);
        let SerializedNode::Element(root) = &snapshot.root else {
            panic!("root must be an element")
        };
        let SerializedNode::Element(input) = &root.children[0] else {
            panic!("expected input")
        };
        assert_eq!(input.value.as_deref(), Some(MASKED_VALUE));
        let SerializedNode::Text(text) = &root.children[1] else {
            panic!("expected text")
        };
        assert_eq!(text.content, MASKED_TEXT);
    }

    #[test]
    fn credit_card_values_are_masked() {
        let (privacy, replay) = defaults();
        let mut serializer = DomSerializer::new();
        let doc = document(
            ElementNode::new("div", NodeKey(1))
                .with_value("4111 1111 1111 1111"),
        );

        let snapshot = serializer.snapshot(&doc, &privacy, &replay);
        let SerializedNode::Element(root) = &snapshot.root else {
            panic!("root must be an element")
        };
        assert_eq!(root.value.as_deref(), Some(MASKED_VALUE));
    }

    #[test]
    fn computed_style_is_allowlisted() {
        let (privacy, replay) = defaults();
        let mut serializer = DomSerializer::new();
        let doc = document(
            ElementNode::new("div", NodeKey(1))
                .with_style("display", "flex")
                .with_style("-webkit-tap-highlight-color", "transparent"),
        );

        let snapshot = serializer.snapshot(&doc, &privacy, &replay);
        let SerializedNode::Element(root) = &snapshot.root else {
            panic!("root must be an element")
        };
        assert_eq!(root.computed_style.get("display").map(String::as_str), Some("flex"));
        assert!(!root.computed_style.contains_key("-webkit-tap-highlight-color"));
    }

    #[test]
    fn inaccessible_stylesheets_are_omitted() {
        let (privacy, replay) = defaults();
        let mut serializer = DomSerializer::new();
        let mut doc = document(ElementNode::new("div", NodeKey(1)));
        doc.stylesheets = vec![
            StyleSheetSource {
                href: Some("https://cdn.test/app.css".to_string()),
                accessible: true,
                rules: vec![CssRuleSource {
                    selector: "#main .item".to_string(),
                    declarations: vec![StyleDeclaration::new("color", "red")],
                }],
            },
            StyleSheetSource {
                href: Some("https://other-origin.test/x.css".to_string()),
                accessible: false,
                rules: Vec::new(),
            },
        ];

        let snapshot = serializer.snapshot(&doc, &privacy, &replay);
        assert_eq!(snapshot.stylesheets.len(), 1);
        assert_eq!(snapshot.stylesheets[0].rules[0].specificity, 110);
    }

    #[test]
    fn pruning_releases_detached_ids() {
        let (privacy, replay) = defaults();
        let mut serializer = DomSerializer::new();
        let doc = document(
            ElementNode::new("div", NodeKey(1)).with_child(ElementNode::new("span", NodeKey(2))),
        );
        serializer.snapshot(&doc, &privacy, &replay);
        assert_eq!(serializer.tracked_nodes(), 2);

        let doc = document(ElementNode::new("div", NodeKey(1)));
        serializer.prune_to(&doc);
        assert_eq!(serializer.tracked_nodes(), 1);

        // A pruned node returning is a new identity.
        let doc = document(
            ElementNode::new("div", NodeKey(1)).with_child(ElementNode::new("span", NodeKey(2))),
        );
        let snapshot = serializer.snapshot(&doc, &privacy, &replay);
        let SerializedNode::Element(root) = &snapshot.root else {
            panic!("root must be an element")
        };
        assert_eq!(root.children[0].id(), NodeId(3));
    }

    #[test]
    fn specificity_table() {
        let cases = [
            ("div", 1),
            (".item", 10),
            ("#main", 100),
            ("#main .item", 110),
            ("ul li a.active", 13),
            ("input[type=text]:focus", 21),
            ("p::first-line", 2),
        ];
        for (selector, expected) in cases {
            assert_eq!(specificity(selector), expected, "selector {:?}", selector);
        }
    }

    #[test]
    fn resources_are_collected() {
        let (privacy, replay) = defaults();
        let mut serializer = DomSerializer::new();
        let doc = document(
            ElementNode::new("div", NodeKey(1))
                .with_child(ElementNode::new("img", NodeKey(2)).with_attr("src", "/hero.png"))
                .with_child(
                    ElementNode::new("link", NodeKey(3))
                        .with_attr("rel", "stylesheet")
                        .with_attr("href", "/app.css"),
                )
                .with_child(ElementNode::new("link", NodeKey(4)).with_attr("href", "/icon.ico")),
        );

        let snapshot = serializer.snapshot(&doc, &privacy, &replay);
        assert_eq!(snapshot.resources.len(), 2);
        assert_eq!(snapshot.resources[0].kind, "image");
        assert_eq!(snapshot.resources[1].url, "/app.css");
    }
}
