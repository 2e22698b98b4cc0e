//! The host-facing document model.
//!
//! The agent does not own a live DOM; the embedder maintains one of these
//! trees (or builds it on demand) and hands it to the serializer. Every node
//! carries a host-assigned [`NodeKey`] — a stable identity for the lifetime
//! of the underlying node — which the serializer maps to session-stable
//! integer ids. Keys of nodes that left the document are pruned explicitly
//! rather than relying on weak references.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Host-assigned identity of a live node. Stable for the node's lifetime,
/// never reused within a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(pub u64);

/// A bounding rectangle in CSS pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// Width.
    pub width: f64,
    /// Height.
    pub height: f64,
}

impl Rect {
    /// Area in square CSS pixels.
    pub fn area(&self) -> f64 {
        (self.width.max(0.0)) * (self.height.max(0.0))
    }
}

/// Viewport geometry at capture time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    /// Width in CSS pixels.
    pub width: u32,
    /// Height in CSS pixels.
    pub height: u32,
    /// Device pixel ratio.
    pub device_pixel_ratio: f64,
    /// Horizontal scroll offset.
    pub scroll_x: f64,
    /// Vertical scroll offset.
    pub scroll_y: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport {
            width: 1280,
            height: 720,
            device_pixel_ratio: 1.0,
            scroll_x: 0.0,
            scroll_y: 0.0,
        }
    }
}

/// Environment facts a reconstruction needs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    /// BCP-47 language tag.
    pub language: String,
    /// IANA timezone name.
    pub timezone: String,
    /// Preferred color scheme (`light`/`dark`).
    pub color_scheme: String,
    /// Whether reduced motion is requested.
    pub reduced_motion: bool,
}

/// One CSS declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleDeclaration {
    /// Property name.
    pub property: String,
    /// Property value.
    pub value: String,
    /// Whether `!important` was set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub important: bool,
}

impl StyleDeclaration {
    /// A declaration without `!important`.
    pub fn new(property: impl Into<String>, value: impl Into<String>) -> Self {
        StyleDeclaration {
            property: property.into(),
            value: value.into(),
            important: false,
        }
    }
}

/// One rule of a host stylesheet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CssRuleSource {
    /// Selector text.
    pub selector: String,
    /// Declarations in the rule body.
    pub declarations: Vec<StyleDeclaration>,
}

/// A stylesheet as the host sees it. Cross-origin sheets whose rules cannot
/// be read are marked inaccessible and degrade to omission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StyleSheetSource {
    /// Sheet URL, when external.
    pub href: Option<String>,
    /// Whether rule text could be read.
    pub accessible: bool,
    /// Rules, empty when inaccessible.
    pub rules: Vec<CssRuleSource>,
}

/// A node of the host document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomNode {
    /// An element with children.
    Element(ElementNode),
    /// A text node.
    Text(TextNode),
}

impl DomNode {
    /// The host key of this node.
    pub fn key(&self) -> NodeKey {
        match self {
            DomNode::Element(element) => element.key,
            DomNode::Text(text) => text.key,
        }
    }
}

/// A text node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    /// Host identity.
    pub key: NodeKey,
    /// Text content.
    pub content: String,
}

/// An element and everything the serializer reads off it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementNode {
    /// Host identity.
    pub key: NodeKey,
    /// Tag name, any case; serialized lowercased.
    pub tag: String,
    /// Attribute map as the host reports it.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Computed style as the host reports it; filtered to the allow-list at
    /// serialization.
    #[serde(default)]
    pub computed_style: BTreeMap<String, String>,
    /// Inline style declarations.
    #[serde(default)]
    pub inline_style: Vec<StyleDeclaration>,
    /// Bounding rectangle.
    #[serde(default)]
    pub rect: Rect,
    /// Effective opacity.
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    /// Computed `display`.
    #[serde(default)]
    pub display: String,
    /// Computed `z-index`, when not `auto`.
    #[serde(default)]
    pub z_index: Option<i32>,
    /// Whether the element has focus.
    #[serde(default)]
    pub focused: bool,
    /// Whether the pointer is over the element.
    #[serde(default)]
    pub hovered: bool,
    /// Whether the element is being pressed.
    #[serde(default)]
    pub pressed: bool,
    /// Whether a form control is disabled.
    #[serde(default)]
    pub disabled: bool,
    /// Whether a checkbox/radio/option is checked or selected.
    #[serde(default)]
    pub checked: bool,
    /// Current form value, when the element has one.
    #[serde(default)]
    pub value: Option<String>,
    /// Scroll offsets, when the element overflows.
    #[serde(default)]
    pub scroll: Option<(f64, f64)>,
    /// Child nodes in document order.
    #[serde(default)]
    pub children: Vec<DomNode>,
}

fn default_opacity() -> f64 {
    1.0
}

impl ElementNode {
    /// A visible block element with the given tag and key.
    pub fn new(tag: impl Into<String>, key: NodeKey) -> Self {
        ElementNode {
            key,
            tag: tag.into(),
            attributes: BTreeMap::new(),
            computed_style: BTreeMap::new(),
            inline_style: Vec::new(),
            rect: Rect::default(),
            opacity: 1.0,
            display: "block".to_string(),
            z_index: None,
            focused: false,
            hovered: false,
            pressed: false,
            disabled: false,
            checked: false,
            value: None,
            scroll: None,
            children: Vec::new(),
        }
    }

    /// Set an attribute.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set a computed-style property.
    pub fn with_style(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.computed_style.insert(property.into(), value.into());
        self
    }

    /// Set the bounding rectangle.
    pub fn with_rect(mut self, rect: Rect) -> Self {
        self.rect = rect;
        self
    }

    /// Set the form value.
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Append an element child.
    pub fn with_child(mut self, child: ElementNode) -> Self {
        self.children.push(DomNode::Element(child));
        self
    }

    /// Append a text child.
    pub fn with_text(mut self, key: NodeKey, content: impl Into<String>) -> Self {
        self.children.push(DomNode::Text(TextNode {
            key,
            content: content.into(),
        }));
        self
    }
}

/// A complete host document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomDocument {
    /// Page URL.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Viewport geometry.
    pub viewport: Viewport,
    /// Environment facts.
    pub environment: EnvironmentInfo,
    /// Stylesheets in document order.
    pub stylesheets: Vec<StyleSheetSource>,
    /// The root element (usually `html`).
    pub root: DomNode,
}
