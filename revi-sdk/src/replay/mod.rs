//! Replay serialization: full snapshots plus an incremental change stream.
//!
//! The host feeds a [`dom::DomDocument`] and observer records; the
//! [`snapshot::DomSerializer`] turns them into a [`snapshot::DomSnapshot`]
//! and ordered [`mutation::DomChange`]s suitable for later visual
//! reconstruction. [`apply`] holds the consumer-side reconstruction that the
//! snapshot+diff contract is tested against.

pub mod apply;
pub mod dom;
pub mod mutation;
pub mod snapshot;

pub use apply::{apply_changes, node_equivalent};
pub use dom::{DomDocument, DomNode, ElementNode, NodeKey, Rect, TextNode, Viewport};
pub use mutation::{AddedSubtree, ChangePayload, DomChange, DomMutation, VisualImpact};
pub use snapshot::{DomSerializer, DomSnapshot, NodeId, SerializedNode};
