//! Rich content model and the transform engine that reduces it for relaying.

pub mod element;
pub mod transform;

pub use element::{ContentElement, ElementKind, plain_text};
pub use transform::{TransformEngine, Visitor, VisitorTable};
