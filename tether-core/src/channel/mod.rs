//! Channel declarations: the allow-list and the payload shapes it enforces.

pub mod registry;
pub mod shape;

pub use registry::{ChannelRegistry, ChannelSpec, Direction};
pub use shape::Shape;
