//! Domain primitives.

pub mod id;

pub use id::OwnerId;
