//! CLI command implementations.

pub mod records;
pub mod script;
pub mod tree;
pub mod verify;
pub mod vivify;
