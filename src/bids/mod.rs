//! BIDS input acquisition: run-level classification, download, validation,
//! and the tree listing side artifact.

pub mod download;
pub mod hierarchy;
pub mod tree;
pub mod validate;
