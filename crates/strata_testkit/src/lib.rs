//! # Strata Testkit
//!
//! Test utilities for Strata.
//!
//! This crate provides:
//! - Test fixtures and tree helpers
//! - Property-based test generators using proptest
//! - A model harness that checks a tree against a `BTreeMap`
//! - Crash simulation for page files
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust
//! use strata_testkit::prelude::*;
//!
//! let mut harness = ModelHarness::new(small_options());
//! harness.insert(b"a");
//! harness.balance();
//! harness.verify_all();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
