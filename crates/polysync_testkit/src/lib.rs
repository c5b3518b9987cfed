//! # PolySync Testkit
//!
//! Test utilities for PolySync.
//!
//! This crate provides:
//! - Scripted in-memory members implementing the proxy interface
//! - Group fixtures with in-memory or on-disk configuration
//! - Status event recorders
//! - Property-based generators using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use polysync_testkit::prelude::*;
//!
//! #[test]
//! fn propagates_an_addition() {
//!     let group = TestGroup::in_memory(2, &["contact"]);
//!     group.member(0).add("contact", "a1", "hello");
//!     let engine = group.initialized_engine();
//!     engine.synchronize_and_block().unwrap();
//!     assert_eq!(group.member(1).payloads("contact"), vec!["hello"]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod mock;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::mock::*;
}

pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use mock::*;
