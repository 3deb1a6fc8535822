#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Repurpose Shared Types and Utilities
//!
//! This crate contains types, errors, and utilities shared across the Repurpose platform.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
