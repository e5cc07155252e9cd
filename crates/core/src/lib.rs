//! Core types, traits, and error definitions for Planweave.
//!
//! This crate provides the foundational building blocks shared across all
//! layers of the plan-and-execute runtime: the plan/step data model, the
//! run event union, the tool catalog and LLM client contracts, and the
//! configuration tree.

pub mod config;
pub mod error;
pub mod events;
pub mod mocks;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use events::*;
pub use traits::*;
pub use types::*;
