//! Tool layer for Planweave.
//!
//! This crate provides the catalog adapter the executor dispatches
//! through: a process-wide registry of tools keyed by `ai_name`, plus a
//! handful of built-in demo tools.

pub mod builtin;
pub mod registry;

pub use builtin::{CalculatorTool, EchoTool, RemindTool};
pub use registry::{SkillRegistry, SkillTool};
