//! HTTP surface for Planweave.
//!
//! A thin axum app in front of the runtime: create runs, stream their
//! events over SSE, cancel them, and inspect history. The transport adds
//! no semantics of its own.

pub mod server;

pub use server::{build_router, serve, AppState, GatewayConfig};
