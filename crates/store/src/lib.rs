//! Run-scoped state for Planweave.
//!
//! This crate owns the three process-wide planes the runtime core leans
//! on: the append-only history store, the per-run event bus, and the run
//! registry with its cancellation flags, plus the optional plan memory.

pub mod bus;
pub mod history;
pub mod plan_memory;
pub mod registry;
pub mod sqlite;

pub use bus::RunEventBus;
pub use history::InMemoryHistoryStore;
pub use plan_memory::InMemoryPlanMemory;
pub use registry::ActiveRunRegistry;
pub use sqlite::SqliteHistoryStore;
