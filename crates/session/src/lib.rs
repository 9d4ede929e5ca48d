//! Session persistence for Carelink.
//!
//! [`SessionStore`] is the contract every orchestrator instance shares;
//! [`MemoryStore`] is the bundled process-local implementation. External
//! stores (Redis and friends) implement the same trait behind the same
//! optimistic-concurrency semantics.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::{SessionStore, StoreError, StoreResult};
