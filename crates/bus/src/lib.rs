//! Bus transport for Carelink.
//!
//! [`BusClient`] abstracts the broker; [`MemoryBus`] is the bundled
//! in-process implementation used by tests and single-node deployments.
//! A Kafka-backed client implements the same trait against the same
//! envelope contract.

pub mod client;
pub mod memory;

pub use client::{BusClient, BusError, BusHandler, Record};
pub use memory::MemoryBus;
