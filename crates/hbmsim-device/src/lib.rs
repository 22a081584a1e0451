//! # hbmsim-device
//!
//! Deferred-execution simulator for a device with a large slow HBM tier and
//! a small fast SRAM tier.
//!
//! Provides:
//! - `GpuSimulator`: queues placement-aware primitives and runs them as a batch
//! - `Op`: the command recorded for each primitive
//! - `SimConfig`: optional per-tier byte budgets and value tracing
//! - `SimStats`: per-kind operation and transfer counters
//! - `kernels`: the plain matrix math behind each primitive

pub mod config;
pub mod kernels;
pub mod op;
pub mod simulator;
pub mod stats;

pub use config::{ConfigError, SimConfig};
pub use op::{Axis, Op};
pub use simulator::GpuSimulator;
pub use stats::SimStats;
