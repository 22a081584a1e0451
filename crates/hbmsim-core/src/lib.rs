//! # hbmsim-core
//!
//! Data model for the hbmsim two-tier device simulator.
//!
//! Provides:
//! - `Matrix`: dense 2-D `f32` buffers tagged with a memory tier
//! - `Residency`: the HBM / SRAM tier tag
//! - `Allocator`: generation-checked handle table with leak detection and
//!   per-tier byte accounting
//! - `SimError`: the fatal error taxonomy shared by every hbmsim crate

pub mod allocator;
pub mod error;
pub mod matrix;
pub mod residency;

pub use allocator::{Allocator, TensorId};
pub use error::{ErrorKind, SimError};
pub use matrix::Matrix;
pub use residency::Residency;

pub type Result<T> = std::result::Result<T, SimError>;
