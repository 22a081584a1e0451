//! # hbmsim-attention
//!
//! Streaming attention expressed entirely through hbmsim device primitives.
//!
//! Provides:
//! - `StreamingAttention`: per-round driver growing `K^T` / `V` accumulators
//!   in SRAM and computing softmax one query row at a time
//! - `QueryRater`: the query source / answer collector interface
//! - `Rater`: in-process rater scoring answers against a direct reference
//! - `reference`: plain (non-streaming) attention on matrices

pub mod rater;
pub mod reference;
pub mod streaming;

pub use rater::{QueryRater, Rater, RaterConfig, RaterReport, RoundScore};
pub use streaming::{calculate, StreamingAttention};
