//! tuneloop - iterative weight tuning for statistical MT decoders
//!
//! Given a source text, reference translations, and a decoder
//! configuration, tuneloop repeatedly decodes, accumulates the decoder's
//! n-best output across iterations, and drives an external optimizer to
//! produce better weights, until nothing new comes out of the decoder or
//! the iteration cap is hit.
//!
//! # Architecture
//!
//! ```text
//! Decode → Aggregate → Score → Optimize → (new weights) → Decode …
//!    ↓         ↓          ↓        ↓
//! parallel  dedup by   corpus   pluggable strategy
//! jobs      (text,     BLEU     powell | mira | pro | svm |
//!           features)           expsb | lmira | olmira
//! ```
//!
//! The decoder, the optimizer numerics, and the BLEU scorer are opaque
//! external tools; everything that touches them lives behind the
//! adapters in [`external`], [`decode`], and [`score`]. The loop itself
//! ([`tuner`]) only ever sees typed results.
//!
//! Key invariants:
//! - The hypothesis accumulation only grows, and re-merging a decode is
//!   a no-op - which is what makes "no novel hypotheses" a sound
//!   stopping rule.
//! - Weight vectors are replaced, never mutated, and their length is
//!   fixed for the run.
//! - Any external failure aborts the run; there is no checkpoint or
//!   retry.

pub mod aggregate;
pub mod context;
pub mod decode;
pub mod external;
pub mod history;
pub mod optimize;
pub mod progress;
pub mod score;
pub mod shard;
pub mod stability;
pub mod tuner;
pub mod types;

// Re-export core types
pub use aggregate::AggregateState;
pub use context::RunContext;
pub use decode::DecodeMode;
pub use history::BestTracker;
pub use optimize::OptimizerStrategy;
pub use shard::{CombinePolicy, Shard, ShardSet};
pub use tuner::{StopReason, TuneOutcome, Tuner};
pub use types::{BestResult, Hypothesis, IterationRecord, WeightVector};
