//! Config-driven gradient determinism probe.
//!
//! A [`ProbeConfig`] names a corpus, a tokenizer and a [`model::CausalLm`]
//! shape. [`DeterminismCheck`] builds all three, snapshots gradients for two
//! batches and verifies that equal inputs give bitwise-equal gradients,
//! distinct inputs change every gradient, and accumulation resets between
//! snapshots.

pub mod check;
pub mod config;
pub mod logging;

pub use check::{
    AccumulationSummary, CheckReport, ComparisonSummary, DeterminismCheck, SnapshotSummary,
};
pub use config::{
    DataConfig, LoggingConfig, ProbeConfig, ProbeError, RuntimeConfig, TokenizerConfig,
};
pub use logging::{Logger, LoggingSettings};
