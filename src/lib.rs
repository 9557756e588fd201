//! Dataset manager for multi-source plant-leaf image collections.
//!
//! The pipeline stages raw source archives, normalizes their heterogeneous
//! layouts into one canonical `{class}/{source}_{id}.{ext}` tree, groups
//! exact and near duplicates across sources, and produces reproducible,
//! leakage-free train/val/test splits. Every stage persists a JSON-lines
//! manifest so later stages can be re-run without redoing earlier work.

pub mod config;
pub mod core;
pub mod manifest;
pub mod pipeline;
pub mod record;

pub use config::{DataLayout, PipelineConfig};
pub use pipeline::{PipelineController, PipelineError, RunSummary};
