// src/analysis/mod.rs
// Background AI Analysis Worker (spec.md §4.7).

pub mod client;
pub mod model;
pub mod prompt;
pub mod redact;
pub mod store;
pub mod truncate;
pub mod worker;

pub use model::{AnalysisJob, AnalysisResult, JobStatus};
pub use store::{AnalysisStore, CreateOutcome};
pub use worker::AnalysisWorker;
