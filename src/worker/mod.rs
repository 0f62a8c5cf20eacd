//! CPU-bound analysis offload.
//!
//! [`WorkerPool`] runs an [`Analyzer`] on a fixed set of supervised OS
//! threads so request handling never blocks on analysis.

pub mod pool;
pub mod task;

pub use pool::{WorkerPool, WorkerPoolStats};
pub use task::{Analyzer, FnAnalyzer, TaskOptions, WorkerResponse, WorkerTask, analyzer_fn};
