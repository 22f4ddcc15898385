//! Tooling around `percpu-alloc-core`: a JSONL logger for the `log`
//! facade, a topology report, and a multi-threaded stress driver.

pub mod report;
pub mod stress;
pub mod structured_log;

pub use report::TopologyReport;
pub use stress::{StressConfig, StressError, StressReport, run_stress};
pub use structured_log::{JsonlLogger, LogEntry};
