//! Integration testing framework for sysprobe
//!
//! Exercises the synchronizer, the fault probe and the case runner through
//! the library, and the command line surface through the built binary.

pub mod infrastructure;
pub mod scenarios;

// Re-export commonly used types for convenience
pub use infrastructure::{MappedFile, ProcessTestHarness, Timeline};
