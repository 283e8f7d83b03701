pub mod fixtures;

pub use fixtures::{monotonic_ns, MappedFile, Timeline};
pub use process_harness::ProcessTestHarness;
