pub mod case_runner_tests;
pub mod cli_tests;
pub mod fault_probe_tests;
pub mod synchronizer_tests;
