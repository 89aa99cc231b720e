//! Logging setup shared by sandbox binaries and test suites.

pub mod tracing;
