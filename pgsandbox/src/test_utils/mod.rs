//! Test doubles for code built on the sandbox.
//!
//! [`memory_provisioner::MemoryProvisioner`] stands in for a real server so pool and
//! resource logic can be exercised without PostgreSQL binaries, and
//! [`transaction::LocalTransactionManager`] drives commit hooks the way an external
//! transaction manager would. [`cluster`] holds helpers for suites running real servers.

pub mod cluster;
pub mod memory_provisioner;
pub mod transaction;
