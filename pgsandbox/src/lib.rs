//! Disposable PostgreSQL databases for test suites.
//!
//! A [`cluster::Cluster`] either owns a server bootstrapped into a temporary directory or
//! attaches to an externally managed one. Tests receive [`database::Database`] instances
//! created on it, optionally cloned from a template whose next clones are preloaded in
//! the background. The [`resources`] module exposes both through a make/clean contract.

pub mod cluster;
pub mod database;
pub mod dirty;
pub mod error;
mod macros;
pub mod names;
pub mod preload;
pub mod process;
pub mod provisioner;
pub mod resources;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transaction;

pub use pgsandbox_config::SandboxConfig;
