//! Shared configuration types for sandbox clusters.

mod base;
mod sandbox;
mod server;

pub use base::ValidationError;
pub use sandbox::SandboxConfig;
pub use server::ServerConfig;
