pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod runner;
pub mod session;

#[cfg(test)]
mod testing;

pub use auth::{AuthenticationManager, SessionState};
pub use client::{GridClient, ReplicaRecord, NOT_FOUND_STATUS};
pub use config::{AuthScheme, Config, GridSettings};
pub use error::{ExecutionError, GridError};
pub use runner::{CommandExecutor, CommandOutput, CommandRunner, Invocation, ProcessExecutor};
pub use session::{Authentication, GsiCertificates, SessionDescriptor, SessionEnvironment};
