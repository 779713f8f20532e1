//! Bootshim prepares and launches an externally-configured daemon: it renders
//! configuration templates from the environment, publishes them atomically,
//! then runs the daemon in the foreground, forwarding termination signals and
//! propagating its exit status.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Exit codes and signal sets.
pub mod constants;

/// Environment snapshot.
pub mod env;

/// Error handling.
pub mod error;

/// Rendering and atomic publication of configuration files.
pub mod render;

/// Foreground supervision of the daemon.
pub mod supervisor;

/// Template parsing.
pub mod template;
