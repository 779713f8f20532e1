//! Error handling for bootshim.
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building the environment map.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The env file could not be read.
    #[error("Failed to read env file {path}: {source}")]
    Read {
        /// Path of the env file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A line of the env file is not a `KEY=VALUE` assignment.
    #[error("Invalid assignment in env file {path} at line {line}")]
    Parse {
        /// Path of the env file.
        path: PathBuf,
        /// One-based line number.
        line: usize,
    },
}

/// Errors raised while parsing a template document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A `${` that does not start a valid variable reference.
    #[error("Malformed variable reference at line {line}, column {column}: {reason}")]
    MalformedReference {
        /// One-based line number.
        line: usize,
        /// One-based column (in characters).
        column: usize,
        /// What is wrong with the reference.
        reason: &'static str,
    },
}

/// Errors raised by the template renderer.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The template could not be read.
    #[error("Failed to read template {path}: {source}")]
    ReadError {
        /// Template path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The template contains invalid reference syntax.
    #[error("Invalid template {path}: {source}")]
    TemplateError {
        /// Template path.
        path: PathBuf,
        /// The parse failure.
        #[source]
        source: TemplateError,
    },

    /// One or more referenced variables are missing from the environment.
    #[error("Undefined variable(s) in {}: {}", path.display(), names.join(", "))]
    UndefinedVariableError {
        /// Template path (or `-` for in-memory renders).
        path: PathBuf,
        /// Missing names, sorted and de-duplicated.
        names: Vec<String>,
    },

    /// The rendered file could not be written next to the destination.
    #[error("Failed to write rendered config for {path}: {source}")]
    WriteError {
        /// Destination path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The rendered file could not be moved over the destination.
    #[error("Failed to publish rendered config to {path}: {source}")]
    RenameError {
        /// Destination path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The environment map could not be built.
    #[error(transparent)]
    Env(#[from] EnvError),
}

/// Errors raised by the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The program is not on disk or not on `PATH`.
    #[error("Executable '{program}' not found")]
    ExecutableNotFound {
        /// The program as configured.
        program: String,
    },

    /// The program exists but cannot be executed.
    #[error("Executable {path} is not runnable: permission denied")]
    PermissionDenied {
        /// The resolved path.
        path: PathBuf,
    },

    /// The working directory is missing or not a directory.
    #[error("Working directory {path} is not a directory")]
    InvalidWorkingDir {
        /// The configured working directory.
        path: PathBuf,
    },

    /// Error spawning the daemon process.
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        /// The program that failed to start.
        program: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the running daemon failed.
    #[error("Failed to wait for pid {pid}: {source}")]
    Wait {
        /// Process id of the daemon.
        pid: u32,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Signal mask manipulation failed.
    #[error("Signal setup failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// The signal forwarding thread could not be started.
    #[error("Failed to start signal forwarding thread: {0}")]
    SignalThread(#[source] std::io::Error),
}

impl SupervisorError {
    /// Whether the error happened before the daemon was running.
    pub fn is_launch_failure(&self) -> bool {
        !matches!(self, SupervisorError::Wait { .. })
    }
}

/// Errors raised while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file {path}: {source}")]
    ConfigReadError {
        /// Config path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// The merged configuration is incomplete or inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
