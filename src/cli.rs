//! Command-line interface for bootshim.
use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::config::{self, Overrides, TemplateJob};

/// Verbosity levels in `--log-level` order; the index is the numeric shorthand.
const LOG_LEVELS: [(&str, LevelFilter); 6] = [
    ("off", LevelFilter::OFF),
    ("error", LevelFilter::ERROR),
    ("warn", LevelFilter::WARN),
    ("info", LevelFilter::INFO),
    ("debug", LevelFilter::DEBUG),
    ("trace", LevelFilter::TRACE),
];

/// A `--log-level` value: a level name or its number (`0` is off, `5` is trace).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// Directive understood by `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        LOG_LEVELS
            .iter()
            .find(|(_, level)| *level == self.0)
            .map(|(name, _)| *name)
            .unwrap_or("info")
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let unknown = || {
            format!("unknown log level '{value}'; use off, error, warn, info, debug, trace or 0-5")
        };

        if let Ok(index) = value.parse::<usize>() {
            return LOG_LEVELS
                .get(index)
                .map(|(_, level)| Self(*level))
                .ok_or_else(unknown);
        }

        let name = match value.to_ascii_lowercase().as_str() {
            "err" => "error".to_string(),
            "warning" => "warn".to_string(),
            other => other.to_string(),
        };
        LOG_LEVELS
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, level)| Self(*level))
            .ok_or_else(unknown)
    }
}

/// Command-line interface for bootshim.
#[derive(Parser)]
#[command(name = "bootshim", version, author)]
#[command(
    about = "Render a daemon's configuration from the environment, then run it in the foreground",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// YAML file providing defaults for every option.
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that renders templates.
#[derive(Args, Debug, Clone, Default)]
pub struct RenderArgs {
    /// Template and destination, e.g. `default.conf.tpl:/etc/nginx/conf.d/default.conf`.
    #[arg(short, long = "template", value_name = "TEMPLATE:DEST", value_parser = config::parse_template_pair)]
    pub templates: Vec<TemplateJob>,

    /// Dotenv-style file with fallback values for variables.
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Substitute undefined variables with an empty string instead of failing.
    #[arg(long)]
    pub allow_undefined: bool,

    /// Only substitute the named variable; repeat for several. Other references are kept verbatim.
    #[arg(long, value_name = "NAME")]
    pub only: Vec<String>,

    /// Octal permission bits for rendered files.
    #[arg(long, value_name = "OCTAL", value_parser = config::parse_mode)]
    pub mode: Option<u32>,
}

/// Available commands for bootshim.
#[derive(Subcommand)]
pub enum Commands {
    /// Render the templates, then launch and supervise the daemon.
    Run {
        #[command(flatten)]
        render: RenderArgs,

        /// Working directory for the daemon.
        #[arg(short = 'C', long, value_name = "DIR")]
        working_dir: Option<PathBuf>,

        /// Send SIGKILL this long after forwarding a termination signal (e.g. `10s`).
        #[arg(long, value_name = "DURATION", value_parser = config::parse_duration)]
        kill_after: Option<Duration>,

        /// Die by the daemon's signal instead of exiting with a fixed code.
        #[arg(long)]
        propagate_signal: bool,

        /// Program to run, followed by its arguments.
        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Render the templates and exit.
    Render {
        #[command(flatten)]
        render: RenderArgs,

        /// Print the rendered output instead of publishing it.
        #[arg(long, conflicts_with = "check")]
        stdout: bool,

        /// Only verify that the templates render.
        #[arg(long)]
        check: bool,
    },
}

impl RenderArgs {
    fn into_overrides(self) -> Overrides {
        Overrides {
            templates: self.templates,
            env_file: self.env_file,
            allow_undefined: self.allow_undefined,
            only: self.only,
            mode: self.mode,
            ..Default::default()
        }
    }
}

impl Commands {
    /// Command line settings that override the config file.
    pub fn overrides(&self) -> Overrides {
        match self {
            Commands::Run {
                render,
                working_dir,
                kill_after,
                propagate_signal,
                command,
            } => Overrides {
                working_dir: working_dir.clone(),
                kill_after: *kill_after,
                propagate_signal: *propagate_signal,
                command: command.clone(),
                ..render.clone().into_overrides()
            },
            Commands::Render { render, .. } => render.clone().into_overrides(),
        }
    }
}

/// Parses command-line arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}
