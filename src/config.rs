//! Configuration management for bootshim.
//!
//! Settings come from an optional YAML file and from the command line. Command
//! line values win; lists given on the command line replace the file's lists.
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    error::ConfigError,
    render::{RenderOptions, UndefinedPolicy},
    supervisor::LaunchSpec,
};

/// Represents the structure of the configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Templates to render before launching.
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
    /// Optional dotenv-style file merged under the process environment.
    pub env_file: Option<String>,
    /// Substitute undefined variables with an empty string instead of failing.
    pub allow_undefined: Option<bool>,
    /// Restrict substitution to these variable names.
    pub only: Option<Vec<String>>,
    /// Program to launch.
    pub command: Option<String>,
    /// Arguments for the program.
    pub args: Option<Vec<String>>,
    /// Working directory for the program.
    pub working_dir: Option<String>,
    /// Grace period before SIGKILL once a termination signal was forwarded (e.g. `10s`).
    pub kill_after: Option<String>,
    /// Die by the daemon's signal instead of exiting with a fixed code.
    pub propagate_signal: Option<bool>,
    /// Directory from which relative paths are resolved. Set by the loader.
    #[serde(skip)]
    pub project_dir: Option<PathBuf>,
}

/// One template to render.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateConfig {
    /// Template path.
    pub source: String,
    /// Where the rendered configuration is published.
    pub destination: String,
    /// Octal permission bits for the destination (e.g. `"0640"`).
    pub mode: Option<String>,
}

impl Config {
    /// Resolves `path` against the directory holding the config file.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.project_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Loads and parses the configuration file.
pub fn load_config(config_path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(config_path).map_err(|source| {
        ConfigError::ConfigReadError {
            path: config_path.to_path_buf(),
            source,
        }
    })?;

    let mut config: Config = serde_yaml::from_str(&content)?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    config.project_dir = Some(base_path);

    Ok(config)
}

/// A template paired with its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub mode: Option<u32>,
}

/// Settings given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub templates: Vec<TemplateJob>,
    pub env_file: Option<PathBuf>,
    pub allow_undefined: bool,
    pub only: Vec<String>,
    pub mode: Option<u32>,
    pub working_dir: Option<PathBuf>,
    pub kill_after: Option<Duration>,
    pub propagate_signal: bool,
    /// Program followed by its arguments.
    pub command: Vec<String>,
}

/// Fully merged settings for one invocation.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub templates: Vec<TemplateJob>,
    pub env_file: Option<PathBuf>,
    pub render: RenderOptions,
    pub launch: Option<LaunchSpec>,
    pub propagate_signal: bool,
}

/// Merges the config file (if any) with command line overrides.
pub fn resolve(config: Option<Config>, overrides: Overrides) -> Result<LaunchPlan, ConfigError> {
    let config = config.unwrap_or_default();

    let templates = if overrides.templates.is_empty() {
        config
            .templates
            .iter()
            .map(|template| -> Result<TemplateJob, ConfigError> {
                Ok(TemplateJob {
                    source: config.resolve_path(&template.source),
                    destination: config.resolve_path(&template.destination),
                    mode: template.mode.as_deref().map(parse_mode).transpose()?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?
    } else {
        overrides.templates
    };

    if templates.is_empty() {
        return Err(ConfigError::Invalid("no templates configured".into()));
    }

    let templates = templates
        .into_iter()
        .map(|job| TemplateJob {
            mode: overrides.mode.or(job.mode),
            ..job
        })
        .collect();

    let env_file = overrides
        .env_file
        .or_else(|| config.env_file.as_deref().map(|f| config.resolve_path(f)));

    let undefined = if overrides.allow_undefined || config.allow_undefined.unwrap_or(false) {
        UndefinedPolicy::Empty
    } else {
        UndefinedPolicy::Strict
    };

    let only = if overrides.only.is_empty() {
        config.only.clone()
    } else {
        Some(overrides.only)
    };

    let (program, args) = match overrides.command.split_first() {
        Some((program, args)) => (Some(program.clone()), args.to_vec()),
        None => (config.command.clone(), config.args.clone().unwrap_or_default()),
    };

    let kill_after = match overrides.kill_after {
        Some(duration) => Some(duration),
        None => config.kill_after.as_deref().map(parse_duration).transpose()?,
    };

    let working_dir = overrides
        .working_dir
        .or_else(|| config.working_dir.as_deref().map(|d| config.resolve_path(d)));

    let launch = program.map(|program| LaunchSpec {
        program,
        args,
        working_dir,
        env: None,
        kill_after,
    });

    Ok(LaunchPlan {
        templates,
        env_file,
        render: RenderOptions {
            undefined,
            only: only.map(|names| names.into_iter().collect::<BTreeSet<_>>()),
        },
        launch,
        propagate_signal: overrides.propagate_signal || config.propagate_signal.unwrap_or(false),
    })
}

/// Parses a grace period such as `30`, `10s`, `2m` or `1h`. A bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || {
        ConfigError::Invalid(format!(
            "kill_after must be a whole number of seconds, minutes or hours (e.g. 10s, 2m), got '{raw}'"
        ))
    };

    let value = raw.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    if digits.is_empty() {
        return Err(invalid());
    }

    let seconds_per_unit = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(invalid()),
    };
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    Ok(Duration::from_secs(amount.saturating_mul(seconds_per_unit)))
}

/// Parses octal permission bits such as `644` or `0o640`.
pub fn parse_mode(raw: &str) -> Result<u32, ConfigError> {
    let value = raw.trim();
    let digits = value.strip_prefix("0o").unwrap_or(value);
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(ConfigError::Invalid(format!("Invalid file mode: '{raw}'"))),
    }
}

/// Parses a `TEMPLATE:DESTINATION` pair.
pub fn parse_template_pair(raw: &str) -> Result<TemplateJob, ConfigError> {
    match raw.split_once(':') {
        Some((source, destination)) if !source.is_empty() && !destination.is_empty() => {
            Ok(TemplateJob {
                source: PathBuf::from(source),
                destination: PathBuf::from(destination),
                mode: None,
            })
        }
        _ => Err(ConfigError::Invalid(format!(
            "Expected TEMPLATE:DESTINATION, got '{raw}'"
        ))),
    }
}
