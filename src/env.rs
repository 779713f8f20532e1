//! Environment snapshot used for substitution and handed to the daemon.
use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    path::Path,
};

use tracing::debug;

use crate::error::EnvError;

/// Immutable name-to-value map taken once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvMap {
    vars: BTreeMap<String, String>,
}

impl EnvMap {
    /// Snapshots the current process environment. Entries that are not valid
    /// UTF-8 are skipped.
    pub fn from_process() -> Self {
        let mut vars = BTreeMap::new();
        for (key, value) in env::vars_os() {
            match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => {
                    vars.insert(key, value);
                }
                (Ok(key), Err(_)) => debug!("Skipping non UTF-8 value of '{key}'"),
                (Err(key), _) => debug!("Skipping non UTF-8 variable {key:?}"),
            }
        }
        Self { vars }
    }

    /// Snapshots the process environment and fills in entries from `env_file`
    /// that the process environment does not already define.
    pub fn from_process_with_file(env_file: Option<&Path>) -> Result<Self, EnvError> {
        let mut snapshot = Self::from_process();
        if let Some(path) = env_file {
            let loaded = load_env_file(path)?;
            debug!("Loaded {} variable(s) from {}", loaded.len(), path.display());
            for (key, value) in loaded {
                snapshot.vars.entry(key).or_insert(value);
            }
        }
        Ok(snapshot)
    }

    /// Looks up a variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Number of variables in the snapshot.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterates over all variables in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Parses a dotenv-style file of `KEY=VALUE` lines.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is accepted
/// and matching surrounding quotes are stripped from the value.
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>, EnvError> {
    let content = fs::read_to_string(path).map_err(|source| EnvError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut resolved = HashMap::new();
    for (index, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            return Err(EnvError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
            });
        };

        let key = key.trim();
        if key.is_empty() {
            return Err(EnvError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
            });
        }

        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }

        resolved.insert(key.to_string(), value.to_string());
    }

    Ok(resolved)
}
