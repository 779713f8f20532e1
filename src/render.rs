//! Template renderer: substitutes variables and atomically publishes the result.
use std::{
    collections::BTreeSet,
    fs::{self, File, Permissions},
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use strum_macros::{AsRefStr, EnumString};
use tracing::{debug, info, warn};

use crate::{
    constants::{DEFAULT_FILE_MODE, TEMP_FILE_PREFIX},
    env::EnvMap,
    error::RenderError,
    template::{Segment, Template},
};

/// What to do with a reference to a variable that is not defined.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, AsRefStr, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UndefinedPolicy {
    /// Fail the render and list every missing variable.
    #[default]
    Strict,
    /// Substitute the empty string and log a warning.
    Empty,
}

/// Knobs controlling a render.
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Policy for undefined variables.
    pub undefined: UndefinedPolicy,
    /// When set, only these variables are substituted. Other references are
    /// copied verbatim.
    pub only: Option<BTreeSet<String>>,
}

/// In-memory result of substituting a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Fully substituted text.
    pub text: String,
    /// Distinct variables that were substituted, sorted.
    pub substituted: Vec<String>,
    /// Distinct variables the template references, sorted, including any
    /// left verbatim by the allow-list.
    pub referenced: Vec<String>,
}

/// Summary of a published render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderReport {
    /// Where the configuration was published.
    pub destination: PathBuf,
    /// Size of the published file.
    pub bytes: usize,
    /// Distinct variables that were substituted, sorted.
    pub substituted: Vec<String>,
}

/// Renders templates against an environment snapshot.
#[derive(Debug, Clone, Default)]
pub struct Renderer {
    options: RenderOptions,
}

impl Renderer {
    /// Creates a renderer with the given options.
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    /// Reads `template_path`, substitutes it against `env` and atomically
    /// replaces `dest_path` with the result.
    ///
    /// The destination keeps its current permissions, or gets the default
    /// mode when it is created. On error `dest_path` is left exactly as it was.
    pub fn render(
        &self,
        template_path: &Path,
        dest_path: &Path,
        env: &EnvMap,
    ) -> Result<RenderReport, RenderError> {
        let rendered = self.render_to_string(template_path, env)?;
        publish(dest_path, rendered.text.as_bytes(), None)?;

        info!(
            "Rendered {} -> {} ({} bytes, {} variable(s))",
            template_path.display(),
            dest_path.display(),
            rendered.text.len(),
            rendered.substituted.len()
        );

        Ok(RenderReport {
            destination: dest_path.to_path_buf(),
            bytes: rendered.text.len(),
            substituted: rendered.substituted,
        })
    }

    /// Reads and substitutes `template_path` without touching the filesystem otherwise.
    pub fn render_to_string(
        &self,
        template_path: &Path,
        env: &EnvMap,
    ) -> Result<Rendered, RenderError> {
        let text =
            fs::read_to_string(template_path).map_err(|source| RenderError::ReadError {
                path: template_path.to_path_buf(),
                source,
            })?;
        debug!("Read template {} ({} bytes)", template_path.display(), text.len());
        self.substitute_text(&text, template_path, env)
    }

    /// Substitutes template text held in memory.
    pub fn render_str(&self, text: &str, env: &EnvMap) -> Result<Rendered, RenderError> {
        self.substitute_text(text, Path::new("-"), env)
    }

    fn substitute_text(
        &self,
        text: &str,
        origin: &Path,
        env: &EnvMap,
    ) -> Result<Rendered, RenderError> {
        let template =
            Template::parse(text).map_err(|source| RenderError::TemplateError {
                path: origin.to_path_buf(),
                source,
            })?;
        self.substitute(&template, origin, env)
    }

    fn substitute(
        &self,
        template: &Template,
        origin: &Path,
        env: &EnvMap,
    ) -> Result<Rendered, RenderError> {
        let referenced = template
            .variables()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();

        if template.is_literal() {
            debug!("{} has no references; copying it verbatim", origin.display());
            let text = template
                .segments()
                .iter()
                .map(|segment| match segment {
                    Segment::Literal(text) => text.as_str(),
                    Segment::Variable { raw, .. } => raw.as_str(),
                })
                .collect();
            return Ok(Rendered {
                text,
                substituted: Vec::new(),
                referenced,
            });
        }

        let mut out = String::new();
        let mut substituted = BTreeSet::new();
        let mut missing = BTreeSet::new();

        for segment in template.segments() {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable { name, default, raw } => {
                    if let Some(only) = &self.options.only
                        && !only.contains(name)
                    {
                        out.push_str(raw);
                        continue;
                    }

                    match (env.get(name), default) {
                        (Some(value), _) => {
                            out.push_str(value);
                            substituted.insert(name.clone());
                        }
                        (None, Some(fallback)) => {
                            debug!("'{name}' is undefined, using its default");
                            out.push_str(fallback);
                            substituted.insert(name.clone());
                        }
                        (None, None) => match self.options.undefined {
                            UndefinedPolicy::Strict => {
                                missing.insert(name.clone());
                            }
                            UndefinedPolicy::Empty => {
                                if substituted.insert(name.clone()) {
                                    warn!(
                                        "'{name}' is undefined in {}; substituting an empty string",
                                        origin.display()
                                    );
                                }
                            }
                        },
                    }
                }
            }
        }

        if !missing.is_empty() {
            return Err(RenderError::UndefinedVariableError {
                path: origin.to_path_buf(),
                names: missing.into_iter().collect(),
            });
        }

        Ok(Rendered {
            text: out,
            substituted: substituted.into_iter().collect(),
            referenced,
        })
    }
}

/// Atomically replaces `dest` with `contents`.
///
/// The data is written to a temporary file in the destination's directory,
/// synced, and renamed over `dest`, so readers only ever see the old or the
/// new complete file.
pub fn publish(dest: &Path, contents: &[u8], mode: Option<u32>) -> Result<(), RenderError> {
    publish_with(dest, mode, |file| file.write_all(contents))
}

fn publish_with<F>(dest: &Path, mode: Option<u32>, write: F) -> Result<(), RenderError>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let write_error = |source| RenderError::WriteError {
        path: dest.to_path_buf(),
        source,
    };

    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_error)?;

    let mode = mode.unwrap_or_else(|| match fs::metadata(dest) {
        Ok(meta) if meta.is_file() => meta.permissions().mode() & 0o7777,
        _ => DEFAULT_FILE_MODE,
    });

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .tempfile_in(parent)
        .map_err(write_error)?;
    debug!("Staging {} in {}", dest.display(), temp.path().display());

    // The temp file is removed on drop if anything below fails.
    write(temp.as_file_mut()).map_err(write_error)?;
    temp.as_file().sync_all().map_err(write_error)?;
    temp.as_file()
        .set_permissions(Permissions::from_mode(mode))
        .map_err(write_error)?;

    temp.persist(dest).map_err(|err| RenderError::RenameError {
        path: dest.to_path_buf(),
        source: err.error,
    })?;

    if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
        debug!("Could not sync directory {}: {err}", parent.display());
    }

    Ok(())
}
