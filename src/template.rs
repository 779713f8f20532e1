//! Template documents: literal text interleaved with `${NAME}` references.
//!
//! Supported forms:
//!
//! * `${NAME}` substitutes the variable `NAME`.
//! * `${NAME:-fallback}` substitutes `fallback` when `NAME` is not defined.
//! * `$${` renders a literal `${`.
//!
//! A `$` that is not followed by `{` is plain text, so daemon-side variables
//! such as nginx's `$host` pass through untouched.
use std::{collections::BTreeSet, sync::LazyLock};

use regex::Regex;

use crate::error::TemplateError;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$\$\{|\$\{(?P<name>[A-Za-z_][A-Za-z0-9_]*)(?::-(?P<default>[^}]*))?\}|\$\{",
    )
    .expect("reference pattern is valid")
});

/// One span of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Text copied to the output as is.
    Literal(String),
    /// A variable reference.
    Variable {
        /// Variable name.
        name: String,
        /// Fallback used when the variable is undefined.
        default: Option<String>,
        /// The reference exactly as written, delimiters included.
        raw: String,
    },
}

/// A parsed template. Adjacent literal text is merged into a single segment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parses template text.
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut cursor = 0;

        for caps in REFERENCE.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            literal.push_str(&text[cursor..whole.start()]);
            cursor = whole.end();

            if whole.as_str() == "$${" {
                literal.push_str("${");
                continue;
            }

            let Some(name) = caps.name("name") else {
                return Err(malformed(text, whole.start()));
            };

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Variable {
                name: name.as_str().to_string(),
                default: caps.name("default").map(|m| m.as_str().to_string()),
                raw: whole.as_str().to_string(),
            });
        }

        literal.push_str(&text[cursor..]);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// The parsed spans in document order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Distinct variable names referenced by the template, sorted.
    pub fn variables(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Variable { name, .. } => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Whether the template contains no references at all.
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)))
    }
}

/// Builds the error for a `${` at byte `offset` that is not a valid reference.
fn malformed(text: &str, offset: usize) -> TemplateError {
    let before = &text[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = text[line_start..offset].chars().count() + 1;

    let rest_of_line = text[offset + 2..].split('\n').next().unwrap_or("");
    let reason = if rest_of_line.contains('}') {
        "invalid variable name"
    } else {
        "missing closing brace"
    };

    TemplateError::MalformedReference {
        line,
        column,
        reason,
    }
}
