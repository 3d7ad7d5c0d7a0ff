//! Command templates with `{name}` placeholders.
//!
//! A placeholder is a parameter name between braces: a letter or underscore
//! followed by letters, digits or underscores. Nothing inside the braces is
//! evaluated. `{{` and `}}` stand for literal braces; a lone `}` is kept as
//! text.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::store::ParameterStore;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
    dependencies: Vec<String>,
}

/// The outcome of substituting current parameter values into a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// Version of every dependency as observed during the render.
    pub versions: Vec<(String, u64)>,
}

impl Template {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.char_indices().peekable();

        while let Some((pos, ch)) = chars.next() {
            match ch {
                '{' => {
                    if matches!(chars.peek(), Some((_, '{'))) {
                        chars.next();
                        literal.push('{');
                        continue;
                    }
                    let end = chars.by_ref().find(|(_, c)| *c == '}').map(|(idx, _)| idx);
                    let Some(end) = end else {
                        return Err(Error::MalformedTemplate {
                            position: pos,
                            reason: "`{` is never closed".to_string(),
                        });
                    };
                    let name = &raw[pos + 1..end];
                    if !identifier().is_match(name) {
                        return Err(Error::MalformedTemplate {
                            position: pos,
                            reason: format!("{:?} is not a parameter name", name),
                        });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name.to_string()));
                }
                '}' => {
                    if matches!(chars.peek(), Some((_, '}'))) {
                        chars.next();
                    }
                    literal.push('}');
                }
                _ => literal.push(ch),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let mut dependencies: Vec<String> = Vec::new();
        for segment in &segments {
            if let Segment::Placeholder(name) = segment {
                if !dependencies.contains(name) {
                    dependencies.push(name.clone());
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
            dependencies,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Referenced parameter names, deduplicated, in order of first use.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Every placeholder occurrence in order, duplicates included.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitutes current values; unknown parameters render as "".
    pub fn render(&self, store: &ParameterStore) -> Rendered {
        let snapshot = store.snapshot(self.dependencies.iter().map(String::as_str));
        let text = self.fill(&snapshot);
        let versions = self
            .dependencies
            .iter()
            .map(|name| {
                let version = snapshot.get(name).map_or(0, |(_, version)| *version);
                (name.clone(), version)
            })
            .collect();
        Rendered { text, versions }
    }

    /// Substitutes values from a snapshot taken with
    /// [`ParameterStore::snapshot`]. Names missing from it render as "".
    pub fn fill(&self, snapshot: &HashMap<String, (String, u64)>) -> String {
        let mut text = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => text.push_str(literal),
                Segment::Placeholder(name) => {
                    if let Some((value, _)) = snapshot.get(name) {
                        text.push_str(value);
                    }
                }
            }
        }
        text
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn identifier() -> &'static Regex {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    IDENTIFIER.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern compiles")
    })
}
