//! Window title templates
//!
//! Templates use `{{ .name }}` placeholders, optionally qualified with a
//! variable group as `{{ .slave.pid }}`. Unqualified names resolve against
//! the groups in reverse registration order, so later groups override
//! earlier ones.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;

use webterm_utils::{Result, WebtermError};

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{\{\s*\.([A-Za-z_][A-Za-z0-9_]*)(?:\.([A-Za-z_][A-Za-z0-9_]*))?\s*\}\}")
            .unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable { group: Option<String>, name: String },
}

/// A parsed title template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl TitleTemplate {
    /// Parse a template, rejecting malformed placeholders
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut last = 0;

        for captures in PLACEHOLDER.captures_iter(source) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            push_literal(&mut segments, &source[last..whole.start()])?;

            let first = captures[1].to_string();
            let segment = match captures.get(2) {
                Some(name) => Segment::Variable {
                    group: Some(first),
                    name: name.as_str().to_string(),
                },
                None => Segment::Variable {
                    group: None,
                    name: first,
                },
            };
            segments.push(segment);
            last = whole.end();
        }
        push_literal(&mut segments, &source[last..])?;

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Expand the template; unknown variables are an error
    pub fn render(&self, vars: &TitleVariables) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable { group, name } => {
                    let value = vars.lookup(group.as_deref(), name).ok_or_else(|| {
                        let full = match group {
                            Some(group) => format!("{}.{}", group, name),
                            None => name.clone(),
                        };
                        WebtermError::config(format!("unknown title variable: .{}", full))
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) -> Result<()> {
    if text.contains("{{") {
        return Err(WebtermError::config(format!(
            "invalid title template near {:?}",
            text
        )));
    }
    if !text.is_empty() {
        segments.push(Segment::Literal(text.to_string()));
    }
    Ok(())
}

/// Named groups of title variables
#[derive(Debug, Clone, Default)]
pub struct TitleVariables {
    groups: Vec<(String, HashMap<String, String>)>,
}

impl TitleVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group; later groups win for unqualified names
    pub fn with_group(mut self, name: impl Into<String>, vars: HashMap<String, String>) -> Self {
        self.groups.push((name.into(), vars));
        self
    }

    pub fn lookup(&self, group: Option<&str>, name: &str) -> Option<&str> {
        match group {
            Some(group) => self
                .groups
                .iter()
                .rev()
                .find(|(g, _)| g == group)
                .and_then(|(_, vars)| vars.get(name)),
            None => self
                .groups
                .iter()
                .rev()
                .find_map(|(_, vars)| vars.get(name)),
        }
        .map(String::as_str)
    }
}

/// Server-level variables: `command`, `argv`, `hostname`
pub fn server_variables(command: &[String]) -> HashMap<String, String> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read hostname");
            "localhost".into()
        });

    let mut vars = HashMap::new();
    vars.insert(
        "command".into(),
        command.first().cloned().unwrap_or_default(),
    );
    vars.insert("argv".into(), command.iter().skip(1).cloned().collect::<Vec<_>>().join(" "));
    vars.insert("hostname".into(), hostname);
    vars
}
