//! Frontmatter splitting and serialization for vault notes.
//!
//! A note carries its metadata in a YAML block at the very start of the file:
//! ```markdown
//! ---
//! title: My Task
//! vk_status: todo
//! ---
//!
//! # Content here
//! ```
//!
//! The YAML is kept as a [`serde_yaml::Mapping`] so that keys we do not
//! recognize, and the order the user wrote them in, survive a rewrite.

use serde_yaml::{Mapping, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrontmatterError {
    #[error("Failed to serialize frontmatter: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("Frontmatter is not a valid YAML mapping: {0}")]
    InvalidYaml(String),
}

/// A note split into its frontmatter mapping and body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedNote {
    /// Frontmatter keys in file order (empty if the note has none)
    pub frontmatter: Mapping,
    /// Everything after the closing delimiter
    pub body: String,
}

impl ParsedNote {
    /// Look up a string-valued key. Numbers and booleans are stringified,
    /// other YAML types are ignored.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.frontmatter.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Set a string-valued key, keeping its position if it already exists.
    pub fn set_str(&mut self, key: &str, value: &str) {
        self.frontmatter
            .insert(Value::String(key.to_string()), Value::String(value.to_string()));
    }
}

/// Find the byte offset of the closing `---` line, relative to `s`.
fn find_closing_delimiter(s: &str) -> Option<usize> {
    let mut pos = 0;
    for line in s.split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']) == "---" {
            return Some(pos);
        }
        pos += line.len();
    }
    None
}

/// Parse a note into frontmatter and body.
///
/// Notes without an opening delimiter, without a closing delimiter, or whose
/// YAML is not a mapping are treated as having no frontmatter at all. Use
/// [`parse_strict`] before rewriting a note.
pub fn parse(raw: &str) -> ParsedNote {
    parse_strict(raw).unwrap_or_else(|_| ParsedNote {
        frontmatter: Mapping::new(),
        body: raw.to_string(),
    })
}

/// Like [`parse`], but a delimited block that is not a YAML mapping is an
/// error instead of body text.
pub fn parse_strict(raw: &str) -> Result<ParsedNote, FrontmatterError> {
    let no_frontmatter = || ParsedNote {
        frontmatter: Mapping::new(),
        body: raw.to_string(),
    };

    let Some(after_open) = raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))
    else {
        return Ok(no_frontmatter());
    };

    let Some(close) = find_closing_delimiter(after_open) else {
        return Ok(no_frontmatter());
    };

    let yaml = &after_open[..close];
    let after_close = &after_open[close..];
    let body = after_close
        .split_once('\n')
        .map(|(_, rest)| rest)
        .unwrap_or("");

    let frontmatter = if yaml.trim().is_empty() {
        Mapping::new()
    } else {
        match serde_yaml::from_str::<Value>(yaml) {
            Ok(Value::Mapping(map)) => map,
            Ok(_) => return Err(FrontmatterError::InvalidYaml("not a mapping".into())),
            Err(e) => return Err(FrontmatterError::InvalidYaml(e.to_string())),
        }
    };

    Ok(ParsedNote {
        frontmatter,
        body: body.to_string(),
    })
}

/// Serialize frontmatter and body back to a note.
///
/// An empty mapping yields just the body.
pub fn serialize(note: &ParsedNote) -> Result<String, FrontmatterError> {
    if note.frontmatter.is_empty() {
        return Ok(note.body.clone());
    }
    let yaml = serde_yaml::to_string(&note.frontmatter)?;
    Ok(format!("---\n{}---\n{}", yaml, note.body))
}
