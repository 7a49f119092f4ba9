//! Template sources and source positions

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Stable identity of a template, used as the cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TemplateId {
    /// Identifier supplied by the caller (e.g. a mapper statement id)
    Named(String),
    /// Hex SHA-256 of the raw template text
    ContentHash(String),
}

impl TemplateId {
    pub fn as_str(&self) -> &str {
        match self {
            TemplateId::Named(id) | TemplateId::ContentHash(id) => id,
        }
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateId::Named(id) => f.write_str(id),
            TemplateId::ContentHash(hash) => write!(f, "sha256:{}", &hash[..hash.len().min(12)]),
        }
    }
}

/// Raw template text plus its identity. Cloning is cheap; the text is shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    id: TemplateId,
    text: Arc<str>,
    origin: Option<String>,
}

impl TemplateSource {
    /// Create a source identified by the content hash of its text
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        let text = text.into();
        Self {
            id: TemplateId::ContentHash(content_hash(&text)),
            text,
            origin: None,
        }
    }

    /// Create a source with an explicit identifier.
    ///
    /// The caller is responsible for never reusing an id for different text.
    pub fn with_id(id: impl Into<String>, text: impl Into<Arc<str>>) -> Self {
        Self {
            id: TemplateId::Named(id.into()),
            text: text.into(),
            origin: None,
        }
    }

    /// Attach an origin (file path, resource name) for diagnostics
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn id(&self) -> &TemplateId {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Resolve a byte offset into this source to a line/column position
    pub fn position(&self, offset: usize) -> Position {
        Position::locate(&self.text, offset)
    }
}

/// Hex SHA-256 digest of template text
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// A location in template source: byte offset plus 1-based line and column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Position {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl Position {
    /// Compute the line and column (in characters) of `offset` within `text`
    pub fn locate(text: &str, offset: usize) -> Self {
        let mut offset = offset.min(text.len());
        while !text.is_char_boundary(offset) {
            offset -= 1;
        }
        let before = &text[..offset];
        let line = before.matches('\n').count() + 1;
        let line_start = before.rfind('\n').map_or(0, |i| i + 1);
        let column = before[line_start..].chars().count() + 1;
        Self {
            offset,
            line,
            column,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_content_hash_identity() {
        let a = TemplateSource::new("SELECT 1");
        let b = TemplateSource::new(String::from("SELECT 1"));
        let c = TemplateSource::new("SELECT 2");

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().as_str().len(), 64);
    }

    #[test]
    fn test_named_id() {
        let source = TemplateSource::with_id("users.findById", "SELECT 1");
        assert_eq!(source.id(), &TemplateId::Named("users.findById".into()));
        assert_eq!(source.id().to_string(), "users.findById");
    }

    #[test]
    fn test_position_locate() {
        let text = "SELECT *\nFROM t\n  WHERE x";
        assert_eq!(
            Position::locate(text, 0),
            Position {
                offset: 0,
                line: 1,
                column: 1
            }
        );
        let where_offset = text.find("WHERE").unwrap();
        let pos = Position::locate(text, where_offset);
        assert_eq!((pos.line, pos.column), (3, 3));
    }

    #[test]
    fn test_position_counts_characters() {
        let text = "é<if>";
        let pos = Position::locate(text, text.find('<').unwrap());
        assert_eq!(pos.column, 2);
    }

    #[test]
    fn test_position_clamps() {
        let pos = Position::locate("abc", 99);
        assert_eq!(pos.offset, 3);
        assert_eq!(pos.column, 4);
    }
}
