//! Declarative engine configuration
//!
//! The engine is configured once at startup, either in code through the
//! builder methods or from a TOML file:
//!
//! ```toml
//! missing_property = "strict"
//! marker_style = "dollar-numbered"
//! database_id = "postgresql"
//!
//! [cache]
//! max_entries = 512
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::Result;

/// How a lookup of an absent property is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingPropertyMode {
    /// Absent keys evaluate to null
    #[default]
    Lenient,
    /// Absent keys raise `PropertyNotFound`
    Strict,
}

/// Bind marker convention of the target driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerStyle {
    /// `?` - JDBC, MySQL, SQLite
    #[default]
    QuestionMark,
    /// `$1`, `$2` - PostgreSQL
    DollarNumbered,
    /// `:name` - Oracle, SQLite, named-parameter drivers
    ColonNamed,
}

impl MarkerStyle {
    /// Render the marker for the `ordinal`-th bind value (1-based)
    pub fn marker(&self, ordinal: usize, name: &str) -> String {
        match self {
            MarkerStyle::QuestionMark => "?".to_string(),
            MarkerStyle::DollarNumbered => format!("${}", ordinal),
            MarkerStyle::ColonNamed => format!(":{}", name),
        }
    }

    /// Get display name for this marker style
    pub fn display_name(&self) -> &'static str {
        match self {
            MarkerStyle::QuestionMark => "question-mark",
            MarkerStyle::DollarNumbered => "dollar-numbered",
            MarkerStyle::ColonNamed => "colon-named",
        }
    }
}

impl fmt::Display for MarkerStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for MarkerStyle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "question-mark" | "question" | "?" => Ok(MarkerStyle::QuestionMark),
            "dollar-numbered" | "dollar" | "$" => Ok(MarkerStyle::DollarNumbered),
            "colon-named" | "named" | ":" => Ok(MarkerStyle::ColonNamed),
            other => Err(format!("unknown marker style: {other}")),
        }
    }
}

/// Template cache configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on cached templates; `None` keeps every template.
    /// When set, least-recently-used entries are evicted.
    #[serde(default)]
    pub max_entries: Option<usize>,
}

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lenient (null) or strict (error) handling of absent properties
    #[serde(default)]
    pub missing_property: MissingPropertyMode,
    /// Marker convention used in rendered SQL
    #[serde(default)]
    pub marker_style: MarkerStyle,
    /// Database identifier (e.g. "mysql"); selects mapper statement
    /// variants and is visible to templates as `_databaseId`
    #[serde(default)]
    pub database_id: Option<String>,
    /// Template cache settings
    #[serde(default)]
    pub cache: CacheConfig,
}

impl EngineConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "loading engine configuration");
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn with_missing_property(mut self, mode: MissingPropertyMode) -> Self {
        self.missing_property = mode;
        self
    }

    pub fn with_marker_style(mut self, style: MarkerStyle) -> Self {
        self.marker_style = style;
        self
    }

    pub fn with_database_id(mut self, database_id: impl Into<String>) -> Self {
        self.database_id = Some(database_id.into());
        self
    }

    pub fn with_cache_capacity(mut self, max_entries: usize) -> Self {
        self.cache.max_entries = Some(max_entries);
        self
    }

    /// Whether absent properties raise errors
    pub fn is_strict(&self) -> bool {
        self.missing_property == MissingPropertyMode::Strict
    }
}
