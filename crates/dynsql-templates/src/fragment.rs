//! Parsed template nodes

use serde::Serialize;

use crate::expr::Expression;
use crate::functions::SqlFunctionCall;

/// How a placeholder's value reaches the SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderKind {
    /// `#{path}`: a bind marker plus a bind value
    Bound,
    /// `${path}`: the value's text is spliced into the SQL
    Raw,
}

/// One node of a template tree
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Text(String),
    Placeholder(Placeholder),
    /// `#{name(args)}`: a SQL function call with bound arguments
    SqlFunction(SqlFunctionCall),
    If {
        test: Expression,
        body: Vec<Fragment>,
        offset: usize,
    },
    Choose {
        branches: Vec<WhenBranch>,
        otherwise: Option<Vec<Fragment>>,
        offset: usize,
    },
    Foreach(Foreach),
    Trim(Trim),
    Bind {
        name: String,
        value: Expression,
        offset: usize,
    },
    /// `<include refid>`, replaced while loading a mapper document
    Include { refid: String, offset: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub path: Expression,
    pub kind: PlaceholderKind,
    /// `key=value` options after the path (e.g. `jdbcType=BIGINT`)
    pub options: Vec<(String, String)>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhenBranch {
    pub test: Expression,
    pub body: Vec<Fragment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Foreach {
    pub collection: Expression,
    pub item: Option<String>,
    pub index: Option<String>,
    pub open: Option<String>,
    pub close: Option<String>,
    pub separator: Option<String>,
    pub body: Vec<Fragment>,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trim {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub prefix_overrides: Vec<String>,
    pub suffix_overrides: Vec<String>,
    pub body: Vec<Fragment>,
}

impl Trim {
    /// `<where>`: prefix `WHERE`, strip a leading `AND`/`OR`
    pub fn where_clause(body: Vec<Fragment>) -> Self {
        Self {
            prefix: Some("WHERE".into()),
            prefix_overrides: ["AND ", "OR ", "AND\n", "OR\n", "AND\r", "OR\r", "AND\t", "OR\t"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            body,
            ..Default::default()
        }
    }

    /// `<set>`: prefix `SET`, strip a trailing comma
    pub fn set_clause(body: Vec<Fragment>) -> Self {
        Self {
            prefix: Some("SET".into()),
            suffix_overrides: vec![",".into()],
            body,
            ..Default::default()
        }
    }
}

/// Split a `|`-separated override list. Entries are kept verbatim
/// (including trailing spaces) and empty entries are dropped.
pub fn parse_overrides(list: &str) -> Vec<String> {
    list.split('|')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_overrides() {
        assert_eq!(parse_overrides("AND |OR "), vec!["AND ", "OR "]);
        assert_eq!(parse_overrides(","), vec![","]);
        assert!(parse_overrides("").is_empty());
    }

    #[test]
    fn test_where_and_set() {
        let trim = Trim::where_clause(vec![]);
        assert_eq!(trim.prefix.as_deref(), Some("WHERE"));
        assert_eq!(trim.prefix_overrides.len(), 8);

        let trim = Trim::set_clause(vec![]);
        assert_eq!(trim.suffix_overrides, vec![","]);
    }
}
