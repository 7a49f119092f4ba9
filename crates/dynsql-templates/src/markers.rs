//! Bind marker scanning over rendered SQL
//!
//! Used to check that rendered SQL carries exactly one marker per bind
//! value. Markers inside string literals and comments are ignored.

use dynsql_core::MarkerStyle;
use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

static QUESTION_MARK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\?").expect("valid regex"));

static DOLLAR_NUMBERED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\d+").expect("valid regex"));

static COLON_NAMED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":[a-zA-Z_][a-zA-Z0-9_]*").expect("valid regex"));

// String literals, quoted identifiers and comments
static STRING_LITERAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"'(?:[^']|'')*'|"(?:[^"]|"")*"|--[^\n]*|/\*[\s\S]*?\*/"#).expect("valid regex")
});

/// Byte ranges of every marker of `style` in `sql`, in order
pub fn find_markers(sql: &str, style: MarkerStyle) -> Vec<Range<usize>> {
    let masked = mask_strings_and_comments(sql);
    let regex = match style {
        MarkerStyle::QuestionMark => &*QUESTION_MARK_REGEX,
        MarkerStyle::DollarNumbered => &*DOLLAR_NUMBERED_REGEX,
        MarkerStyle::ColonNamed => &*COLON_NAMED_REGEX,
    };
    regex
        .find_iter(&masked)
        .filter(|m| {
            // `x::int` is a cast, not a marker
            style != MarkerStyle::ColonNamed || !masked[..m.start()].ends_with(':')
        })
        .map(|m| m.range())
        .collect()
}

/// Number of markers of `style` in `sql`
pub fn count_markers(sql: &str, style: MarkerStyle) -> usize {
    find_markers(sql, style).len()
}

/// Replace string literals and comments with spaces of the same length
fn mask_strings_and_comments(sql: &str) -> String {
    STRING_LITERAL_REGEX
        .replace_all(sql, |caps: &regex::Captures| " ".repeat(caps[0].len()))
        .into_owned()
}
