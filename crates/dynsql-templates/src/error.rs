//! Error types for template parsing, evaluation and rendering

use serde::Serialize;
use thiserror::Error;

use crate::source::Position;

/// What went wrong while parsing a template or mapper document
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseErrorKind {
    #[error("unterminated <{tag}> block")]
    UnterminatedTag { tag: String },

    #[error("unexpected closing tag </{tag}>")]
    UnexpectedClosingTag { tag: String },

    #[error("expected </{expected}>, found </{found}>")]
    MismatchedClosingTag { expected: String, found: String },

    #[error("unknown directive <{tag}>")]
    UnknownDirective { tag: String },

    #[error("<{tag}> requires attribute `{attribute}`")]
    MissingAttribute { tag: String, attribute: String },

    #[error("<{tag}> does not accept attribute `{attribute}`")]
    UnknownAttribute { tag: String, attribute: String },

    #[error("attribute `{attribute}` repeated on <{tag}>")]
    DuplicateAttribute { tag: String, attribute: String },

    #[error("malformed tag: {message}")]
    MalformedTag { message: String },

    #[error("malformed expression: {message}")]
    MalformedExpression { message: String },

    #[error("unknown function `{name}`")]
    UnknownFunction { name: String },

    #[error("unterminated placeholder")]
    UnterminatedPlaceholder,

    #[error("malformed placeholder: {message}")]
    MalformedPlaceholder { message: String },

    #[error("invalid nesting: {message}")]
    InvalidNesting { message: String },

    #[error("unterminated CDATA section")]
    UnterminatedCdata,

    #[error("unterminated comment")]
    UnterminatedComment,

    #[error("<include> is only allowed inside mapper documents")]
    IncludeOutsideMapper,

    #[error("unknown sql fragment `{refid}`")]
    UnknownInclude { refid: String },

    #[error("sql fragment `{refid}` includes itself")]
    IncludeCycle { refid: String },

    #[error("duplicate statement id `{id}`")]
    DuplicateStatement { id: String },

    #[error("malformed mapper document: {message}")]
    MalformedDocument { message: String },
}

/// A template that cannot be parsed. Fatal at load time.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind} at {position}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub position: Position,
}

impl ParseError {
    /// Create an error at `offset` within `text`
    pub fn at(kind: ParseErrorKind, text: &str, offset: usize) -> Self {
        Self {
            kind,
            position: Position::locate(text, offset),
        }
    }

    /// Human-readable message without the position
    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

/// Syntax error located by byte offset only; converted into a
/// [`ParseError`] once the full source text is at hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SyntaxError {
    pub kind: ParseErrorKind,
    pub offset: usize,
}

impl SyntaxError {
    pub fn new(kind: ParseErrorKind, offset: usize) -> Self {
        Self { kind, offset }
    }

    pub fn into_parse_error(self, text: &str) -> ParseError {
        ParseError::at(self.kind, text, self.offset)
    }
}

/// Failure while evaluating an expression against a parameter context
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvalError {
    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },

    #[error("arithmetic error: {message}")]
    ArithmeticError { message: String },

    #[error("property not found: {path}")]
    PropertyNotFound { path: String },
}

impl EvalError {
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        EvalError::TypeMismatch {
            message: message.into(),
        }
    }

    pub fn arithmetic(message: impl Into<String>) -> Self {
        EvalError::ArithmeticError {
            message: message.into(),
        }
    }
}

/// An evaluation failure located in a template. The render is aborted and
/// no partial SQL is returned.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{source} (parameter `{parameter_path}`) at {position} in template {template}")]
pub struct RenderError {
    /// Identifier of the template being rendered
    pub template: String,
    /// Position of the failing fragment
    pub position: Position,
    /// Parameter path (or expression text) that failed
    pub parameter_path: String,
    /// Underlying evaluation error
    pub source: EvalError,
}

/// Umbrella error for the engine's convenience operations
#[derive(Debug, Error)]
pub enum DynSqlError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("unknown statement `{0}`")]
    UnknownStatement(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, DynSqlError>;
