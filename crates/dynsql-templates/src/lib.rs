//! dynsql Templates - Dynamic SQL templates with bind parameters
//!
//! Templates are SQL text with XML-like directives and parameter
//! placeholders. Rendering a template against a parameter context yields a
//! SQL statement with bind markers plus the ordered bind values; parameter
//! values never end up in the SQL text unless the `${..}` form asks for it.
//!
//! ## Features
//!
//! - **Directives**: `<if>`, `<choose>`/`<when>`/`<otherwise>`, `<foreach>`,
//!   `<trim>`, `<where>`, `<set>`, `<bind>`
//! - **Placeholders**: `#{path}` (bound) and `${path}` (raw text)
//! - **SQL functions**: `#{join(ids)}` and `#{to_date(day)}` rewritten per
//!   database id, with room for custom transforms
//! - **Expressions**: comparisons, boolean logic, arithmetic and a fixed set
//!   of functions such as `isEmpty()`, `size()` and `contains()`
//! - **Marker styles**: `?`, `$1..$n` or `:name`
//! - **Mapper documents**: named statements with reusable `<sql>` fragments
//!   and per-database variants
//! - **Compile cache**: single-flight compilation keyed by template identity
//!
//! ## Example
//!
//! ```rust,ignore
//! use dynsql_core::{EngineConfig, ParameterContext};
//! use dynsql_templates::DynamicSqlEngine;
//!
//! let engine = DynamicSqlEngine::new(EngineConfig::default());
//! let ctx = ParameterContext::new()
//!     .with("status", "active")
//!     .with("ids", vec![1, 2, 3]);
//!
//! let result = engine.render_source(r#"
//!     SELECT * FROM users
//!     <where>
//!       <if test="status != null">AND status = #{status}</if>
//!       <if test="!ids.isEmpty()">
//!         AND id IN <foreach collection="ids" item="id" open="(" separator="," close=")">#{id}</foreach>
//!       </if>
//!     </where>
//! "#, &ctx)?;
//!
//! // SELECT * FROM users WHERE status = ? AND id IN (?,?,?)
//! println!("{}", result.sql);
//! ```
//!
//! ## Mappers
//!
//! ```rust,ignore
//! engine.load_mapper_file("mappers/users.xml")?;
//! let result = engine.render_statement("users.findActive", &ctx)?;
//! ```

mod cache;
mod compiler;
mod engine;
mod error;
pub mod expr;
mod filters;
mod fragment;
mod functions;
mod lexer;
mod mapper;
pub mod markers;
mod parser;
mod renderer;
mod source;

pub use cache::{CacheStats, TemplateCache};
pub use compiler::{CompiledTemplate, compile};
pub use engine::DynamicSqlEngine;
pub use error::{DynSqlError, EvalError, ParseError, ParseErrorKind, RenderError, Result};
pub use expr::Expression;
pub use filters::SqlFilters;
pub use fragment::{Foreach, Fragment, Placeholder, PlaceholderKind, Trim, WhenBranch, parse_overrides};
pub use functions::{
    JoinTransform, SqlFunctionArg, SqlFunctionCall, SqlFunctionRegistry, SqlFunctionTransform,
    SqlTerm, ToDateTransform,
};
pub use mapper::{MapperDocument, MapperStatement, StatementKind};
pub use parser::parse;
pub use renderer::{RenderResult, render, render_with_functions};
pub use source::{Position, TemplateId, TemplateSource, content_hash};

#[cfg(test)]
mod tests;
