//! dynsql command line interface
//!
//! Checks mapper documents and renders their statements without a database.
//!
//! # Usage
//!
//! ```bash
//! # Parse and compile mapper documents, reporting the first error of each
//! dynsql check mappers/*.xml
//!
//! # Render a statement with parameters from a JSON file
//! dynsql render mappers/users.xml findActive --params params.json
//!
//! # Inline parameters, PostgreSQL markers, strict property lookup
//! dynsql render mappers/users.xml users.findActive -p name='"ann%"' -p ids='[1,2]' \
//!     --marker-style dollar-numbered --strict
//!
//! # Engine events on stderr
//! RUST_LOG=dynsql_templates=debug dynsql render ...
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use dynsql_core::{EngineConfig, MarkerStyle, MissingPropertyMode, ParameterContext, Value};
use dynsql_templates::{
    DynamicSqlEngine, MapperDocument, ParseError, RenderResult, SqlFilters, StatementKind,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dynsql")]
#[command(version)]
#[command(about = "Check and render dynamic SQL mapper documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "DYNSQL_CONFIG")]
    config: Option<PathBuf>,

    /// Marker style: question-mark, dollar-numbered or colon-named
    #[arg(long, global = true)]
    marker_style: Option<MarkerStyle>,

    /// Fail on absent properties instead of treating them as null
    #[arg(long, global = true)]
    strict: bool,

    /// Database id used to pick statement variants
    #[arg(long, global = true)]
    database_id: Option<String>,

    /// Output format (check defaults to text, render to json)
    #[arg(long, short = 'o', global = true, value_enum)]
    format: Option<OutputFormat>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and compile mapper documents
    Check {
        /// Mapper documents
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Render one statement of a mapper document
    Render {
        /// Mapper document
        file: PathBuf,

        /// Statement id, local (`findActive`) or qualified (`users.findActive`)
        statement: String,

        /// JSON file holding the parameter object
        #[arg(long)]
        params: Option<PathBuf>,

        /// Single parameter as name=value; the value is parsed as JSON and
        /// falls back to a plain string
        #[arg(long = "param", short = 'p', value_name = "NAME=VALUE")]
        param: Vec<String>,
    },
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = engine_config(&cli)?;
    match cli.command {
        Command::Check { files } => cmd_check(&files, cli.format.unwrap_or(OutputFormat::Text)),
        Command::Render {
            file,
            statement,
            params,
            param,
        } => cmd_render(
            config,
            &file,
            &statement,
            params.as_deref(),
            &param,
            cli.format.unwrap_or(OutputFormat::Json),
        ),
    }
}

/// Configuration file (if any) with command line overrides applied
fn engine_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(style) = cli.marker_style {
        config = config.with_marker_style(style);
    }
    if cli.strict {
        config = config.with_missing_property(MissingPropertyMode::Strict);
    }
    if let Some(database_id) = &cli.database_id {
        config = config.with_database_id(database_id.clone());
    }
    tracing::debug!(config = ?config, "engine configuration");
    Ok(config)
}

// =============================================================================
// CHECK
// =============================================================================

#[derive(Serialize)]
struct CheckReport {
    path: String,
    ok: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    statements: Vec<StatementReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ParseError>,
}

#[derive(Serialize)]
struct StatementReport {
    id: String,
    kind: StatementKind,
    database_id: Option<String>,
    parameters: Vec<String>,
}

fn check_file(path: &Path) -> Result<CheckReport> {
    let origin = path.display().to_string();
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {origin}"))?;

    let report = match MapperDocument::parse(&origin, &text) {
        Ok(document) => CheckReport {
            path: origin,
            ok: true,
            statements: document
                .statements()
                .iter()
                .map(|s| StatementReport {
                    id: s.id.clone(),
                    kind: s.kind,
                    database_id: s.database_id.clone(),
                    parameters: s.template.parameters().iter().cloned().collect(),
                })
                .collect(),
            error: None,
        },
        Err(error) => CheckReport {
            path: origin,
            ok: false,
            statements: Vec::new(),
            error: Some(error),
        },
    };
    Ok(report)
}

fn cmd_check(files: &[PathBuf], format: OutputFormat) -> Result<ExitCode> {
    let reports = files
        .iter()
        .map(|path| check_file(path))
        .collect::<Result<Vec<_>>>()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
        OutputFormat::Text => {
            for report in &reports {
                match &report.error {
                    Some(error) => println!(
                        "{}:{}:{}: {}",
                        report.path,
                        error.position.line,
                        error.position.column,
                        error.message()
                    ),
                    None => {
                        println!("{}: ok ({} statements)", report.path, report.statements.len());
                        for statement in &report.statements {
                            let variant = statement
                                .database_id
                                .as_deref()
                                .map(|id| format!(" [{id}]"))
                                .unwrap_or_default();
                            println!(
                                "  {:<6} {}{} ({})",
                                statement.kind.as_str(),
                                statement.id,
                                variant,
                                statement.parameters.join(", ")
                            );
                        }
                    }
                }
            }
        }
    }

    let failed = reports.iter().filter(|r| !r.ok).count();
    if failed > 0 {
        tracing::debug!(failed, total = reports.len(), "mapper check failed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// RENDER
// =============================================================================

#[derive(Serialize)]
struct RenderOutput<'a> {
    statement: &'a str,
    #[serde(flatten)]
    result: &'a RenderResult,
    debug_sql: String,
}

fn load_context(params: Option<&Path>, inline: &[String]) -> Result<ParameterContext> {
    let mut ctx = match params {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let json: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            ParameterContext::from_json(json)?
        }
        None => ParameterContext::new(),
    };

    for entry in inline {
        let Some((name, raw)) = entry.split_once('=') else {
            bail!("expected NAME=VALUE, found `{entry}`");
        };
        let value = serde_json::from_str::<serde_json::Value>(raw)
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(raw));
        ctx.insert(name.trim(), value);
    }
    Ok(ctx)
}

fn cmd_render(
    config: EngineConfig,
    file: &Path,
    statement: &str,
    params: Option<&Path>,
    inline: &[String],
    format: OutputFormat,
) -> Result<ExitCode> {
    let engine = DynamicSqlEngine::new(config);
    let document = engine.load_mapper_file(file)?;

    let prefix = format!("{}.", document.namespace());
    let id = if statement.starts_with(&prefix) {
        statement.to_string()
    } else {
        format!("{prefix}{statement}")
    };

    let ctx = load_context(params, inline)?;
    let result = engine
        .render_statement(&id, &ctx)
        .with_context(|| format!("failed to render {id}"))?;

    match format {
        OutputFormat::Json => {
            let output = RenderOutput {
                statement: &id,
                result: &result,
                debug_sql: result.debug_sql(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("{}", result.sql);
            for (i, (name, value)) in result
                .parameter_names
                .iter()
                .zip(&result.bind_values)
                .enumerate()
            {
                println!("  {:>3}  {} = {}", i + 1, name, SqlFilters::literal(value));
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
