//! Engine facade: configuration, template cache and loaded mappers

use dynsql_core::{EngineConfig, ParameterContext};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::cache::{CacheStats, TemplateCache};
use crate::compiler::CompiledTemplate;
use crate::error::{DynSqlError, ParseError, RenderError, Result};
use crate::functions::{SqlFunctionRegistry, SqlFunctionTransform};
use crate::mapper::{MapperDocument, MapperStatement};
use crate::renderer::{RenderResult, render_with_functions};
use crate::source::TemplateSource;

/// Dynamic SQL engine.
///
/// Holds no global state; create one per configuration and share it (it is
/// `Send + Sync`).
///
/// ```rust,ignore
/// use dynsql_core::{EngineConfig, ParameterContext};
/// use dynsql_templates::DynamicSqlEngine;
///
/// let engine = DynamicSqlEngine::new(EngineConfig::default());
/// let ctx = ParameterContext::new().with("id", 7);
/// let result = engine.render_source("SELECT * FROM users WHERE id = #{id}", &ctx)?;
/// assert_eq!(result.sql, "SELECT * FROM users WHERE id = ?");
/// ```
pub struct DynamicSqlEngine {
    config: EngineConfig,
    cache: TemplateCache,
    functions: SqlFunctionRegistry,
    mappers: RwLock<HashMap<String, Arc<MapperDocument>>>,
}

impl DynamicSqlEngine {
    pub fn new(config: EngineConfig) -> Self {
        let cache = TemplateCache::with_capacity(config.cache.max_entries);
        Self {
            config,
            cache,
            functions: SqlFunctionRegistry::with_builtins(),
            mappers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// SQL function transforms applied to `#{fn(..)}` placeholders
    pub fn functions(&self) -> &SqlFunctionRegistry {
        &self.functions
    }

    /// Add a SQL function transform. Returns `false` when one of the same
    /// type is already registered for the function name.
    pub fn register_function<T: SqlFunctionTransform + 'static>(&mut self, transform: T) -> bool {
        let name = transform.name().to_string();
        let added = self.functions.register(transform);
        tracing::debug!(function = %name, added, "registered sql function transform");
        added
    }

    /// Compiled form of `source`, from the cache when possible
    pub fn compile_or_get(
        &self,
        source: &TemplateSource,
    ) -> std::result::Result<Arc<CompiledTemplate>, ParseError> {
        self.cache.get_or_compile(source)
    }

    /// Render a compiled template with the engine's configuration
    pub fn render(
        &self,
        template: &CompiledTemplate,
        ctx: &ParameterContext,
    ) -> std::result::Result<RenderResult, RenderError> {
        let result = render_with_functions(template, ctx, &self.config, &self.functions)?;
        tracing::debug!(
            template = %template.id(),
            sql = %result.sql,
            binds = result.bind_values.len(),
            "rendered template"
        );
        tracing::trace!(
            template = %template.id(),
            debug_sql = %result.debug_sql(),
            "rendered template with inlined values"
        );
        Ok(result)
    }

    /// Compile (or fetch) and render raw template text
    pub fn render_source(&self, text: &str, ctx: &ParameterContext) -> Result<RenderResult> {
        let template = self.compile_or_get(&TemplateSource::new(text))?;
        Ok(self.render(&template, ctx)?)
    }

    /// Parse a mapper document and register its statements, replacing any
    /// mapper previously loaded under the same namespace
    pub fn load_mapper(
        &self,
        origin: &str,
        text: &str,
    ) -> std::result::Result<Arc<MapperDocument>, ParseError> {
        let document = Arc::new(MapperDocument::parse(origin, text)?);
        let replaced = self
            .mappers
            .write()
            .insert(document.namespace().to_string(), document.clone());
        tracing::info!(
            namespace = document.namespace(),
            origin,
            statements = document.statements().len(),
            replaced = replaced.is_some(),
            "loaded mapper"
        );
        Ok(document)
    }

    /// Read and load a mapper document from disk
    pub fn load_mapper_file(&self, path: impl AsRef<Path>) -> Result<Arc<MapperDocument>> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DynSqlError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(self.load_mapper(&path.display().to_string(), &text)?)
    }

    /// Find a loaded statement by qualified id (`namespace.id`), preferring
    /// the variant for `database_id`
    pub fn statement(&self, id: &str, database_id: Option<&str>) -> Option<Arc<MapperStatement>> {
        let (namespace, _) = id.rsplit_once('.')?;
        let mappers = self.mappers.read();
        mappers
            .get(namespace)?
            .statement(id, database_id)
            .cloned()
    }

    /// Qualified ids of all loaded statements, sorted
    pub fn statement_ids(&self) -> Vec<String> {
        let mappers = self.mappers.read();
        let mut ids: Vec<String> = mappers
            .values()
            .flat_map(|doc| doc.statements().iter().map(|s| s.id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Render a loaded statement, selecting the variant for the configured
    /// database id
    pub fn render_statement(&self, id: &str, ctx: &ParameterContext) -> Result<RenderResult> {
        let statement = self
            .statement(id, self.config.database_id.as_deref())
            .ok_or_else(|| DynSqlError::UnknownStatement(id.to_string()))?;
        Ok(self.render(&statement.template, ctx)?)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl Default for DynamicSqlEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynsql_core::{MarkerStyle, Value};
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const ORDERS: &str = indoc! {r#"
        <mapper namespace="shop.orders">
          <select id="byStatus">
            SELECT * FROM orders
            <where>
              <if test="status != null">status = #{status}</if>
            </where>
          </select>
          <select id="latest" databaseId="mssql">SELECT TOP (#{n}) * FROM orders</select>
          <select id="latest">SELECT * FROM orders LIMIT #{n}</select>
        </mapper>
    "#};

    #[test]
    fn test_render_source_uses_cache() {
        let engine = DynamicSqlEngine::default();
        let ctx = ParameterContext::new().with("id", 3);

        let first = engine
            .render_source("SELECT * FROM t WHERE id = #{id}", &ctx)
            .unwrap();
        let second = engine
            .render_source("SELECT * FROM t WHERE id = #{id}", &ctx)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.bind_values, vec![Value::Int(3)]);
        let stats = engine.cache_stats();
        assert_eq!((stats.misses, stats.hits), (1, 1));
    }

    #[test]
    fn test_render_source_errors() {
        let engine = DynamicSqlEngine::default();
        let err = engine
            .render_source("<if test=\"a\">", &ParameterContext::new())
            .unwrap_err();
        assert!(matches!(err, DynSqlError::Parse(_)));

        let err = engine
            .render_source("${list}", &ParameterContext::new().with("list", vec![1, 2]))
            .unwrap_err();
        assert!(matches!(err, DynSqlError::Render(_)));
    }

    #[test]
    fn test_render_statement() {
        let engine = DynamicSqlEngine::new(
            EngineConfig::default().with_marker_style(MarkerStyle::DollarNumbered),
        );
        engine.load_mapper("orders.xml", ORDERS).unwrap();

        let result = engine
            .render_statement(
                "shop.orders.byStatus",
                &ParameterContext::new().with("status", "open"),
            )
            .unwrap();
        assert_eq!(result.sql, "SELECT * FROM orders\n    WHERE status = $1");

        let result = engine
            .render_statement("shop.orders.byStatus", &ParameterContext::new())
            .unwrap();
        assert_eq!(result.sql.trim_end(), "SELECT * FROM orders");
        assert!(result.bind_values.is_empty());
    }

    #[test]
    fn test_render_statement_selects_database_variant() {
        let ctx = ParameterContext::new().with("n", 5);

        let engine = DynamicSqlEngine::new(EngineConfig::default().with_database_id("mssql"));
        engine.load_mapper("orders.xml", ORDERS).unwrap();
        assert_eq!(
            engine.render_statement("shop.orders.latest", &ctx).unwrap().sql,
            "SELECT TOP (?) * FROM orders"
        );

        let engine = DynamicSqlEngine::new(EngineConfig::default().with_database_id("sqlite"));
        engine.load_mapper("orders.xml", ORDERS).unwrap();
        assert_eq!(
            engine.render_statement("shop.orders.latest", &ctx).unwrap().sql,
            "SELECT * FROM orders LIMIT ?"
        );
    }

    #[test]
    fn test_unknown_statement() {
        let engine = DynamicSqlEngine::default();
        engine.load_mapper("orders.xml", ORDERS).unwrap();

        for id in ["shop.orders.missing", "other.byStatus", "noNamespace"] {
            let err = engine
                .render_statement(id, &ParameterContext::new())
                .unwrap_err();
            assert!(matches!(err, DynSqlError::UnknownStatement(ref s) if s == id));
        }
    }

    #[test]
    fn test_reload_replaces_namespace() {
        let engine = DynamicSqlEngine::default();
        engine.load_mapper("orders.xml", ORDERS).unwrap();
        engine
            .load_mapper(
                "orders.xml",
                r#"<mapper namespace="shop.orders"><select id="count">SELECT COUNT(*) FROM orders</select></mapper>"#,
            )
            .unwrap();

        assert_eq!(engine.statement_ids(), vec!["shop.orders.count".to_string()]);
        assert!(engine.statement("shop.orders.byStatus", None).is_none());
    }

    #[test]
    fn test_statement_functions_follow_database_id() {
        struct Nvl;
        impl SqlFunctionTransform for Nvl {
            fn name(&self) -> &str {
                "ifnull"
            }
            fn supports(&self, database_id: Option<&str>) -> bool {
                database_id == Some("oracle")
            }
            fn transform(
                &self,
                _: Option<&str>,
                args: Vec<crate::functions::SqlTerm>,
            ) -> std::result::Result<crate::functions::SqlTerm, crate::error::EvalError> {
                Ok(crate::functions::SqlTerm::call("nvl", args))
            }
        }

        let mapper = r#"<mapper namespace="audit">
          <select id="since">SELECT * FROM log WHERE at >= #{to_date(since)} AND kind = #{ifnull(kind, 'all')}</select>
        </mapper>"#;
        let ctx = ParameterContext::new().with("since", "2024-01-01 00:00:00");

        let mut engine = DynamicSqlEngine::new(EngineConfig::default().with_database_id("oracle"));
        assert!(engine.register_function(Nvl));
        assert!(!engine.register_function(Nvl));
        assert_eq!(engine.functions().names(), vec!["ifnull", "join", "to_date"]);
        engine.load_mapper("audit.xml", mapper).unwrap();
        let result = engine.render_statement("audit.since", &ctx).unwrap();
        assert_eq!(
            result.sql,
            "SELECT * FROM log WHERE at >= to_date(?, 'YYYY-MM-DD HH24:MI:SS') AND kind = nvl(?, 'all')"
        );
        assert_eq!(result.parameter_names, vec!["since", "kind"]);
        assert_eq!(result.bind_values[1], Value::Null);
    }

    #[test]
    fn test_load_mapper_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ORDERS.as_bytes()).unwrap();

        let engine = DynamicSqlEngine::default();
        let document = engine.load_mapper_file(file.path()).unwrap();
        assert_eq!(document.namespace(), "shop.orders");
        assert_eq!(
            engine.statement_ids(),
            vec![
                "shop.orders.byStatus".to_string(),
                "shop.orders.latest".to_string()
            ]
        );

        let err = engine
            .load_mapper_file(file.path().with_extension("missing"))
            .unwrap_err();
        assert!(matches!(err, DynSqlError::Io { .. }));
    }
}
