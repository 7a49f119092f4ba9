//! End-to-end tests through the engine

use crate::markers::count_markers;
use crate::{
    DynSqlError, DynamicSqlEngine, EvalError, ParseErrorKind, RenderResult, TemplateSource,
};
use chrono::NaiveDate;
use dynsql_core::{EngineConfig, MarkerStyle, MissingPropertyMode, ParameterContext, Value};
use indoc::indoc;
use pretty_assertions::assert_eq;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Barrier};
use std::thread;

const STYLES: [MarkerStyle; 3] = [
    MarkerStyle::QuestionMark,
    MarkerStyle::DollarNumbered,
    MarkerStyle::ColonNamed,
];

fn ctx(params: serde_json::Value) -> ParameterContext {
    ParameterContext::from_json(params).unwrap()
}

fn render(text: &str, params: serde_json::Value) -> RenderResult {
    DynamicSqlEngine::default()
        .render_source(text, &ctx(params))
        .unwrap()
}

const SEARCH: &str = indoc! {r#"
    SELECT id, name, '?' AS literal, payload::jsonb
    FROM users
    <where>
      <if test="name != null and name != ''">AND name LIKE #{name}</if>
      <if test="!ids.isEmpty()">
        AND id IN <foreach collection="ids" item="id" open="(" separator=", " close=")">#{id}</foreach>
      </if>
      <choose>
        <when test="role == 'admin'">AND role = #{role}</when>
        <when test="role != null">AND role IN (#{role}, 'guest')</when>
        <otherwise>AND role IS NULL</otherwise>
      </choose>
    </where>
    ORDER BY ${order} LIMIT #{limit}"#};

#[test]
fn test_bind_values_align_with_markers() {
    let contexts = [
        json!({"name": "a%", "ids": [1, 2, 3], "role": "admin", "order": "id", "limit": 10}),
        json!({"name": "", "ids": [], "role": "user", "order": "name", "limit": 5}),
        json!({"ids": [7], "order": "id DESC", "limit": 1}),
    ];

    for style in STYLES {
        let engine = DynamicSqlEngine::new(EngineConfig::default().with_marker_style(style));
        for params in &contexts {
            let result = engine.render_source(SEARCH, &ctx(params.clone())).unwrap();
            assert_eq!(
                count_markers(&result.sql, style),
                result.bind_values.len(),
                "{style}: {}",
                result.sql
            );
            assert_eq!(result.marker_count(), result.bind_values.len());
            assert_eq!(result.parameter_names.len(), result.bind_values.len());
        }
    }
}

#[test]
fn test_search_renders_expected_sql() {
    let result = render(
        SEARCH,
        json!({"name": "a%", "ids": [1, 2], "role": "user", "order": "id", "limit": 10}),
    );
    assert_eq!(
        result.sql,
        concat!(
            "SELECT id, name, '?' AS literal, payload::jsonb\n",
            "FROM users\n",
            "WHERE name LIKE ?\n",
            "  \n",
            "    AND id IN (?, ?)\n",
            "  \n",
            "  AND role IN (?, 'guest')\n",
            "ORDER BY id LIMIT ?",
        )
    );
    assert_eq!(
        result.bind_values,
        vec![
            Value::from("a%"),
            Value::Int(1),
            Value::Int(2),
            Value::from("user"),
            Value::Int(10)
        ]
    );
}

#[test]
fn test_rendering_is_deterministic() {
    let params = json!({"name": "x", "ids": [3, 1, 2], "role": null, "order": "id", "limit": 3});
    for style in STYLES {
        let engine = DynamicSqlEngine::new(EngineConfig::default().with_marker_style(style));
        let first = engine.render_source(SEARCH, &ctx(params.clone())).unwrap();
        let second = engine.render_source(SEARCH, &ctx(params.clone())).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.marker_ranges, second.marker_ranges);
    }
}

#[test]
fn test_concurrent_compiles_coalesce() {
    let engine = Arc::new(DynamicSqlEngine::default());
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine
                    .compile_or_get(&TemplateSource::new(SEARCH))
                    .unwrap()
            })
        })
        .collect();

    let templates: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(templates.iter().all(|t| Arc::ptr_eq(t, &templates[0])));

    let stats = engine.cache_stats();
    assert_eq!(stats.compilations, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 15);
}

#[test]
fn test_foreach_empty_and_filled() {
    let template =
        r#"<foreach collection="ids" item="id" open="(" separator="," close=")">#{id}</foreach>"#;

    let result = render(template, json!({"ids": []}));
    assert_eq!(result.sql, "");
    assert!(result.bind_values.is_empty());

    let result = render(template, json!({"ids": [1, 2, 3]}));
    assert_eq!(result.sql, "(?,?,?)");
    assert_eq!(
        result.bind_values,
        vec![Value::Int(1), Value::Int(2), Value::Int(3)]
    );
}

#[test]
fn test_trim_prefix_override() {
    let result = render(r#"<trim prefixOverrides="AND |OR ">AND x=#{x}</trim>"#, json!({"x": 5}));
    assert_eq!(result.sql, "x=?");
    assert_eq!(result.bind_values, vec![Value::Int(5)]);
}

#[test]
fn test_is_empty_truthiness() {
    let template = r#"<if test="list.isEmpty()">A</if><if test="!list.isEmpty()">B</if>"#;
    assert_eq!(render(template, json!({"list": []})).sql, "A");
    assert_eq!(render(template, json!({"list": [1]})).sql, "B");
}

#[test]
fn test_missing_property_modes() {
    let template = "SELECT * FROM t WHERE city = #{user.address.city}";
    let params = json!({"user": {"name": "Ann"}});

    let result = render(template, params.clone());
    assert_eq!(result.bind_values, vec![Value::Null]);

    let engine = DynamicSqlEngine::new(
        EngineConfig::default().with_missing_property(MissingPropertyMode::Strict),
    );
    let err = engine.render_source(template, &ctx(params)).unwrap_err();
    let DynSqlError::Render(err) = err else {
        panic!("expected a render error");
    };
    assert_eq!(
        err.source,
        EvalError::PropertyNotFound {
            path: "user.address".into()
        }
    );
    assert_eq!(err.parameter_path, "user.address.city");
    assert_eq!(err.position.column, 30);
}

#[test]
fn test_unterminated_if_points_at_opening_tag() {
    let err = DynamicSqlEngine::default()
        .render_source("SELECT *\nFROM t\n  <if test=\"a\">WHERE a = 1", &ParameterContext::new())
        .unwrap_err();
    let DynSqlError::Parse(err) = err else {
        panic!("expected a parse error");
    };
    assert_eq!(err.kind, ParseErrorKind::UnterminatedTag { tag: "if".into() });
    assert_eq!((err.position.line, err.position.column), (3, 3));
}

#[test]
fn test_named_markers_and_parameter_map() {
    let engine = DynamicSqlEngine::new(
        EngineConfig::default().with_marker_style(MarkerStyle::ColonNamed),
    );
    let result = engine
        .render_source(
            "SELECT * FROM t WHERE a = #{a} OR a = #{a} AND b = #{user.name}",
            &ctx(json!({"a": 1, "user": {"name": "Zoe"}})),
        )
        .unwrap();

    assert_eq!(
        result.sql,
        "SELECT * FROM t WHERE a = :a OR a = :a_2 AND b = :user_name"
    );
    let map = result.parameter_map();
    assert_eq!(
        map.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["a", "a_2", "user_name"]
    );
    assert_eq!(map["user_name"], Value::from("Zoe"));
}

#[test]
fn test_date_strings_compare_with_dates() {
    let template = r#"SELECT * FROM t<where><if test="since >= '2024-01-01'">created >= #{since}</if></where>"#;
    let engine = DynamicSqlEngine::default();

    let recent = ParameterContext::new().with("since", NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    let result = engine.render_source(template, &recent).unwrap();
    assert_eq!(result.sql, "SELECT * FROM t WHERE created >= ?");
    assert_eq!(result.debug_sql(), "SELECT * FROM t WHERE created >= '2024-03-01'");

    let old = ParameterContext::new().with("since", NaiveDate::from_ymd_opt(2023, 3, 1).unwrap());
    assert_eq!(engine.render_source(template, &old).unwrap().sql, "SELECT * FROM t");
}

#[test]
fn test_context_from_serializable_struct() {
    #[derive(Serialize)]
    struct Filter {
        name: Option<String>,
        tags: Vec<&'static str>,
    }

    let template = indoc! {r#"
        SELECT * FROM posts
        <where>
          <if test="name != null">AND author = #{name}</if>
          <if test="tags.size() > 0">AND tag IN <foreach collection="tags" item="t" open="(" separator="," close=")">#{t}</foreach></if>
        </where>"#};

    let ctx = ParameterContext::from_serialize(&Filter {
        name: None,
        tags: vec!["rust", "sql"],
    })
    .unwrap();
    let result = DynamicSqlEngine::default().render_source(template, &ctx).unwrap();
    assert_eq!(result.sql, "SELECT * FROM posts\nWHERE tag IN (?,?)");
    assert_eq!(result.bind_values, vec![Value::from("rust"), Value::from("sql")]);
}

#[test]
fn test_mapper_fragments_inside_directives() {
    let engine = DynamicSqlEngine::default();
    engine
        .load_mapper(
            "people.xml",
            indoc! {r#"
                <mapper namespace="people">
                  <sql id="byName">name = #{item}</sql>
                  <select id="anyName">
                    SELECT * FROM people
                    <where>
                      <foreach collection="names" item="item" separator=" OR "><include refid="byName"/></foreach>
                    </where>
                  </select>
                </mapper>
            "#},
        )
        .unwrap();

    let result = engine
        .render_statement("people.anyName", &ctx(json!({"names": ["a", "b"]})))
        .unwrap();
    assert_eq!(
        result.sql,
        "SELECT * FROM people\n    WHERE name = ? OR name = ?"
    );
    assert_eq!(result.parameter_names, vec!["item", "item_2"]);
}

#[test]
fn test_mapper_database_id_parameter() {
    let mapper = indoc! {r#"
        <mapper namespace="ids">
          <insert id="create">
            INSERT INTO t (id) VALUES (
            <choose>
              <when test="_databaseId == 'postgresql'">nextval('t_seq')</when>
              <otherwise>NULL</otherwise>
            </choose>)
          </insert>
        </mapper>
    "#};

    let engine = DynamicSqlEngine::new(EngineConfig::default().with_database_id("postgresql"));
    engine.load_mapper("ids.xml", mapper).unwrap();
    let sql = engine
        .render_statement("ids.create", &ParameterContext::new())
        .unwrap()
        .sql;
    assert!(sql.contains("nextval('t_seq')"), "{sql}");

    let engine = DynamicSqlEngine::default();
    engine.load_mapper("ids.xml", mapper).unwrap();
    let sql = engine
        .render_statement("ids.create", &ParameterContext::new())
        .unwrap()
        .sql;
    assert!(sql.contains("NULL"), "{sql}");
}

#[test]
fn test_multibyte_text_around_ampersands() {
    let result = render(
        "SELECT * FROM notes WHERE tag = 'R&中文' AND body LIKE #{pattern} -- 备注&说明",
        json!({"pattern": "%中%"}),
    );
    assert_eq!(
        result.sql,
        "SELECT * FROM notes WHERE tag = 'R&中文' AND body LIKE ? -- 备注&说明"
    );
    assert_eq!(result.bind_values, vec![Value::from("%中%")]);
}

#[test]
fn test_sql_functions_keep_markers_aligned() {
    let template = indoc! {r#"
        SELECT * FROM events
        <where>
          <if test="!ids.isEmpty()">AND id IN (#{join(ids)})</if>
          <if test="since != null">AND at >= #{to_date(since)}</if>
          AND kind = #{kind}
        </where>"#};
    let params = json!({"ids": [4, 5, 6], "since": "2024-05-01 08:00:00", "kind": "x"});

    for style in STYLES {
        let engine = DynamicSqlEngine::new(
            EngineConfig::default()
                .with_marker_style(style)
                .with_database_id("postgresql"),
        );
        let result = engine.render_source(template, &ctx(params.clone())).unwrap();
        assert_eq!(count_markers(&result.sql, style), 5, "{}", result.sql);
        assert_eq!(result.bind_values.len(), 5);
        assert_eq!(result.parameter_names, vec!["ids_0", "ids_1", "ids_2", "since", "kind"]);
        assert!(
            result.sql.contains("to_timestamp("),
            "{}",
            result.sql
        );
    }

    let result = render(template, params);
    assert!(result.sql.contains("AND id IN (?, ?, ?)"), "{}", result.sql);
    assert!(result.sql.contains("AND at >= to_date(?)"), "{}", result.sql);
}
