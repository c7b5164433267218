//! The `template` dialect.
//!
//! Bodies are parsed once into literal text, `${path}` placeholders and
//! `[[ ... ]]` optional sections. A section is emitted only when each of
//! its own placeholders resolves to a non-null value; nested sections are
//! decided independently.

use serde_json::Value;
use std::sync::Arc;

use super::{
    BindStyle, CompiledScript, FetchInjection, FetchPredicate, RenderContext, RenderedScript,
    ScriptRenderer, TEMPLATE_DIALECT,
};
use crate::error::{QueryError, Result};
use crate::model::{Query, Script};
use crate::types::{QueryParameter, Record};
use crate::value;

const PLACEHOLDER_OPEN: &str = "${";
const SECTION_OPEN: &str = "[[";
const SECTION_CLOSE: &str = "]]";

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Placeholder { path: String, position: usize },
    Section(Vec<Segment>),
}

struct Parser<'a> {
    source: &'a str,
    pos: usize,
    /// Added to every reported position
    base: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, base: usize) -> Self {
        Self {
            source,
            pos: 0,
            base,
        }
    }

    fn rest(&self) -> &'a str {
        &self.source[self.pos..]
    }

    /// Parse until end of input, or until `]]` when inside a section
    fn parse(&mut self, in_section: bool) -> std::result::Result<Vec<Segment>, (String, usize)> {
        let mut segments = Vec::new();
        let mut text = String::new();

        while self.pos < self.source.len() {
            let rest = self.rest();
            if rest.starts_with(PLACEHOLDER_OPEN) {
                let start = self.base + self.pos;
                let body = &rest[PLACEHOLDER_OPEN.len()..];
                let Some(end) = body.find('}') else {
                    return Err(("unterminated placeholder".to_string(), start));
                };
                let path = body[..end].trim();
                if path.is_empty() {
                    return Err(("empty placeholder".to_string(), start));
                }
                flush(&mut text, &mut segments);
                segments.push(Segment::Placeholder {
                    path: path.to_string(),
                    position: start,
                });
                self.pos += PLACEHOLDER_OPEN.len() + end + 1;
            } else if rest.starts_with(SECTION_OPEN) {
                let start = self.base + self.pos;
                self.pos += SECTION_OPEN.len();
                let inner = self.parse(true)?;
                if !self.rest().starts_with(SECTION_CLOSE) {
                    return Err(("unterminated section".to_string(), start));
                }
                self.pos += SECTION_CLOSE.len();
                flush(&mut text, &mut segments);
                segments.push(Segment::Section(inner));
            } else if in_section && rest.starts_with(SECTION_CLOSE) {
                break;
            } else {
                let ch = rest.chars().next().unwrap_or_default();
                text.push(ch);
                self.pos += ch.len_utf8().max(1);
            }
        }

        flush(&mut text, &mut segments);
        Ok(segments)
    }
}

fn flush(text: &mut String, segments: &mut Vec<Segment>) {
    if !text.is_empty() {
        segments.push(Segment::Text(std::mem::take(text)));
    }
}

/// Parse `source` with surrounding whitespace dropped; positions stay
/// relative to `source` as written
fn parse_template(query: &Query, source: &str, label: Option<&str>) -> Result<Vec<Segment>> {
    let trimmed = source.trim();
    let base = source.len() - source.trim_start().len();
    Parser::new(trimmed, base)
        .parse(false)
        .map_err(|(message, position)| {
            let message = match label {
                Some(label) => format!("{}: {}", label, message),
                None => message,
            };
            QueryError::render(query.versioned_name(), message, Some(position))
        })
}

/// A template parsed into segments
struct CompiledTemplate {
    segments: Vec<Segment>,
}

impl CompiledTemplate {
    fn render_segments(
        &self,
        segments: &[Segment],
        ctx: &RenderContext<'_>,
        out: &mut RenderedScript,
    ) -> Result<()> {
        for segment in segments {
            match segment {
                Segment::Text(text) => out.body.push_str(text),
                Segment::Placeholder { path, position } => {
                    let value = ctx.parameter.lookup(path).ok_or_else(|| {
                        QueryError::render(
                            ctx.query.versioned_name(),
                            format!("no value for placeholder '{}'", path),
                            Some(*position),
                        )
                    })?;
                    write_value(value, ctx.bind_style, out)?;
                }
                Segment::Section(inner) => {
                    if section_applies(inner, ctx.parameter) {
                        self.render_segments(inner, ctx, out)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn section_applies(segments: &[Segment], parameter: &QueryParameter) -> bool {
    segments.iter().all(|segment| match segment {
        Segment::Placeholder { path, .. } => {
            matches!(parameter.lookup(path), Some(v) if !v.is_null())
        }
        _ => true,
    })
}

fn write_value(value: Value, style: BindStyle, out: &mut RenderedScript) -> Result<()> {
    match style {
        BindStyle::Inline => {
            out.body.push_str(&serde_json::to_string(&value)?);
        }
        BindStyle::Dollar | BindStyle::Question => {
            let items = match value {
                Value::Array(items) if !items.is_empty() => items,
                Value::Array(_) => vec![Value::Null],
                other => vec![other],
            };
            let mut markers = Vec::with_capacity(items.len());
            for item in items {
                out.binds.push(item);
                markers.push(match style {
                    BindStyle::Dollar => format!("${}", out.binds.len()),
                    _ => "?".to_string(),
                });
            }
            out.body.push_str(&markers.join(", "));
        }
    }
    Ok(())
}

impl CompiledScript for CompiledTemplate {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<RenderedScript> {
        let mut out = RenderedScript::default();
        self.render_segments(&self.segments, ctx, &mut out)?;
        out.body = out.body.trim().to_string();
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Comparison {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

// Longest operators first so `>=` is not read as `>`
const OPERATORS: [(&str, Comparison); 6] = [
    ("==", Comparison::Eq),
    ("!=", Comparison::Ne),
    (">=", Comparison::Ge),
    ("<=", Comparison::Le),
    (">", Comparison::Gt),
    ("<", Comparison::Lt),
];

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Parent(String),
    Param(String),
    Context(String),
    Literal(Value),
}

impl Operand {
    fn parse(raw: &str) -> std::result::Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("missing operand".to_string());
        }
        if let Some(reference) = raw
            .strip_prefix(PLACEHOLDER_OPEN)
            .and_then(|r| r.strip_suffix('}'))
        {
            let (scope, path) = reference.trim().split_once('.').unwrap_or((reference.trim(), ""));
            if path.is_empty() {
                return Err(format!("reference '{}' has no path", raw));
            }
            return match scope {
                "parent" => Ok(Operand::Parent(path.to_string())),
                "param" => Ok(Operand::Param(path.to_string())),
                "context" => Ok(Operand::Context(path.to_string())),
                other => Err(format!("unknown reference scope '{}'", other)),
            };
        }
        Ok(Operand::Literal(
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
        ))
    }

    fn evaluate(&self, parent: &Record, parameter: &QueryParameter) -> Value {
        let found = match self {
            Operand::Parent(path) => value::resolve_in_record(parent, path),
            Operand::Param(path) => parameter.lookup(path),
            Operand::Context(path) => {
                let (head, rest) = path.split_once('.').unwrap_or((path, ""));
                parameter
                    .context
                    .get(head)
                    .and_then(|root| value::resolve_path(root, rest))
            }
            Operand::Literal(v) => Some(v.clone()),
        };
        found.unwrap_or(Value::Null)
    }
}

/// Find the first comparison operator outside references and string literals
fn split_comparison(source: &str) -> Option<(usize, &'static str, Comparison)> {
    let mut in_reference = false;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in source.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
        } else if in_reference {
            if ch == '}' {
                in_reference = false;
            }
        } else if ch == '"' {
            in_string = true;
        } else if source[i..].starts_with(PLACEHOLDER_OPEN) {
            in_reference = true;
        } else if let Some((op, cmp)) = OPERATORS
            .iter()
            .find(|(op, _)| source[i..].starts_with(*op))
        {
            return Some((i, op, *cmp));
        }
    }
    None
}

struct TemplatePredicate {
    left: Operand,
    comparison: Option<(Comparison, Operand)>,
}

impl TemplatePredicate {
    fn compile(source: &str) -> std::result::Result<Self, String> {
        match split_comparison(source) {
            Some((at, op, cmp)) => Ok(Self {
                left: Operand::parse(&source[..at])?,
                comparison: Some((cmp, Operand::parse(&source[at + op.len()..])?)),
            }),
            None => Ok(Self {
                left: Operand::parse(source)?,
                comparison: None,
            }),
        }
    }
}

impl FetchPredicate for TemplatePredicate {
    fn test(&self, parent: &Record, parameter: &QueryParameter) -> Result<bool> {
        let left = self.left.evaluate(parent, parameter);
        let Some((cmp, right)) = &self.comparison else {
            return Ok(value::is_truthy(&left));
        };
        let right = right.evaluate(parent, parameter);
        let ordering = value::compare(&left, &right);
        Ok(match cmp {
            Comparison::Eq => value::loosely_equal(&left, &right),
            Comparison::Ne => !value::loosely_equal(&left, &right),
            Comparison::Gt => ordering.is_some_and(|o| o.is_gt()),
            Comparison::Ge => ordering.is_some_and(|o| o.is_ge()),
            Comparison::Lt => ordering.is_some_and(|o| o.is_lt()),
            Comparison::Le => ordering.is_some_and(|o| o.is_le()),
        })
    }
}

/// Projects each fetched record onto a dotted path
struct ProjectionInjection {
    path: String,
}

impl FetchInjection for ProjectionInjection {
    fn apply(&self, _parent: &Record, fetched: Vec<Value>) -> Result<Vec<Value>> {
        if self.path.is_empty() {
            return Ok(fetched);
        }
        Ok(fetched
            .iter()
            .filter_map(|item| value::resolve_path(item, &self.path))
            .collect())
    }
}

/// Renderer for the `template` dialect
pub struct TemplateRenderer;

impl ScriptRenderer for TemplateRenderer {
    fn dialect(&self) -> &str {
        TEMPLATE_DIALECT
    }

    fn compile(&self, query: &Query) -> Result<Arc<dyn CompiledScript>> {
        let mut segments = Vec::new();
        if let Some(common) = query.common_segment.as_deref() {
            if !common.trim().is_empty() {
                segments.extend(parse_template(query, common, Some("common segment"))?);
                segments.push(Segment::Text("\n".to_string()));
            }
        }
        segments.extend(parse_template(query, &query.script.code, None)?);
        Ok(Arc::new(CompiledTemplate { segments }))
    }

    fn compile_predicate(&self, query: &Query, script: &Script) -> Result<Arc<dyn FetchPredicate>> {
        TemplatePredicate::compile(&script.code)
            .map(|p| Arc::new(p) as Arc<dyn FetchPredicate>)
            .map_err(|message| {
                QueryError::render(
                    query.versioned_name(),
                    format!("invalid predicate: {}", message),
                    None,
                )
            })
    }

    fn compile_injection(&self, _query: &Query, script: &Script) -> Result<Arc<dyn FetchInjection>> {
        Ok(Arc::new(ProjectionInjection {
            path: script.code.trim().to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(query: &Query, parameter: &QueryParameter, style: BindStyle) -> Result<RenderedScript> {
        let compiled = TemplateRenderer.compile(query)?;
        compiled.render(&RenderContext {
            query,
            parameter,
            bind_style: style,
        })
    }

    fn query(code: &str) -> Query {
        Query::new("orders", Script::template(code))
    }

    #[test]
    fn test_positional_binds_expand_lists() {
        let q = query("SELECT * FROM orders WHERE status = ${status} AND id IN (${ids})");
        let param = QueryParameter::new().with_criteria(json!({"status": "open", "ids": [3, 4]}));

        let rendered = render(&q, &param, BindStyle::Dollar).unwrap();
        assert_eq!(
            rendered.body,
            "SELECT * FROM orders WHERE status = $1 AND id IN ($2, $3)"
        );
        assert_eq!(rendered.binds, vec![json!("open"), json!(3), json!(4)]);

        let rendered = render(&q, &param, BindStyle::Question).unwrap();
        assert!(rendered.body.ends_with("id IN (?, ?)"));
    }

    #[test]
    fn test_inline_binds_write_json() {
        let q = query(r#"{"query": {"term": {"status": ${status}}}}"#);
        let param = QueryParameter::new().with_criteria(json!({"status": "open"}));
        let rendered = render(&q, &param, BindStyle::Inline).unwrap();
        assert_eq!(rendered.body, r#"{"query": {"term": {"status": "open"}}}"#);
        assert!(rendered.binds.is_empty());
    }

    #[test]
    fn test_optional_sections() {
        let q = query("SELECT * FROM orders WHERE 1=1[[ AND status = ${status}]][[ AND owner = ${owner}]]");
        let param = QueryParameter::new().with_criteria(json!({"status": "open", "owner": null}));
        let rendered = render(&q, &param, BindStyle::Dollar).unwrap();
        assert_eq!(rendered.body, "SELECT * FROM orders WHERE 1=1 AND status = $1");
        assert_eq!(rendered.binds, vec![json!("open")]);
    }

    #[test]
    fn test_context_fallback() {
        let q = query("SELECT * FROM orders WHERE tenant = ${tenant.code}");
        let param = QueryParameter::new().with_context("tenant", json!({"code": "acme"}));
        let rendered = render(&q, &param, BindStyle::Dollar).unwrap();
        assert_eq!(rendered.binds, vec![json!("acme")]);
    }

    #[test]
    fn test_missing_value_reports_position() {
        let q = query("SELECT * FROM orders WHERE id = ${id}");
        let err = render(&q, &QueryParameter::new(), BindStyle::Dollar).unwrap_err();
        match err {
            QueryError::Render {
                query, position, ..
            } => {
                assert_eq!(query, "orders");
                assert_eq!(position, Some(32));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unterminated_constructs_fail_compile() {
        let err = TemplateRenderer
            .compile(&query("SELECT ${id"))
            .err()
            .expect("placeholder is unterminated");
        assert!(matches!(err, QueryError::Render { position: Some(7), .. }));

        let err = TemplateRenderer
            .compile(&query("SELECT 1 [[ AND x = ${x}"))
            .err()
            .expect("section is unterminated");
        assert!(matches!(err, QueryError::Render { position: Some(9), .. }));
    }

    #[test]
    fn test_positions_refer_to_the_script_as_written() {
        let q = query("\n    SELECT *\n    FROM orders WHERE id = ${id}\n");
        let err = render(&q, &QueryParameter::new(), BindStyle::Dollar).unwrap_err();
        assert!(matches!(err, QueryError::Render { position: Some(41), .. }));

        let mut q = query("SELECT n FROM base");
        q.common_segment = Some("\n  WITH base AS (SELECT ${n".into());
        match TemplateRenderer.compile(&q).err().expect("common segment is unterminated") {
            QueryError::Render {
                message, position, ..
            } => {
                assert_eq!(position, Some(24));
                assert!(message.starts_with("common segment"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_stray_section_close_is_text() {
        let q = query("SELECT ']]'");
        let rendered = render(&q, &QueryParameter::new(), BindStyle::Dollar).unwrap();
        assert_eq!(rendered.body, "SELECT ']]'");
    }

    #[test]
    fn test_common_segment_is_prepended() {
        let mut q = query("SELECT * FROM base");
        q.common_segment = Some("WITH base AS (SELECT ${n} AS n)".into());
        let param = QueryParameter::new().with_criteria(json!({"n": 1}));
        let rendered = render(&q, &param, BindStyle::Dollar).unwrap();
        assert_eq!(
            rendered.body,
            "WITH base AS (SELECT $1 AS n)\nSELECT * FROM base"
        );
    }

    #[test]
    fn test_predicates() {
        let q = query("x");
        let mut parent = Record::new();
        parent.insert("customerId".into(), json!(7));
        parent.insert("status".into(), json!("open"));
        let param = QueryParameter::new()
            .with_criteria(json!({"min": 5}))
            .with_context("expand", json!(true));

        let check = |code: &str| {
            TemplateRenderer
                .compile_predicate(&q, &Script::template(code))
                .unwrap()
                .test(&parent, &param)
                .unwrap()
        };

        assert!(check("${parent.customerId} >= ${param.min}"));
        assert!(check("${parent.status} == open"));
        assert!(check(r#"${parent.status} != "closed""#));
        assert!(!check("${parent.customerId} < 7"));
        assert!(check("${context.expand}"));
        assert!(!check("${parent.missing}"));
    }

    #[test]
    fn test_invalid_predicate() {
        let q = query("x");
        let err = TemplateRenderer
            .compile_predicate(&q, &Script::template("${row.id} == 1"))
            .err()
            .expect("scope is unknown");
        assert!(matches!(err, QueryError::Render { .. }));
    }

    #[test]
    fn test_projection_injection() {
        let q = query("x");
        let injection = TemplateRenderer
            .compile_injection(&q, &Script::template("address.city"))
            .unwrap();
        let fetched = vec![
            json!({"address": {"city": "Oslo"}}),
            json!({"address": {}}),
            json!({"address": {"city": "Bergen"}}),
        ];
        assert_eq!(
            injection.apply(&Record::new(), fetched).unwrap(),
            vec![json!("Oslo"), json!("Bergen")]
        );
    }
}
