use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;
use tracing::debug;

/// Characters the expression lexer refuses inside a fragment. Braces
/// collide with the template delimiters, the rest have no meaning in
/// the dialect.
const ILLEGAL_CHARS: &[char] = &['{', '}', ';', '`', '@', '~', '\\'];

lazy_static! {
    /// Matches a single expression fragment in either delimiter style.
    static ref FRAGMENT_RE: Regex = Regex::new(r"(?s)<%.*?%>|\{\{.*?\}\}").unwrap();
    static ref CTX_EMPTY_RE: Regex = Regex::new(r"\bctx\(\s*\)").unwrap();
    static ref CTX_NAMED_RE: Regex =
        Regex::new(r#"\bctx\(\s*"?([A-Za-z_][A-Za-z0-9_]*)"?\s*\)"#).unwrap();
    static ref TASK_STATE_RE: Regex =
        Regex::new(r#"\btask_state\(\s*"?([A-Za-z0-9_.-]+)"?\s*\)"#).unwrap();
    static ref SUCCEEDED_RE: Regex = Regex::new(r"\bsucceeded\(\s*\)").unwrap();
    static ref FAILED_RE: Regex = Regex::new(r"\bfailed\(\s*\)").unwrap();
    static ref COMPLETED_RE: Regex = Regex::new(r"\bcompleted\(\s*\)").unwrap();
    static ref ITEM_EMPTY_RE: Regex = Regex::new(r"\bitem\(\s*\)").unwrap();
    static ref ITEM_NAMED_RE: Regex =
        Regex::new(r#"\bitem\(\s*"?([A-Za-z_][A-Za-z0-9_]*)"?\s*\)"#).unwrap();
    static ref RESULT_RE: Regex = Regex::new(r"\bresult\(\s*\)").unwrap();
    static ref TASK_SCOPE_FN_RE: Regex =
        Regex::new(r"\b(succeeded|failed|completed|result)\s*\(").unwrap();
    static ref ITEM_SCOPE_FN_RE: Regex = Regex::new(r"\bitem\s*\(").unwrap();
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Expression evaluation error: {message} in expression `{expression}`"))]
    Evaluation { expression: String, message: String },

    #[snafu(display("{message}"))]
    ContextValue { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One entry in a validation report, in document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    #[serde(rename = "type")]
    pub expression_type: String,
    pub expression: String,
    pub message: String,
}

impl ValidationError {
    fn new(expression: &str, message: String) -> Self {
        Self {
            expression_type: "jq".to_string(),
            expression: expression.to_string(),
            message,
        }
    }
}

/// Which conductor-provided functions are callable while rendering.
/// Inputs are rendered before the task has a status of its own, so
/// the task- and item-scoped functions are not always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderScope {
    pub current_task: bool,
    pub item: bool,
}

impl RenderScope {
    #[must_use]
    pub fn with_current_task() -> Self {
        Self { current_task: true, item: false }
    }

    #[must_use]
    pub fn with_item(mut self, item: bool) -> Self {
        self.item = item;
        self
    }
}

/// Recursively checks whether `value` contains at least one
/// expression fragment, descending through mappings (keys included)
/// and sequences.
#[must_use]
pub fn has_expression(value: &Value) -> bool {
    match value {
        Value::String(s) => FRAGMENT_RE.is_match(s),
        Value::Array(items) => items.iter().any(has_expression),
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| FRAGMENT_RE.is_match(k) || has_expression(v)),
        _ => false,
    }
}

/// Statically validates every expression fragment in `value`,
/// depth-first with mapping keys before values, and returns one entry
/// per bad fragment in document order. An empty result means the
/// value is clean.
#[must_use]
pub fn validate(value: &Value) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    validate_value(value, &mut errors);
    errors
}

fn validate_value(value: &Value, errors: &mut Vec<ValidationError>) {
    match value {
        Value::String(s) => validate_str(s, errors),
        Value::Array(items) => {
            for item in items {
                validate_value(item, errors);
            }
        }
        Value::Object(map) => {
            for (key, val) in map {
                validate_str(key, errors);
                validate_value(val, errors);
            }
        }
        _ => {}
    }
}

fn validate_str(s: &str, errors: &mut Vec<ValidationError>) {
    for fragment in FRAGMENT_RE.find_iter(s) {
        let body = fragment_body(fragment.as_str());
        if let Err(message) = check_fragment(body) {
            errors.push(ValidationError::new(body, message));
        }
    }
}

/// Checks one fragment body for lexical and parse problems without
/// evaluating it. Returns the error message on failure.
fn check_fragment(body: &str) -> std::result::Result<(), String> {
    if body.contains("<%") || body.contains("{{") {
        return Err("Parse error: nested expression delimiters.".to_string());
    }

    let mut in_string: Option<char> = None;
    for ch in body.chars() {
        match in_string {
            Some(quote) => {
                if ch == quote {
                    in_string = None;
                }
            }
            None => {
                if ch == '\'' || ch == '"' {
                    in_string = Some(ch);
                } else if ILLEGAL_CHARS.contains(&ch) {
                    return Err(format!("Lexical error: illegal character `{ch}` in expression."));
                }
            }
        }
    }

    if in_string.is_some() {
        return Err("Lexical error: unterminated string literal.".to_string());
    }

    let prepared = preprocess(body);
    compile_check(&prepared).map_err(|message| format!("Parse error: {message}"))
}

/// Recursively replaces expression fragments in `value` with their
/// evaluated results. Non-string leaves are preserved verbatim, and a
/// string that consists of a single fragment yields the raw evaluated
/// value rather than its string form.
pub fn evaluate(value: &Value, ctx: &Value) -> Result<Value> {
    match value {
        Value::String(s) => evaluate_str(s, ctx),
        Value::Object(map) => {
            let mut result = serde_json::Map::new();
            for (k, v) in map {
                let key = match evaluate_str(k, ctx)? {
                    Value::String(rendered) => rendered,
                    other => value_to_display(&other),
                };
                result.insert(key, evaluate(v, ctx)?);
            }
            Ok(Value::Object(result))
        }
        Value::Array(items) => {
            let mut result = Vec::with_capacity(items.len());
            for item in items {
                result.push(evaluate(item, ctx)?);
            }
            Ok(Value::Array(result))
        }
        other => Ok(other.clone()),
    }
}

/// Evaluates all fragments within a single string.
pub fn evaluate_str(s: &str, ctx: &Value) -> Result<Value> {
    let trimmed = s.trim();
    match FRAGMENT_RE.find(trimmed) {
        None => return Ok(Value::String(s.to_string())),
        Some(fragment) => {
            if fragment.start() == 0 && fragment.end() == trimmed.len() {
                return evaluate_fragment(fragment_body(fragment.as_str()), ctx);
            }
        }
    }

    let mut rendered = String::new();
    let mut last = 0;
    for fragment in FRAGMENT_RE.find_iter(s) {
        rendered.push_str(&s[last..fragment.start()]);
        let value = evaluate_fragment(fragment_body(fragment.as_str()), ctx)?;
        rendered.push_str(&value_to_display(&value));
        last = fragment.end();
    }
    rendered.push_str(&s[last..]);

    Ok(Value::String(rendered))
}

/// Rejects expressions that call task- or item-scoped functions when
/// the render context cannot provide them.
pub fn check_scope(value: &Value, scope: RenderScope) -> Result<()> {
    match value {
        Value::String(s) => {
            for fragment in FRAGMENT_RE.find_iter(s) {
                let body = fragment_body(fragment.as_str());
                if !scope.current_task && TASK_SCOPE_FN_RE.is_match(body) {
                    return ContextValueSnafu {
                        message: "The current task is unset in the context.".to_string(),
                    }
                    .fail();
                }
                if !scope.item && ITEM_SCOPE_FN_RE.is_match(body) {
                    return ContextValueSnafu {
                        message: "The current item is unset in the context.".to_string(),
                    }
                    .fail();
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_scope(item, scope)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, val) in map {
                check_scope(&Value::String(key.clone()), scope)?;
                check_scope(val, scope)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Guard truthiness: null and false are falsy, everything else is
/// truthy.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        _ => true,
    }
}

fn fragment_body(fragment: &str) -> &str {
    let inner = if let Some(stripped) = fragment.strip_prefix("<%") {
        stripped.strip_suffix("%>").unwrap_or(stripped)
    } else if let Some(stripped) = fragment.strip_prefix("{{") {
        stripped.strip_suffix("}}").unwrap_or(stripped)
    } else {
        fragment
    };
    inner.trim()
}

fn evaluate_fragment(body: &str, ctx: &Value) -> Result<Value> {
    let prepared = preprocess(body);
    debug!(expression = body, jq = prepared.as_str(), "evaluating expression");

    evaluate_jq(&prepared, ctx).map_err(|message| Error::Evaluation {
        expression: body.to_string(),
        message,
    })
}

/// Rewrites a fragment from the workflow dialect into plain jq. The
/// conductor functions become lookups against reserved keys the
/// render context always carries.
fn preprocess(body: &str) -> String {
    let expr = normalize_quotes(body);
    let expr = rewrite_zip(&expr);
    let expr = rewrite_equality(&expr);

    let expr = CTX_NAMED_RE.replace_all(&expr, r#".__vars["$1"]"#).into_owned();
    let expr = CTX_EMPTY_RE.replace_all(&expr, ".__vars").into_owned();
    let expr = TASK_STATE_RE
        .replace_all(&expr, r#"(.__task_states["$1"] // "unset")"#)
        .into_owned();
    let expr = SUCCEEDED_RE
        .replace_all(&expr, r#"(.__current_status == "succeeded")"#)
        .into_owned();
    let expr = FAILED_RE
        .replace_all(&expr, r#"(.__current_status == "failed")"#)
        .into_owned();
    let expr = COMPLETED_RE
        .replace_all(
            &expr,
            r#"(.__current_status as $$s | ["succeeded","failed","expired","abandoned","canceled"] | index($$s) != null)"#,
        )
        .into_owned();
    let expr = ITEM_NAMED_RE.replace_all(&expr, r#".__item["$1"]"#).into_owned();
    let expr = ITEM_EMPTY_RE.replace_all(&expr, ".__item").into_owned();

    RESULT_RE.replace_all(&expr, ".__result").into_owned()
}

/// Converts single-quoted string literals into jq's double-quoted
/// form.
fn normalize_quotes(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut in_double = false;
    let mut in_single = false;

    for ch in expr.chars() {
        match ch {
            '"' if !in_single => {
                in_double = !in_double;
                out.push('"');
            }
            '\'' if !in_double => {
                in_single = !in_single;
                out.push('"');
            }
            _ => out.push(ch),
        }
    }

    out
}

/// Rewrites `zip(a, b, ...)` into `([a, b, ...] | transpose)`,
/// matching parentheses by hand since the arguments themselves
/// contain calls.
fn rewrite_zip(expr: &str) -> String {
    let mut out = expr.to_string();

    while let Some(start) = out.find("zip(") {
        let args_start = start + 4;
        let mut depth = 1usize;
        let mut end = None;
        let mut splits = Vec::new();

        for (offset, ch) in out[args_start..].char_indices() {
            match ch {
                '(' | '[' => depth += 1,
                ')' | ']' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(args_start + offset);
                        break;
                    }
                }
                ',' if depth == 1 => splits.push(args_start + offset),
                _ => {}
            }
        }

        let Some(end) = end else {
            // Unbalanced parentheses surface as a backend parse error.
            break;
        };

        let mut args = Vec::new();
        let mut cursor = args_start;
        for split in splits {
            args.push(out[cursor..split].trim().to_string());
            cursor = split + 1;
        }
        args.push(out[cursor..end].trim().to_string());

        let replacement = format!("([{}] | transpose)", args.join(", "));
        out.replace_range(start..=end, &replacement);
    }

    out
}

/// Rewrites lone `=` comparisons into `==`, leaving `==`, `!=`, `<=`
/// and `>=` untouched. String literals are skipped.
fn rewrite_equality(expr: &str) -> String {
    let chars: Vec<char> = expr.chars().collect();
    let mut out = String::with_capacity(expr.len());
    let mut in_string = false;

    for (i, &ch) in chars.iter().enumerate() {
        if ch == '"' {
            in_string = !in_string;
            out.push(ch);
        } else if ch == '=' && !in_string {
            let prev = if i > 0 { chars[i - 1] } else { ' ' };
            let next = if i + 1 < chars.len() { chars[i + 1] } else { ' ' };
            if prev == '=' || prev == '!' || prev == '<' || prev == '>' || next == '=' {
                out.push('=');
            } else {
                out.push_str("==");
            }
        } else {
            out.push(ch);
        }
    }

    out
}

/// Compiles a prepared jq program without running it. Returns the
/// backend's error rendering on failure.
fn compile_check(jq_expr: &str) -> std::result::Result<(), String> {
    use jaq_core::{
        compile::Compiler,
        load::{Arena, File, Loader},
    };

    let arena = Arena::default();
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let file: File<_, ()> = File { path: (), code: jq_expr };

    let modules = loader
        .load(&arena, file)
        .map_err(|errs| format!("{errs:?}"))?;

    Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map(|_| ())
        .map_err(|errs| format!("{errs:?}"))
}

/// Evaluates a prepared jq program against a context value and
/// returns the first produced output.
fn evaluate_jq(jq_expr: &str, context: &Value) -> std::result::Result<Value, String> {
    use jaq_core::{
        Ctx, RcIter,
        compile::Compiler,
        load::{Arena, File, Loader},
    };

    let arena = Arena::default();
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let file: File<_, ()> = File { path: (), code: jq_expr };

    let modules = loader
        .load(&arena, file)
        .map_err(|errs| format!("load failed: {errs:?}"))?;

    let filter = Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|errs| format!("compile failed: {errs:?}"))?;

    let input: jaq_json::Val = context.clone().into();
    let inputs = RcIter::new(core::iter::empty());
    let mut results = filter.run((Ctx::new([], &inputs), input));

    match results.next() {
        None => Ok(Value::Null),
        Some(Ok(val)) => Ok(val.into()),
        Some(Err(e)) => Err(format!("{e}")),
    }
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_preprocess_rewrites() {
        assert_eq!(preprocess("ctx().foo"), ".__vars.foo");
        assert_eq!(preprocess("ctx(xs)"), r#".__vars["xs"]"#);
        assert_eq!(preprocess("item(x) + item(y)"), r#".__item["x"] + .__item["y"]"#);
        assert_eq!(preprocess("result()"), ".__result");
        assert_eq!(preprocess("ctx(which) = 'a'"), r#".__vars["which"] == "a""#);
        assert_eq!(
            preprocess("zip(ctx(xs), ctx(ys))"),
            r#"([.__vars["xs"], .__vars["ys"]] | transpose)"#
        );
    }

    #[test]
    fn test_evaluate_single_fragment_preserves_type() {
        let ctx = json!({"__vars": {"xs": ["fee", "fi"], "n": 3}});

        let result = evaluate_str("<% ctx(xs) %>", &ctx).unwrap();
        assert_eq!(result, json!(["fee", "fi"]));

        let result = evaluate_str("<% ctx(n) + 1 %>", &ctx).unwrap();
        assert_eq!(result, json!(4));
    }

    #[test]
    fn test_evaluate_embedded_fragment_stringifies() {
        let ctx = json!({"__vars": {"name": "fum"}});
        let result = evaluate_str("hello <% ctx(name) %>!", &ctx).unwrap();
        assert_eq!(result, json!("hello fum!"));
    }

    #[test]
    fn test_validate_reports_in_document_order() {
        let target = json!("<% 1 +/ 2 %> and <% {'a': 123} %>");
        let errors = validate(&target);

        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("Parse error"));
        assert!(errors[1].message.contains("Lexical error"));
    }

    #[test]
    fn test_scope_check_rejects_out_of_scope_functions() {
        let scope = RenderScope::default();
        let err = check_scope(&json!("<% result() %>"), scope).unwrap_err();
        assert!(err.to_string().contains("current task is unset"));

        let err = check_scope(&json!("<% item() %>"), scope).unwrap_err();
        assert!(err.to_string().contains("current item is unset"));

        let scope = RenderScope::with_current_task().with_item(true);
        assert!(check_scope(&json!("<% item(x) %>"), scope).is_ok());
    }
}
