use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

use crate::expressions;

lazy_static! {
    /// Splits the multi-name items form `x, y in <% ... %>`.
    static ref ITEMS_BINDING_RE: Regex = Regex::new(
        r"(?s)^\s*([A-Za-z_][A-Za-z0-9_]*(?:\s*,\s*[A-Za-z_][A-Za-z0-9_]*)*)\s+in\s+(.+)$"
    )
    .unwrap();
    /// Captures one `key=value` pair of an inline action argument.
    /// Values may be expression fragments, quoted strings, or bare
    /// scalars.
    static ref INLINE_PARAM_RE: Regex = Regex::new(
        r#"([A-Za-z_][A-Za-z0-9_.]*)=((?:<%.*?%>)|(?:\{\{.*?\}\})|(?:"[^"]*")|(?:'[^']*')|(?:\S+))"#
    )
    .unwrap();
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Workflow definition parse error: {source}"))]
    Parse { source: serde_yaml::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A static validation finding from [`WorkflowSpec::inspect`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub spec_path: String,
}

/// Native workflow definition document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub version: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Vec<InputSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<Vec<IndexMap<String, Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<IndexMap<String, Value>>>,
    #[serde(default)]
    pub tasks: IndexMap<String, TaskSpec>,
}

/// A declared workflow input: a bare name, or a single-entry mapping
/// of name to default value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSpec {
    Name(String),
    Defaulted(IndexMap<String, Value>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<Vec<IndexMap<String, Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<WithSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<NextSpec>,
}

/// Join barrier declaration: `all` or a positive inbound count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinSpec {
    Count(u32),
    Mode(String),
}

/// Items iteration declaration: a bare expression, or the full form
/// with an optional concurrency bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WithSpec {
    Scalar(String),
    Full {
        items: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        concurrency: Option<Value>,
    },
}

/// The item names and sequence expression of a `with` declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemsBinding {
    pub names: Vec<String>,
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publish: Vec<IndexMap<String, Value>>,
    #[serde(rename = "do", default, skip_serializing_if = "DoSpec::is_empty")]
    pub do_: DoSpec,
}

/// Transition targets: a single task id or an ordered list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DoSpec {
    One(String),
    Many(Vec<String>),
}

impl Default for DoSpec {
    fn default() -> Self {
        DoSpec::Many(Vec::new())
    }
}

impl DoSpec {
    #[must_use]
    pub fn targets(&self) -> Vec<&str> {
        match self {
            DoSpec::One(id) => vec![id.as_str()],
            DoSpec::Many(ids) => ids.iter().map(String::as_str).collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            DoSpec::One(_) => false,
            DoSpec::Many(ids) => ids.is_empty(),
        }
    }
}

impl WithSpec {
    #[must_use]
    pub fn items(&self) -> &str {
        match self {
            WithSpec::Scalar(items) => items,
            WithSpec::Full { items, .. } => items,
        }
    }

    #[must_use]
    pub fn concurrency(&self) -> Option<&Value> {
        match self {
            WithSpec::Scalar(_) => None,
            WithSpec::Full { concurrency, .. } => concurrency.as_ref(),
        }
    }

    /// Splits `x, y in <% zip(...) %>` into bound names and the
    /// sequence expression. The bare form yields no names and the
    /// whole string as the expression.
    #[must_use]
    pub fn binding(&self) -> ItemsBinding {
        let items = self.items();
        if let Some(caps) = ITEMS_BINDING_RE.captures(items) {
            let names = caps[1]
                .split(',')
                .map(|name| name.trim().to_string())
                .collect();
            ItemsBinding { names, expression: caps[2].trim().to_string() }
        } else {
            ItemsBinding { names: Vec::new(), expression: items.trim().to_string() }
        }
    }
}

impl TaskSpec {
    /// The action name, without inline arguments.
    #[must_use]
    pub fn action_name(&self) -> Option<&str> {
        self.action
            .as_deref()
            .map(|action| action.split_whitespace().next().unwrap_or(action))
    }

    /// Inline `key=value` arguments carried on the action string,
    /// merged under the task's `input` block by the conductor.
    #[must_use]
    pub fn inline_input(&self) -> Option<Value> {
        let action = self.action.as_deref()?;
        let args = action.split_once(char::is_whitespace)?.1;

        let mut input = serde_json::Map::new();
        for caps in INLINE_PARAM_RE.captures_iter(args) {
            input.insert(caps[1].to_string(), parse_inline_value(&caps[2]));
        }

        if input.is_empty() { None } else { Some(Value::Object(input)) }
    }

    /// The task input with inline action arguments merged in; the
    /// explicit `input` block wins on key collisions.
    #[must_use]
    pub fn merged_input(&self) -> Option<Value> {
        match (self.inline_input(), &self.input) {
            (None, None) => None,
            (Some(inline), None) => Some(inline),
            (None, Some(block)) => Some(block.clone()),
            (Some(Value::Object(mut merged)), Some(Value::Object(block))) => {
                for (k, v) in block {
                    merged.insert(k.clone(), v.clone());
                }
                Some(Value::Object(merged))
            }
            (_, Some(block)) => Some(block.clone()),
        }
    }
}

fn parse_inline_value(raw: &str) -> Value {
    if raw.starts_with("<%") || raw.starts_with("{{") {
        return Value::String(raw.to_string());
    }
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }

    serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

impl WorkflowSpec {
    pub fn from_yaml(definition: &str) -> Result<Self> {
        serde_yaml::from_str(definition).context(ParseSnafu)
    }

    /// Statically validates the document: every expression fragment in
    /// declaration order, then transition targets and join counts.
    /// An empty report means the spec is clean.
    #[must_use]
    pub fn inspect(&self) -> Vec<SpecError> {
        let mut errors = Vec::new();

        if let Some(inputs) = &self.input {
            for (idx, input) in inputs.iter().enumerate() {
                if let InputSpec::Defaulted(entry) = input {
                    for (name, default) in entry {
                        collect_expression_errors(
                            default,
                            &format!("input[{idx}].{name}"),
                            &mut errors,
                        );
                    }
                }
            }
        }

        if let Some(vars) = &self.vars {
            for (idx, entry) in vars.iter().enumerate() {
                for (name, value) in entry {
                    collect_expression_errors(value, &format!("vars[{idx}].{name}"), &mut errors);
                }
            }
        }

        for (task_id, task) in &self.tasks {
            let base = format!("tasks.{task_id}");

            if let Some(vars) = &task.vars {
                for (idx, entry) in vars.iter().enumerate() {
                    for (name, value) in entry {
                        collect_expression_errors(
                            value,
                            &format!("{base}.vars[{idx}].{name}"),
                            &mut errors,
                        );
                    }
                }
            }
            if let Some(action) = &task.action {
                collect_expression_errors(
                    &Value::String(action.clone()),
                    &format!("{base}.action"),
                    &mut errors,
                );
            }
            if let Some(input) = &task.input {
                collect_expression_errors(input, &format!("{base}.input"), &mut errors);
            }
            if let Some(delay) = &task.delay {
                collect_expression_errors(delay, &format!("{base}.delay"), &mut errors);
            }
            if let Some(with) = &task.with {
                let binding = with.binding();
                collect_expression_errors(
                    &Value::String(binding.expression),
                    &format!("{base}.with.items"),
                    &mut errors,
                );
                if let Some(concurrency) = with.concurrency() {
                    collect_expression_errors(
                        concurrency,
                        &format!("{base}.with.concurrency"),
                        &mut errors,
                    );
                }
            }
            if let Some(JoinSpec::Mode(mode)) = &task.join {
                if mode != "all" {
                    errors.push(SpecError {
                        error_type: "semantics".to_string(),
                        message: format!("Unknown join mode `{mode}`."),
                        spec_path: format!("{base}.join"),
                    });
                }
            }
            if let Some(JoinSpec::Count(0)) = &task.join {
                errors.push(SpecError {
                    error_type: "semantics".to_string(),
                    message: "Join count must be a positive integer.".to_string(),
                    spec_path: format!("{base}.join"),
                });
            }

            for (clause_idx, clause) in task.next.iter().enumerate() {
                let clause_path = format!("{base}.next[{clause_idx}]");

                if let Some(when) = &clause.when {
                    collect_expression_errors(
                        &Value::String(when.clone()),
                        &format!("{clause_path}.when"),
                        &mut errors,
                    );
                }
                for entry in &clause.publish {
                    for (name, value) in entry {
                        collect_expression_errors(
                            value,
                            &format!("{clause_path}.publish.{name}"),
                            &mut errors,
                        );
                    }
                }
                for target in clause.do_.targets() {
                    if !self.tasks.contains_key(target) {
                        errors.push(SpecError {
                            error_type: "semantics".to_string(),
                            message: format!("The task `{target}` is not declared in the workflow."),
                            spec_path: format!("{clause_path}.do"),
                        });
                    }
                }
            }
        }

        if let Some(output) = &self.output {
            for (idx, entry) in output.iter().enumerate() {
                for (name, value) in entry {
                    collect_expression_errors(value, &format!("output[{idx}].{name}"), &mut errors);
                }
            }
        }

        errors
    }
}

fn collect_expression_errors(value: &Value, spec_path: &str, errors: &mut Vec<SpecError>) {
    for error in expressions::validate(value) {
        errors.push(SpecError {
            error_type: "expression".to_string(),
            message: error.message,
            spec_path: spec_path.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(definition: &str) -> WorkflowSpec {
        WorkflowSpec::from_yaml(definition).unwrap()
    }

    #[test]
    fn test_task_order_is_preserved() {
        let spec = parse(
            r"
            version: 1.0
            tasks:
              prep:
                action: core.noop
              task1:
                action: core.noop
              task2:
                action: core.noop
            ",
        );

        let ids: Vec<&String> = spec.tasks.keys().collect();
        assert_eq!(ids, ["prep", "task1", "task2"]);
    }

    #[test]
    fn test_inline_action_arguments() {
        let spec = parse(
            r"
            version: 1.0
            tasks:
              task1:
                action: core.echo message=<% item() %> count=3
            ",
        );

        let task = &spec.tasks["task1"];
        assert_eq!(task.action_name(), Some("core.echo"));
        assert_eq!(
            task.merged_input(),
            Some(json!({"message": "<% item() %>", "count": 3}))
        );
    }

    #[test]
    fn test_with_items_binding_forms() {
        let bare = WithSpec::Scalar("<% ctx(xs) %>".to_string());
        assert_eq!(
            bare.binding(),
            ItemsBinding { names: vec![], expression: "<% ctx(xs) %>".to_string() }
        );

        let named = WithSpec::Scalar("x, y in <% zip(ctx(xs), ctx(ys)) %>".to_string());
        assert_eq!(
            named.binding(),
            ItemsBinding {
                names: vec!["x".to_string(), "y".to_string()],
                expression: "<% zip(ctx(xs), ctx(ys)) %>".to_string(),
            }
        );
    }

    #[test]
    fn test_inspect_reports_unknown_do_target() {
        let spec = parse(
            r"
            version: 1.0
            tasks:
              task1:
                action: core.noop
                next:
                  - do: missing
            ",
        );

        let errors = spec.inspect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, "semantics");
        assert!(errors[0].message.contains("missing"));
    }

    #[test]
    fn test_inspect_reports_bad_expressions_in_order() {
        let spec = parse(
            r"
            version: 1.0
            vars:
              - bad: <% 1 +/ 2 %>
            tasks:
              task1:
                action: core.noop
                next:
                  - when: '<% <% ctx().foo %> %>'
            ",
        );

        let errors = spec.inspect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].spec_path.starts_with("vars[0]"));
        assert!(errors[0].message.contains("Parse error"));
        assert!(errors[1].spec_path.contains("next[0].when"));
    }
}
