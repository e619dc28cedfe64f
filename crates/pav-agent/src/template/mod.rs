//! The template evaluation engine.
//!
//! Every string leaf of a provisioner spec outside `provisioningModes`
//! is a template, rendered over one of the named contexts in
//! [`context`]. Evaluation is deterministic and side-effect free apart
//! from the explicit `lookup-claim` hook; filters are passed into each
//! evaluation rather than living in a global registry.

pub mod context;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::Api;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tera::Tera;

use crate::error::{Error, Result};
use crate::{capacity, schema};

/// Appended to every string leaf so the engine can observe whether the
/// template turned the `yaml` sentinel on; renders to nothing.
const PROBE_SUFFIX: &str = "{{ yaml | default(value=false) | __pav_probe }}";

lazy_static! {
    // A line that consists of nothing but one statement block.
    static ref STATEMENT_LINE: Regex =
        Regex::new(r"^[ \t]*(\{%(?:[^%]|%[^}])*%\})[ \t]*$").unwrap();
}

/// Renders templates over a named context. Cheap to clone.
#[derive(Clone)]
pub struct TemplateEngine {
    client: Option<kube::Client>,
}

impl TemplateEngine {
    pub fn new(client: kube::Client) -> Self {
        TemplateEngine {
            client: Some(client),
        }
    }

    /// An engine without the `lookup-claim` hook. Rendering a template
    /// that calls the hook fails.
    pub fn detached() -> Self {
        TemplateEngine { client: None }
    }

    /// Evaluates every string leaf of `tree` under `ctx`, substituting
    /// re-parsed subtrees where a leaf turned the `yaml` sentinel on.
    /// `path` keys error messages, e.g. `volumeStaging.podTemplate`.
    pub async fn evaluate_tree<C: Serialize>(
        &self,
        path: &str,
        tree: &Value,
        ctx: &C,
    ) -> Result<Value> {
        let context = to_tera_context(path, ctx)?;
        let client = self.client.clone();
        let handle = tokio::runtime::Handle::current();
        let tree = tree.clone();
        let path = path.to_owned();
        spawn_eval(move || evaluate_value(&client, &handle, &path, &tree, &context)).await
    }

    /// Evaluates a single string template to a string.
    pub async fn evaluate_string<C: Serialize>(
        &self,
        path: &str,
        template: &str,
        ctx: &C,
    ) -> Result<String> {
        let context = to_tera_context(path, ctx)?;
        let client = self.client.clone();
        let handle = tokio::runtime::Handle::current();
        let template = template.to_owned();
        let path = path.to_owned();
        spawn_eval(move || {
            render_leaf(&client, &handle, &path, &template, &context).map(|(s, _)| s)
        })
        .await
    }

    /// Evaluates a capacity-typed leaf: the trimmed rendering must parse
    /// as a capacity quantity.
    pub async fn evaluate_capacity<C: Serialize>(
        &self,
        path: &str,
        template: &str,
        ctx: &C,
    ) -> Result<i64> {
        let rendered = self.evaluate_string(path, template, ctx).await?;
        capacity::parse(rendered.trim())
            .map_err(|e| Error::template(path, format!("expected a capacity quantity: {}", e)))
    }

    /// Evaluates a handle-typed leaf: the trimmed rendering must be a
    /// valid volume handle.
    pub async fn evaluate_handle<C: Serialize>(
        &self,
        path: &str,
        template: &str,
        ctx: &C,
    ) -> Result<String> {
        let rendered = self.evaluate_string(path, template, ctx).await?;
        let handle = rendered.trim().to_owned();
        if !schema::is_handle(&handle) {
            return Err(Error::template(
                path,
                format!("'{}' is not a valid volume handle", handle),
            ));
        }
        Ok(handle)
    }
}

async fn spawn_eval<T: Send + 'static>(
    f: impl FnOnce() -> Result<T> + Send + 'static,
) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("template evaluation task failed: {}", e)))?
}

fn to_tera_context<C: Serialize>(path: &str, ctx: &C) -> Result<tera::Context> {
    tera::Context::from_serialize(ctx)
        .map_err(|e| Error::template(path, format!("building evaluation context: {}", e)))
}

fn evaluate_value(
    client: &Option<kube::Client>,
    handle: &tokio::runtime::Handle,
    path: &str,
    value: &Value,
    ctx: &tera::Context,
) -> Result<Value> {
    match value {
        Value::String(template) => {
            let (rendered, reparse) = render_leaf(client, handle, path, template, ctx)?;
            if reparse {
                // Whole-subtree mode: the rendered string becomes
                // structured data in place and is not re-evaluated.
                serde_yaml::from_str::<Value>(&rendered).map_err(|e| {
                    Error::template(path, format!("re-parsing evaluated output: {}", e))
                })
            } else {
                Ok(Value::String(rendered))
            }
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                evaluate_value(client, handle, &format!("{}.{}", path, i), item, ctx)
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, item)| {
                Ok((
                    key.clone(),
                    evaluate_value(client, handle, &format!("{}.{}", path, key), item, ctx)?,
                ))
            })
            .collect::<Result<serde_json::Map<String, Value>>>()
            .map(Value::Object),
        scalar => Ok(scalar.clone()),
    }
}

fn render_leaf(
    client: &Option<kube::Client>,
    handle: &tokio::runtime::Handle,
    path: &str,
    template: &str,
    ctx: &tera::Context,
) -> Result<(String, bool)> {
    let mut tera = Tera::default();

    let yaml_flag = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&yaml_flag);
        tera.register_filter(
            "__pav_probe",
            move |value: &Value, _: &HashMap<String, Value>| {
                if is_truthy(value) {
                    flag.store(true, Ordering::SeqCst);
                }
                Ok(Value::String(String::new()))
            },
        );
    }
    tera.register_filter("to_shell_token", to_shell_token);
    tera.register_filter("to_structured_json", to_structured_json);
    if let Some(client) = client {
        tera.register_function(
            "lookup_claim",
            LookupClaim {
                client: client.clone(),
                handle: handle.clone(),
            },
        );
    }

    let body = format!("{}{}", preprocess(template), PROBE_SUFFIX);
    tera.add_raw_template("leaf", &body)
        .map_err(|e| Error::template(path, flatten_tera_error(&e)))?;
    let rendered = tera
        .render("leaf", ctx)
        .map_err(|e| Error::template(path, flatten_tera_error(&e)))?;

    Ok((rendered, yaml_flag.load(Ordering::SeqCst)))
}

/// Rewrites the raw template text before parsing: strips the leading
/// whitespace and trailing newline of statement-only lines, and maps the
/// hyphenated public filter names to identifiers the parser accepts.
fn preprocess(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    for line in template.split_inclusive('\n') {
        let (body, had_newline) = match line.strip_suffix('\n') {
            Some(body) => (body, true),
            None => (line, false),
        };
        if let Some(captures) = STATEMENT_LINE.captures(body) {
            out.push_str(&captures[1]);
        } else {
            out.push_str(body);
            if had_newline {
                out.push('\n');
            }
        }
    }
    out.replace("to-shell-token", "to_shell_token")
        .replace("to-structured-json", "to_structured_json")
        .replace("lookup-claim", "lookup_claim")
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Tera errors carry the interesting part in their source chain.
fn flatten_tera_error(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Encodes a string or number as a single shell token: `echo <token>`
/// under a POSIX shell prints the input back.
fn to_shell_token(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let s = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(tera::Error::msg(format!(
                "to-shell-token expects a string or number, got {}",
                type_name(other)
            )))
        }
    };
    Ok(Value::String(shell_token(&s)))
}

fn shell_token(s: &str) -> String {
    if s.is_empty() {
        return "''".to_owned();
    }
    if s.contains('\n') {
        // ANSI-C quoting is the only single-token form that can carry a
        // newline.
        let mut out = String::from("$'");
        for c in s.chars() {
            match c {
                '\\' => out.push_str(r"\\"),
                '\'' => out.push_str(r"\'"),
                '\n' => out.push_str(r"\n"),
                _ => out.push(c),
            }
        }
        out.push('\'');
        return out;
    }
    let safe = |c: char| c.is_ascii_alphanumeric() || "+-./:=@_%^,".contains(c);
    if s.chars().all(safe) {
        s.to_owned()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Emits newline-free JSON of any context value, for embedding
/// structured data inside a single manifest line.
fn to_structured_json(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let json = serde_json::to_string(value).map_err(|e| tera::Error::msg(e.to_string()))?;
    Ok(Value::String(json))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// The `lookup-claim(name, namespace)` hook: reads a claim through the
/// orchestrator client. Template evaluation runs on a blocking thread,
/// so the hook re-enters the runtime through the captured handle.
struct LookupClaim {
    client: kube::Client,
    handle: tokio::runtime::Handle,
}

impl tera::Function for LookupClaim {
    fn call(&self, args: &HashMap<String, Value>) -> tera::Result<Value> {
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| tera::Error::msg("lookup-claim requires a 'name' argument"))?;
        let namespace = args
            .get("namespace")
            .and_then(Value::as_str)
            .ok_or_else(|| tera::Error::msg("lookup-claim requires a 'namespace' argument"))?;

        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let owned_name = name.to_owned();
        let claim = self
            .handle
            .block_on(async move { api.get(&owned_name).await })
            .map_err(|e| {
                tera::Error::msg(format!("lookup-claim({}/{}): {}", namespace, name, e))
            })?;
        serde_json::to_value(claim).map_err(|e| tera::Error::msg(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn engine() -> TemplateEngine {
        TemplateEngine::detached()
    }

    #[tokio::test]
    async fn substitutes_context_variables() {
        let out = engine()
            .evaluate_string("p", "hello {{ who }}!", &json!({ "who": "world" }))
            .await
            .unwrap();
        assert_eq!(out, "hello world!");
    }

    #[tokio::test]
    async fn evaluation_is_deterministic() {
        let ctx = json!({ "params": { "a": "1" }, "handle": "h-1" });
        let template = "{{ handle }}:{% for k, v in params %}{{ k }}={{ v }}{% endfor %}";
        let first = engine().evaluate_string("p", template, &ctx).await.unwrap();
        let second = engine().evaluate_string("p", template, &ctx).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_variables_fail_with_the_template_path() {
        let err = engine()
            .evaluate_string("volumeCreation.handle", "{{ nope }}", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Template { ref path, .. } if path == "volumeCreation.handle"));
    }

    #[tokio::test]
    async fn statement_only_lines_are_stripped() {
        let template = "  {% set x = 40 + 2 %}\nanswer={{ x }}";
        let out = engine().evaluate_string("p", template, &json!({})).await.unwrap();
        assert_eq!(out, "answer=42");
    }

    #[tokio::test]
    async fn mixed_lines_keep_their_whitespace() {
        let template = "a\n  b {% if true %}c{% endif %}\n";
        let out = engine().evaluate_string("p", template, &json!({})).await.unwrap();
        assert_eq!(out, "a\n  b c\n");
    }

    #[tokio::test]
    async fn shell_token_filter_quotes_for_a_posix_shell() {
        let ctx = json!({
            "plain": "word-1.2",
            "spaced": "two words",
            "quoted": "it's",
            "multiline": "a\nb",
            "number": 7,
        });
        let engine = engine();
        let render = |t: &'static str| {
            let engine = engine.clone();
            let ctx = ctx.clone();
            async move { engine.evaluate_string("p", t, &ctx).await.unwrap() }
        };
        assert_eq!(render("{{ plain | to-shell-token }}").await, "word-1.2");
        assert_eq!(render("{{ spaced | to-shell-token }}").await, "'two words'");
        assert_eq!(render("{{ quoted | to-shell-token }}").await, r"'it'\''s'");
        assert_eq!(render("{{ multiline | to-shell-token }}").await, r"$'a\nb'");
        assert_eq!(render("{{ number | to-shell-token }}").await, "7");
    }

    #[tokio::test]
    async fn structured_json_filter_never_emits_newlines() {
        let ctx = json!({ "pvc": { "metadata": { "name": "a", "labels": { "x": "1\n2" } } } });
        let out = engine()
            .evaluate_string("p", "{{ pvc | to-structured-json }}", &ctx)
            .await
            .unwrap();
        assert!(!out.contains('\n'));
        let round: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(round["metadata"]["name"], "a");
    }

    #[tokio::test]
    async fn yaml_sentinel_substitutes_a_subtree() {
        let tree = json!({
            "spec": {
                "env": "{% set yaml = true %}{name: FOO, value: {{ handle }}}",
                "plain": "{{ handle }}",
            }
        });
        let out = engine()
            .evaluate_tree("podTemplate", &tree, &json!({ "handle": "vol-1" }))
            .await
            .unwrap();
        assert_eq!(out["spec"]["env"], json!({ "name": "FOO", "value": "vol-1" }));
        assert_eq!(out["spec"]["plain"], "vol-1");
    }

    #[tokio::test]
    async fn yaml_subtree_is_not_re_evaluated() {
        let tree = json!({
            "v": "{% set yaml = true %}inner: '{% raw %}{{ handle }}{% endraw %}'"
        });
        let out = engine()
            .evaluate_tree("p", &tree, &json!({ "handle": "h" }))
            .await
            .unwrap();
        // The substituted subtree keeps template syntax verbatim; the
        // pass is single-shot.
        assert_eq!(out["v"]["inner"], "{{ handle }}");
    }

    #[tokio::test]
    async fn yaml_reparse_failure_is_a_template_error() {
        let tree = json!({ "v": "{% set yaml = true %}{unbalanced" });
        let err = engine()
            .evaluate_tree("p", &tree, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Template { ref path, .. } if path == "p.v"));
    }

    #[tokio::test]
    async fn non_string_scalars_pass_through() {
        let tree = json!({ "a": 1, "b": true, "c": null, "d": [1, "x-{{ n }}"] });
        let out = engine().evaluate_tree("p", &tree, &json!({ "n": 2 })).await.unwrap();
        assert_eq!(out, json!({ "a": 1, "b": true, "c": null, "d": [1, "x-2"] }));
    }

    #[tokio::test]
    async fn capacity_leaves_must_evaluate_to_quantities() {
        let ctx = json!({ "requestedMinCapacity": 1073741824i64 });
        let bytes = engine()
            .evaluate_capacity("volumeCreation.capacity", "{{ requestedMinCapacity }}", &ctx)
            .await
            .unwrap();
        assert_eq!(bytes, 1073741824);

        let err = engine()
            .evaluate_capacity("volumeCreation.capacity", "lots", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Template { .. }));
    }

    #[tokio::test]
    async fn handle_leaves_are_checked_and_trimmed() {
        let handle = engine()
            .evaluate_handle("volumeCreation.handle", " vol-{{ n }}\n", &json!({ "n": 3 }))
            .await
            .unwrap();
        assert_eq!(handle, "vol-3");

        let err = engine()
            .evaluate_handle("volumeCreation.handle", "has space", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Template { .. }));
    }
}
