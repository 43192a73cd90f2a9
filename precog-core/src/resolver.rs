//! Extracts values from stored responses via path queries and expressions,
//! and builds the child execution contexts a dependency edge produces.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::context::{EvalContext, RequestContext};
use crate::expr;
use crate::http_client::{Response, ResponseHistory};
use crate::manifest::{Edge, Select, SelectType};
use crate::pathquery;
use crate::token_store::TokenStore;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Expr(#[from] expr::Error),
    #[error("persisting authy value: {0}")]
    TokenStore(#[from] crate::token_store::Error),
}

/// Resolves an edge against the response history, producing zero or more
/// child contexts. Every `to` name of the edge receives the same set of
/// children; the caller crosses this result with `edge.to`.
pub fn resolve(
    edge: &Edge,
    manifest_id: &str,
    history: &ResponseHistory,
    parent_ctx: &RequestContext,
    token_store: &TokenStore,
    latest_only: bool,
) -> Result<Vec<RequestContext>, Error> {
    let responses = source_responses(edge, history, latest_only);

    let mut name_values: Vec<(String, Vec<Value>)> = Vec::with_capacity(edge.select.len());
    for select in &edge.select {
        let values = resolve_select(select, &responses, parent_ctx, manifest_id, token_store)?;
        name_values.push((select.name.clone(), values));
    }

    if let Some(selectwhere) = &edge.selectwhere {
        let extra = name_values
            .iter()
            .filter_map(|(name, values)| values.first().map(|v| (name.clone(), v.clone())));
        let gate_ctx = parent_ctx.as_eval_augmented(extra);
        // An unresolved variable or malformed `selectwhere` is treated as non-matching,
        // the same disposition as a fail/retry/reauth classifier (spec.md §7).
        match expr::eval_truthy(selectwhere, &gate_ctx) {
            Ok(true) => {}
            Ok(false) => return Ok(Vec::new()),
            Err(e) => {
                log::debug!("selectwhere `{selectwhere}` did not evaluate: {e}");
                return Ok(Vec::new());
            }
        }
    }

    let k = name_values.len();
    if k == 0 {
        return Ok(Vec::new());
    }

    let combos = cartesian(&name_values);
    Ok(combos.into_iter().map(|bindings| parent_ctx.extend(bindings)).collect())
}

fn source_responses<'a>(edge: &Edge, history: &'a ResponseHistory, latest_only: bool) -> Vec<&'a Response> {
    let mut out = Vec::new();
    for name in &edge.from {
        let Some(list) = history.get(name) else { continue };
        if latest_only {
            if let Some(last) = list.last() {
                out.push(last);
            }
        } else {
            out.extend(list.iter());
        }
    }
    out
}

fn resolve_select(
    select: &Select,
    responses: &[&Response],
    parent_ctx: &RequestContext,
    manifest_id: &str,
    token_store: &TokenStore,
) -> Result<Vec<Value>, Error> {
    let mut all_values = Vec::new();
    for resp in responses {
        // An ExpressionError during extraction empties the value list for just this
        // source response (spec.md §7), it does not abort the whole select.
        match extract_from_response(select, resp, parent_ctx) {
            Ok(values) => all_values.extend(values),
            Err(e) => log::debug!("select `{}` did not extract from a source response: {e}", select.name),
        }
    }
    let deduped = dedup_preserve_order(all_values);
    if select.authy {
        if let Some(first) = deduped.first() {
            token_store.save_authy_value(manifest_id, &select.name, first.clone())?;
            persist_reserved_auth_field(token_store, manifest_id, &select.name, first)?;
        }
    }
    Ok(deduped)
}

/// An authy select named `access_token`/`refresh_token` is the conventional
/// shape of a token-exchange response (spec.md Scenario 6). Besides the
/// generic `authyValues` entry above, these two names also populate the
/// structured `AuthState` fields the reserved `wsk_to_rsk_auth_token`/
/// `wsk_to_rsk_refresh_token` system variables and `isTokenExpired` read —
/// otherwise nothing in the engine would ever call `updateAccessToken`/
/// `updateRefreshToken` and a completed OAuth2 run would look expired again
/// on the very next invocation.
fn persist_reserved_auth_field(
    token_store: &TokenStore,
    manifest_id: &str,
    select_name: &str,
    value: &Value,
) -> Result<(), Error> {
    let Some(token) = value.as_str() else { return Ok(()) };
    match select_name {
        "access_token" => {
            let now = chrono::Utc::now().timestamp_millis();
            token_store.update_access_token(manifest_id, token, None, now)?;
        }
        "refresh_token" => {
            token_store.update_refresh_token(manifest_id, token)?;
        }
        _ => {}
    }
    Ok(())
}

fn extract_from_response(select: &Select, resp: &Response, parent_ctx: &RequestContext) -> Result<Vec<Value>, Error> {
    let mut augmented_extracted = parent_ctx.extracted_data.clone();

    for nested in &select.select {
        let nested_values = extract_from_response(nested, resp, parent_ctx)?;
        augmented_extracted.insert(nested.name.clone(), Value::Array(nested_values));
    }

    let eval_ctx = EvalContext {
        credentials: parent_ctx.credentials.clone(),
        auth_state: parent_ctx.auth_state.clone(),
        system: parent_ctx.system.clone(),
        extracted_data: augmented_extracted.clone(),
    };

    if let Some(expr_src) = &select.expr {
        let value = expr::eval(expr_src, &eval_ctx)?;
        return Ok(vec![value]);
    }

    if !select.select.is_empty() {
        let mut concatenated = String::new();
        for nested in &select.select {
            if let Some(Value::Array(items)) = augmented_extracted.get(&nested.name) {
                for item in items {
                    concatenated.push_str(&expr::value_to_string(item));
                }
            }
        }
        return Ok(vec![Value::String(concatenated)]);
    }

    if matches!(select.r#type, Some(SelectType::FullBody)) {
        let json_str = serde_json::to_string(&resp.body).unwrap_or_default();
        let truncated = match select.up_to {
            Some(limit) => truncate_bytes(&json_str, limit),
            None => json_str,
        };
        return Ok(vec![Value::String(truncated)]);
    }

    if matches!(select.r#type, Some(SelectType::Status)) {
        return Ok(vec![Value::from(resp.status)]);
    }

    let Some(path) = &select.path else { return Ok(Vec::new()) };
    let results = pathquery::query(&resp.body, path);
    let is_number_type = matches!(select.r#type, Some(SelectType::Number));
    let mut out = Vec::with_capacity(results.len());
    for r in results {
        if is_number_type && r.is_object() {
            out.push(r.clone());
            continue;
        }
        if let Some(coerced) = coerce(select.r#type, r) {
            out.push(coerced);
        }
    }
    Ok(out)
}

fn coerce(kind: Option<SelectType>, v: &Value) -> Option<Value> {
    match kind {
        Some(SelectType::Number) => {
            let f = match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            };
            f.filter(|f| !f.is_nan()).and_then(serde_json::Number::from_f64).map(Value::Number)
        }
        Some(SelectType::String) => {
            let s = expr::value_to_string(v);
            if s == "null" || s == "undefined" || s.is_empty() {
                None
            } else {
                Some(Value::String(s))
            }
        }
        _ => Some(v.clone()),
    }
}

fn truncate_bytes(s: &str, up_to: usize) -> String {
    if s.len() <= up_to {
        return s.to_string();
    }
    let mut end = up_to;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn dedup_preserve_order(values: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for v in values {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

fn cartesian(name_values: &[(String, Vec<Value>)]) -> Vec<BTreeMap<String, Value>> {
    let mut acc: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new()];
    for (name, values) in name_values {
        let mut next = Vec::with_capacity(acc.len() * values.len());
        for base in &acc {
            for v in values {
                let mut m = base.clone();
                m.insert(name.clone(), v.clone());
                next.push(m);
            }
        }
        acc = next;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: Value) -> Response {
        Response { status: 200, headers: BTreeMap::new(), body, full_body: String::new() }
    }

    #[test]
    fn cartesian_product_orders_first_name_slowest() {
        let name_values = vec![
            ("n1".to_string(), vec![Value::from(1), Value::from(2)]),
            ("n2".to_string(), vec![Value::String("p".into()), Value::String("q".into())]),
        ];
        let combos = cartesian(&name_values);
        let rendered: Vec<(i64, String)> = combos
            .iter()
            .map(|m| (m["n1"].as_i64().unwrap(), m["n2"].as_str().unwrap().to_string()))
            .collect();
        assert_eq!(
            rendered,
            vec![(1, "p".to_string()), (1, "q".to_string()), (2, "p".to_string()), (2, "q".to_string())]
        );
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let values = vec![Value::from(2), Value::from(1), Value::from(2), Value::from(3)];
        assert_eq!(dedup_preserve_order(values), vec![Value::from(2), Value::from(1), Value::from(3)]);
    }

    #[test]
    fn fan_out_over_wildcard_path_yields_one_child_per_value() {
        let edge = Edge {
            from: vec!["a".to_string()],
            to: vec!["b".to_string()],
            select: vec![Select {
                name: "x".to_string(),
                path: Some("$.data[*].id".to_string()),
                r#type: Some(SelectType::String),
                expr: None,
                authy: false,
                select: vec![],
                up_to: None,
            }],
            selectwhere: None,
            loadtype: None,
        };
        let mut history = ResponseHistory::default();
        history.push("a", response(serde_json::json!({"data": [{"id": "a"}, {"id": "b"}]})));

        let token_store = TokenStore::new(std::env::temp_dir().join("precog-resolver-test"));
        let parent = RequestContext::default();
        let children = resolve(&edge, "m1", &history, &parent, &token_store, false).unwrap();
        let ids: Vec<_> = children.iter().map(|c| c.extracted_data["x"].as_str().unwrap().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn zero_selects_produce_no_children() {
        let edge = Edge {
            from: vec!["a".to_string()],
            to: vec!["b".to_string()],
            select: vec![],
            selectwhere: None,
            loadtype: None,
        };
        let history = ResponseHistory::default();
        let token_store = TokenStore::new(std::env::temp_dir().join("precog-resolver-test-2"));
        let parent = RequestContext::default();
        let children = resolve(&edge, "m1", &history, &parent, &token_store, false).unwrap();
        assert!(children.is_empty());
    }

    #[test]
    fn selectwhere_gates_children_on_extracted_values() {
        let edge = Edge {
            from: vec!["a".to_string()],
            to: vec!["b".to_string()],
            select: vec![Select {
                name: "count".to_string(),
                path: Some("$.count".to_string()),
                r#type: Some(SelectType::Number),
                expr: None,
                authy: false,
                select: vec![],
                up_to: None,
            }],
            selectwhere: Some("count > 5".to_string()),
            loadtype: None,
        };
        let mut history = ResponseHistory::default();
        history.push("a", response(serde_json::json!({"count": 1})));

        let token_store = TokenStore::new(std::env::temp_dir().join("precog-resolver-test-3"));
        let parent = RequestContext::default();
        let children = resolve(&edge, "m1", &history, &parent, &token_store, false).unwrap();
        assert!(children.is_empty());
    }

    #[test]
    fn authy_value_is_not_persisted_when_extraction_yields_nothing() {
        let select = Select {
            name: "token".to_string(),
            path: Some("$.missing".to_string()),
            r#type: Some(SelectType::String),
            expr: None,
            authy: true,
            select: vec![],
            up_to: None,
        };
        let edge = Edge {
            from: vec!["a".to_string()],
            to: vec!["b".to_string()],
            select: vec![select],
            selectwhere: None,
            loadtype: None,
        };
        let mut history = ResponseHistory::default();
        history.push("a", response(serde_json::json!({"present": "value"})));

        let dir = std::env::temp_dir().join(format!("precog-resolver-test-authy-{}", std::process::id()));
        let token_store = TokenStore::new(&dir);
        let parent = RequestContext::default();
        let children = resolve(&edge, "m1", &history, &parent, &token_store, false).unwrap();
        assert!(children.is_empty());
        assert_eq!(token_store.get_authy_value("m1", "token").unwrap(), None);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn authy_access_token_select_populates_auth_state_and_system_variable() {
        let edge = Edge {
            from: vec!["token_exchange".to_string()],
            to: vec!["next".to_string()],
            select: vec![Select {
                name: "access_token".to_string(),
                path: Some("$.access_token".to_string()),
                r#type: Some(SelectType::String),
                expr: None,
                authy: true,
                select: vec![],
                up_to: None,
            }],
            selectwhere: None,
            loadtype: None,
        };
        let mut history = ResponseHistory::default();
        history.push("token_exchange", response(serde_json::json!({"access_token": "secret-tok"})));

        let dir = std::env::temp_dir().join(format!("precog-resolver-test-authy-access-token-{}", std::process::id()));
        let token_store = TokenStore::new(&dir);
        let parent = RequestContext::default();
        resolve(&edge, "m1", &history, &parent, &token_store, false).unwrap();

        assert_eq!(
            token_store.get_authy_value("m1", "access_token").unwrap(),
            Some(Value::String("secret-tok".to_string()))
        );

        let auth_state = token_store.load("m1").unwrap();
        assert_eq!(auth_state.access_token.as_deref(), Some("secret-tok"));
        assert!(!auth_state.is_token_expired(chrono::Utc::now().timestamp_millis()));

        let eval_ctx = crate::context::EvalContext {
            credentials: BTreeMap::new(),
            auth_state,
            system: crate::context::SystemVariables::default(),
            extracted_data: BTreeMap::new(),
        };
        assert_eq!(
            eval_ctx.system_variable("wsk_to_rsk_auth_token"),
            Some(Value::String("secret-tok".to_string()))
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn expression_error_on_one_source_response_empties_only_that_contribution() {
        let edge = Edge {
            from: vec!["a".to_string()],
            to: vec!["b".to_string()],
            select: vec![Select {
                name: "x".to_string(),
                path: None,
                r#type: None,
                expr: Some("missing_variable".to_string()),
                authy: false,
                select: vec![],
                up_to: None,
            }],
            selectwhere: None,
            loadtype: None,
        };
        let mut history = ResponseHistory::default();
        history.push("a", response(serde_json::json!({})));

        let token_store = TokenStore::new(std::env::temp_dir().join("precog-resolver-test-expr-err"));
        let parent = RequestContext::default();
        let children = resolve(&edge, "m1", &history, &parent, &token_store, false).unwrap();
        assert!(children.is_empty());
    }

    #[test]
    fn malformed_selectwhere_is_treated_as_non_matching_not_fatal() {
        let edge = Edge {
            from: vec!["a".to_string()],
            to: vec!["b".to_string()],
            select: vec![Select {
                name: "x".to_string(),
                path: Some("$.x".to_string()),
                r#type: Some(SelectType::Number),
                expr: None,
                authy: false,
                select: vec![],
                up_to: None,
            }],
            selectwhere: Some("totally_unresolved_name".to_string()),
            loadtype: None,
        };
        let mut history = ResponseHistory::default();
        history.push("a", response(serde_json::json!({"x": 1})));

        let token_store = TokenStore::new(std::env::temp_dir().join("precog-resolver-test-gate-err"));
        let parent = RequestContext::default();
        let children = resolve(&edge, "m1", &history, &parent, &token_store, false).unwrap();
        assert!(children.is_empty());
    }
}
