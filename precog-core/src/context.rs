//! Request contexts: the bag of bindings carried along a traversal path.
//!
//! Contexts are copy-on-extend value types — a child is built by cloning its
//! parent and layering new `extractedData` bindings on top; a child never
//! mutates its parent's fields.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::token_store::AuthState;

/// System variables seeded once at the start of a run (§4.7.3) plus the
/// handful set during the OAuth2 sub-flow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemVariables {
    pub precog_root_uri: Option<String>,
    pub precog_redirect_uri: Option<String>,
    pub wsk_to_rsk_redirect_uri: Option<String>,
    pub precog_state: Option<String>,
    pub wsk_to_rsk_oauth2_code: Option<String>,
}

/// The credentials + auth state + system variables + extracted data bag
/// threaded through the dependency graph. Equivalent in shape to
/// [`EvalContext`] but owned by the executor/resolver across recursion.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub credentials: BTreeMap<String, String>,
    pub auth_state: AuthState,
    pub system: SystemVariables,
    pub extracted_data: BTreeMap<String, Value>,
}

impl RequestContext {
    /// Builds a child context: all fields are structurally copied, then the
    /// given bindings are layered into `extractedData`, overriding any
    /// parent binding of the same name.
    pub fn extend(&self, bindings: impl IntoIterator<Item = (String, Value)>) -> RequestContext {
        let mut child = self.clone();
        for (name, value) in bindings {
            child.extracted_data.insert(name, value);
        }
        child
    }

    pub fn as_eval(&self) -> EvalContext {
        EvalContext {
            credentials: self.credentials.clone(),
            auth_state: self.auth_state.clone(),
            system: self.system.clone(),
            extracted_data: self.extracted_data.clone(),
        }
    }

    /// A variant of [`Self::as_eval`] with extra bindings layered on top
    /// (e.g. `extractedData.response`/`extractedData.status` for classifier
    /// matching), without mutating `self`.
    pub fn as_eval_augmented(&self, extra: impl IntoIterator<Item = (String, Value)>) -> EvalContext {
        let mut eval = self.as_eval();
        for (name, value) in extra {
            eval.extracted_data.insert(name, value);
        }
        eval
    }
}

/// The read-only view handed to [`crate::expr`] for variable resolution and
/// evaluation. Cheaper to construct ad hoc than threading `RequestContext`
/// everywhere expressions are evaluated against an augmented view.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub credentials: BTreeMap<String, String>,
    pub auth_state: AuthState,
    pub system: SystemVariables,
    pub extracted_data: BTreeMap<String, Value>,
}

impl EvalContext {
    /// Resolves the reserved system-variable set (§4.1 item 1). Several of
    /// these are derived from credentials/auth state rather than stored
    /// directly on `SystemVariables`.
    pub fn system_variable(&self, name: &str) -> Option<Value> {
        match name {
            "precog_state" => self.system.precog_state.clone().map(Value::String),
            "precog_root_uri" => self.system.precog_root_uri.clone().map(Value::String),
            "precog_redirect_uri" => self.system.precog_redirect_uri.clone().map(Value::String),
            "wsk_to_rsk_redirect_uri" => self.system.wsk_to_rsk_redirect_uri.clone().map(Value::String),
            "wsk_to_rsk_client_id" => self.credentials.get("Client Id").cloned().map(Value::String),
            "wsk_to_rsk_client_secret" => self.credentials.get("Client Secret").cloned().map(Value::String),
            "wsk_to_rsk_oauth2_code" => self.system.wsk_to_rsk_oauth2_code.clone().map(Value::String),
            "wsk_to_rsk_auth_token" => self.auth_state.access_token.clone().map(Value::String),
            "wsk_to_rsk_refresh_token" => self.auth_state.refresh_token.clone().map(Value::String),
            _ => None,
        }
    }

    pub fn authy_value(&self, name: &str) -> Option<Value> {
        self.auth_state.authy_values.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_parent_and_overrides_extracted_data() {
        let mut parent = RequestContext::default();
        parent.extracted_data.insert("a".to_string(), Value::from(1));
        parent.credentials.insert("k".to_string(), "v".to_string());

        let child = parent.extend([("a".to_string(), Value::from(2)), ("b".to_string(), Value::from(3))]);

        assert_eq!(parent.extracted_data.get("a"), Some(&Value::from(1)));
        assert_eq!(child.extracted_data.get("a"), Some(&Value::from(2)));
        assert_eq!(child.extracted_data.get("b"), Some(&Value::from(3)));
        assert_eq!(child.credentials.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn client_id_resolves_from_credentials() {
        let mut ctx = EvalContext::default();
        ctx.credentials.insert("Client Id".to_string(), "abc123".to_string());
        assert_eq!(ctx.system_variable("wsk_to_rsk_client_id"), Some(Value::String("abc123".into())));
    }

    #[test]
    fn auth_token_resolves_from_auth_state() {
        let mut ctx = EvalContext::default();
        ctx.auth_state.access_token = Some("tok".to_string());
        assert_eq!(ctx.system_variable("wsk_to_rsk_auth_token"), Some(Value::String("tok".into())));
    }
}
