//! Graph traversal: run lifecycle, OAuth2 sub-flow, entry discovery,
//! per-request recursion, pagination control, dataset aggregation, and the
//! run summary (spec.md §4.7).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::context::{RequestContext, SystemVariables};
use crate::http_client::{self, RequestSpec, Response, ResponseHistory};
use crate::manifest::{FunctionKind, Manifest, Method, RequestDef};
use crate::oauth2::{AuthorizeOutcome, Coordinator, SystemBrowser};
use crate::resolver;
use crate::token_store::TokenStore;
use crate::{dataset, expr};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("OAuth2 authorization failed: {0}")]
    OAuth2(#[from] crate::oauth2::Error),
    #[error("token store error: {0}")]
    TokenStore(#[from] crate::token_store::Error),
    #[error("writing output dataset: {0}")]
    Dataset(#[from] dataset::Error),
    #[error("resolving dependency edge: {0}")]
    Resolver(#[from] crate::resolver::Error),
}

pub struct RunOptions {
    pub force_reauth: bool,
    pub redirect_port: u16,
    pub redirect_uri_override: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions { force_reauth: false, redirect_port: 3000, redirect_uri_override: None }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub manifest_id: String,
    pub duration: Duration,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub unique_endpoints: usize,
    pub errors: Vec<(String, String, usize)>,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "manifest: {}", self.manifest_id)?;
        writeln!(f, "duration: {:.2?}", self.duration)?;
        writeln!(f, "requests: {} total, {} successful, {} failed", self.total, self.successful, self.failed)?;
        writeln!(f, "unique endpoints: {}", self.unique_endpoints)?;
        for (request_name, message, count) in &self.errors {
            writeln!(f, "{request_name}: {message} (x{count})")?;
        }
        Ok(())
    }
}

const ERROR_MESSAGE_TRUNCATE_LEN: usize = 160;

pub struct Executor {
    client: reqwest::Client,
    token_store: TokenStore,
    output_dir: PathBuf,
    options: RunOptions,
}

impl Executor {
    pub fn new(client: reqwest::Client, token_store: TokenStore, output_dir: PathBuf, options: RunOptions) -> Self {
        Executor { client, token_store, output_dir, options }
    }

    pub async fn run(&self, manifest: &Manifest, credentials: BTreeMap<String, String>) -> Result<RunSummary, Error> {
        let started = Instant::now();

        if self.options.force_reauth {
            self.token_store.clear(&manifest.id)?;
        }
        let mut auth_state = self.token_store.load(&manifest.id)?;

        let oauth2_request = manifest.reqs.iter().find(|r| r.function == Some(FunctionKind::InteractiveOAuth2Authorization));
        // `"env"` is synonymous with "the OAuth2 authorization request" in manifests that
        // don't mark a request with `function` (spec.md §9) — either spelling resolves
        // to the same authorization-request name for exclusion purposes below.
        let auth_request_name: Option<String> =
            oauth2_request.map(|r| r.name.clone()).or_else(|| manifest.request("env").map(|r| r.name.clone()));
        let manifest_wants_oauth2 = auth_request_name.is_some();

        let now = chrono::Utc::now().timestamp_millis();
        let needs_oauth2_run = manifest_wants_oauth2 && (auth_state.access_token.is_none() || auth_state.is_token_expired(now));

        let coordinator = Coordinator::new(self.options.redirect_port, self.options.redirect_uri_override.clone());

        if needs_oauth2_run {
            let name = auth_request_name.as_deref().unwrap_or("env");
            self.run_oauth2_subflow(manifest, name, &coordinator).await?;
            auth_state = self.token_store.load(&manifest.id)?;
        }

        let excluded = auth_request_name.as_deref().map(|name| oauth2_adjacent(manifest, name)).unwrap_or_default();

        let entries = entry_requests(manifest, &excluded);

        let system = SystemVariables {
            precog_root_uri: Some(coordinator.redirect_uri()),
            precog_redirect_uri: Some(coordinator.redirect_uri()),
            wsk_to_rsk_redirect_uri: Some(coordinator.redirect_uri()),
            precog_state: None,
            wsk_to_rsk_oauth2_code: None,
        };
        let initial_ctx = RequestContext { credentials, auth_state, system, extracted_data: BTreeMap::new() };

        let mut history = ResponseHistory::default();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut total = 0usize;
        let mut successful = 0usize;
        let mut failed = 0usize;
        let mut errors: BTreeMap<(String, String), usize> = BTreeMap::new();

        let mut stack: Vec<(String, RequestContext)> = Vec::new();
        for entry in entries.iter().rev() {
            stack.push((entry.name.clone(), initial_ctx.clone()));
        }

        while let Some((name, ctx)) = stack.pop() {
            let Some(request) = manifest.request(&name) else { continue };
            if request.function.is_some() {
                continue;
            }
            let Some(url_template) = &request.url else { continue };

            let full_eval = ctx.as_eval();
            let url = expr::interpolate_lenient(url_template, &full_eval);
            if url.contains("{{") {
                log::debug!("skipping `{name}`: unresolved template variables in URL");
                continue;
            }

            let url_key = format!("{name}:{url}");
            if visited.contains(&url_key) {
                continue;
            }
            visited.insert(url_key);
            total += 1;

            let transformers: Vec<_> = request
                .transformers
                .iter()
                .filter_map(|t| manifest.transformer(t))
                .collect();
            let body_template = request.body.as_ref();
            let headers = request.headers.as_ref();

            let spec = RequestSpec {
                request_name: &name,
                url: &url,
                method: request.method,
                body_template,
                request_headers: headers,
                transformers: transformers.clone(),
            };

            match http_client::request(&self.client, spec, &full_eval).await {
                Ok(response) => {
                    successful += 1;
                    // A `reauthwhere` match means the access token this response was
                    // issued against is no longer good; clearing the store here is what
                    // makes the *next* run's `needs_oauth2_run` check (driven by
                    // `isTokenExpired`/a missing access token) re-enter the interactive
                    // flow instead of replaying a token the server has already rejected.
                    if http_client::should_reauth(&transformers, &response, &full_eval) {
                        log::warn!("response from `{name}` matched a reauth condition; clearing token store for `{}`", manifest.id);
                        self.token_store.clear(&manifest.id)?;
                    }
                    history.push(name.clone(), response);
                    self.expand_children(manifest, &name, &ctx, &mut history, &mut stack)?;
                }
                Err(e) => {
                    failed += 1;
                    log::error!("request `{name}` failed: {e}");
                    let message = truncate(&e.to_string(), ERROR_MESSAGE_TRUNCATE_LEN);
                    *errors.entry((name.clone(), message)).or_insert(0) += 1;
                }
            }
        }

        let aggregated = dataset::aggregate(manifest, &history);
        dataset::write_all(&self.output_dir, &aggregated)?;

        let unique_endpoints = visited.len();
        let errors: Vec<_> = errors.into_iter().map(|((name, msg), count)| (name, msg, count)).collect();

        Ok(RunSummary {
            manifest_id: manifest.id.clone(),
            duration: started.elapsed(),
            total,
            successful,
            failed,
            unique_endpoints,
            errors,
        })
    }

    fn expand_children(
        &self,
        manifest: &Manifest,
        name: &str,
        ctx: &RequestContext,
        history: &mut ResponseHistory,
        stack: &mut Vec<(String, RequestContext)>,
    ) -> Result<(), Error> {
        let mut pending: Vec<(String, RequestContext)> = Vec::new();

        for edge in manifest.edges_from(name) {
            if edge.loadtype.map(|lt| lt.is_delta()).unwrap_or(false) {
                continue;
            }

            // A pagination edge is self-referencing: the same `_paged`-named request
            // appears in both `to` and `from` of this edge (spec.md §4.7.4 step 8).
            let is_pagination_edge = edge.to.iter().any(|t| t.contains("_paged") && edge.from.contains(t));
            let latest_only = if is_pagination_edge {
                let next_is_empty = history
                    .get(name)
                    .and_then(|responses| responses.last())
                    .map(|r| pagination_exhausted(&r.body))
                    .unwrap_or(true);
                if next_is_empty {
                    continue;
                }
                true
            } else {
                false
            };

            // The resolver only returns `Err` for a token-store I/O failure (an
            // `ExpressionError` is already absorbed internally); that is fatal per
            // spec.md §7 and propagates out of the run rather than being swallowed here.
            let children = resolver::resolve(edge, &manifest.id, history, ctx, &self.token_store, latest_only)?;

            if children.is_empty() {
                continue;
            }

            let refreshed_auth = self.token_store.load(&manifest.id)?;
            for mut child in children {
                child.auth_state = refreshed_auth.clone();
                for to_name in &edge.to {
                    pending.push((to_name.clone(), child.clone()));
                }
            }
        }

        for item in pending.into_iter().rev() {
            stack.push(item);
        }
        Ok(())
    }

    async fn run_oauth2_subflow(
        &self,
        manifest: &Manifest,
        auth_request_name: &str,
        coordinator: &Coordinator<SystemBrowser>,
    ) -> Result<(), Error> {
        let state = crate::oauth2::generate_state();
        let system = SystemVariables {
            precog_root_uri: Some(coordinator.redirect_uri()),
            precog_redirect_uri: Some(coordinator.redirect_uri()),
            wsk_to_rsk_redirect_uri: Some(coordinator.redirect_uri()),
            precog_state: Some(state.clone()),
            wsk_to_rsk_oauth2_code: None,
        };
        let mut subflow_ctx = RequestContext { credentials: BTreeMap::new(), auth_state: Default::default(), system, extracted_data: BTreeMap::new() };

        let authorize_url_template = manifest
            .request(auth_request_name)
            .and_then(|r| r.args.as_ref())
            .and_then(|args| args.get("authorizeUrl"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let outcome: AuthorizeOutcome = coordinator.authorize(&authorize_url_template, &subflow_ctx.as_eval()).await?;
        subflow_ctx.system.wsk_to_rsk_oauth2_code = Some(outcome.code.clone());

        let synthetic_body = serde_json::json!({"query": {"code": outcome.code, "state": outcome.state}});
        let synthetic = Response {
            status: 200,
            headers: BTreeMap::new(),
            full_body: synthetic_body.to_string(),
            body: synthetic_body,
        };

        let mut history = ResponseHistory::default();
        history.push("env", synthetic.clone());
        history.push(auth_request_name.to_string(), synthetic);

        for edge in manifest.edges_from(auth_request_name) {
            let children = resolver::resolve(edge, &manifest.id, &history, &subflow_ctx, &self.token_store, false)?;
            for child in &children {
                for to_name in &edge.to {
                    if let Some(response) = self.execute_token_exchange(manifest, to_name, child).await {
                        history.push(to_name.clone(), response);
                        for inner_edge in manifest.edges_from(to_name) {
                            // Run selects for their side effects (authy persistence) without executing targets.
                            resolver::resolve(inner_edge, &manifest.id, &history, child, &self.token_store, false)?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn execute_token_exchange(&self, manifest: &Manifest, name: &str, ctx: &RequestContext) -> Option<Response> {
        let request = manifest.request(name)?;
        let url_template = request.url.as_ref()?;
        let eval_ctx = ctx.as_eval();
        let url = expr::interpolate_lenient(url_template, &eval_ctx);
        let transformers: Vec<_> = request.transformers.iter().filter_map(|t| manifest.transformer(t)).collect();
        let spec = RequestSpec {
            request_name: name,
            url: &url,
            method: request.method,
            body_template: request.body.as_ref(),
            request_headers: request.headers.as_ref(),
            transformers,
        };
        match http_client::request(&self.client, spec, &eval_ctx).await {
            Ok(resp) => Some(resp),
            Err(e) => {
                log::error!("token exchange request `{name}` failed: {e}");
                None
            }
        }
    }
}

fn oauth2_adjacent(manifest: &Manifest, auth_request_name: &str) -> BTreeSet<String> {
    let mut set = BTreeSet::new();
    set.insert(auth_request_name.to_string());
    for edge in manifest.edges_from(auth_request_name) {
        for to_name in &edge.to {
            set.insert(to_name.clone());
        }
    }
    set
}

fn entry_requests<'a>(manifest: &'a Manifest, excluded: &BTreeSet<String>) -> Vec<&'a RequestDef> {
    manifest
        .reqs
        .iter()
        .filter(|r| {
            let Some(url) = &r.url else { return false };
            if url.contains("{{") {
                return false;
            }
            if let Some(headers) = &r.headers {
                if headers.values().any(|v| v.contains("{{")) {
                    return false;
                }
            }
            if r.name == "env" {
                return false;
            }
            !excluded.contains(&r.name)
        })
        .collect()
}

fn pagination_exhausted(body: &Value) -> bool {
    match body.get("next") {
        None => true,
        Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
