//! Issues a single manifest-declared HTTP request, driven by the transformer
//! pipeline's classifiers, with per-attempt backoff.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::context::EvalContext;
use crate::expr;
use crate::manifest::Method;
use crate::transformer::{self, ClassifyInput, Transformer};

const MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("request `{request_name}` failed: {message}")]
    FailCondition { request_name: String, message: String },
    #[error(transparent)]
    Expr(#[from] expr::Error),
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub full_body: String,
}

/// Append-only `name -> responses` map, live for the duration of a run. The
/// only reader outside the executor is the resolver.
#[derive(Debug, Default)]
pub struct ResponseHistory {
    by_name: BTreeMap<String, Vec<Response>>,
}

impl ResponseHistory {
    pub fn push(&mut self, name: impl Into<String>, response: Response) {
        self.by_name.entry(name.into()).or_default().push(response);
    }

    pub fn get(&self, name: &str) -> Option<&Vec<Response>> {
        self.by_name.get(name)
    }
}

pub struct RequestSpec<'a> {
    pub request_name: &'a str,
    pub url: &'a str,
    pub method: Method,
    pub body_template: Option<&'a Value>,
    pub request_headers: Option<&'a BTreeMap<String, String>>,
    pub transformers: Vec<&'a Transformer>,
}

pub async fn request(client: &reqwest::Client, spec: RequestSpec<'_>, ctx: &EvalContext) -> Result<Response, Error> {
    let body = match spec.body_template {
        Some(template) => Some(interpolate_body(template, ctx)?),
        None => None,
    };

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    if let Some(request_headers) = spec.request_headers {
        for (k, v) in request_headers {
            let interpolated = expr::interpolate(v, ctx)?;
            headers.insert(k.clone(), interpolated);
        }
    }
    transformer::apply_to_request(&spec.transformers, ctx, &mut headers)?;

    let mut attempt: u32 = 1;
    loop {
        log::info!("issuing {:?} {} (attempt {})", spec.method, spec.url, attempt);
        let mut builder = client.request(spec.method.as_reqwest(), spec.url);
        for (k, v) in &headers {
            builder = builder.header(k, v);
        }
        if let Some(b) = &body {
            builder = builder.json(b);
        }

        let send_result = builder.send().await;
        let resp = match send_result {
            Ok(resp) => resp,
            Err(e) => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(Error::Transport { attempts: attempt, source: e });
                }
                let delay = backoff_ms(attempt);
                log::warn!("transport error on `{}`, retrying in {}ms: {}", spec.request_name, delay, e);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
                continue;
            }
        };

        let status = resp.status().as_u16();
        let resp_headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let is_json = resp_headers
            .get("content-type")
            .map(|v| v.contains("application/json"))
            .unwrap_or(false);
        let full_body = resp.text().await.map_err(|e| Error::Transport { attempts: attempt, source: e })?;
        log::trace!("response headers for `{}`: {:?}", spec.request_name, resp_headers);
        let parsed_body = if is_json {
            serde_json::from_str(&full_body).unwrap_or(Value::String(full_body.clone()))
        } else {
            Value::String(full_body.clone())
        };

        let classify_input = ClassifyInput { status, body: &parsed_body };

        if let Some(fail) = transformer::should_fail(&spec.transformers, &classify_input, ctx) {
            return Err(Error::FailCondition { request_name: spec.request_name.to_string(), message: fail.message });
        }

        match transformer::should_retry(&spec.transformers, &classify_input, ctx, attempt) {
            transformer::RetryDecision::Yes { delay_ms } => {
                log::warn!("retrying `{}` in {}ms (attempt {})", spec.request_name, delay_ms, attempt);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
                continue;
            }
            transformer::RetryDecision::No => {}
        }

        return Ok(Response { status, headers: resp_headers, body: parsed_body, full_body });
    }
}

fn interpolate_body(template: &Value, ctx: &EvalContext) -> Result<Value, expr::Error> {
    match template {
        Value::String(s) => Ok(Value::String(expr::interpolate(s, ctx)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_body(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_body(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn backoff_ms(attempt: u32) -> u64 {
    1000u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(32))
}

pub fn should_reauth(transformers: &[&Transformer], response: &Response, ctx: &EvalContext) -> bool {
    let input = ClassifyInput { status: response.status, body: &response.body };
    transformer::should_reauth(transformers, &input, ctx)
}
