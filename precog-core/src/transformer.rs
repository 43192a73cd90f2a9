//! Transformer definitions and the three response classifiers plus the one
//! request mutator described in spec.md §4.3.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::EvalContext;
use crate::expr;

const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;
const DEFAULT_MAX_WAIT_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("evaluating transformer condition: {0}")]
    Expr(#[from] expr::Error),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Condition {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryWhere {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default, rename = "initialDelay")]
    pub initial_delay: Option<u64>,
    #[serde(default, rename = "maxWait")]
    pub max_wait: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Transformer {
    pub name: String,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub ratelimits: Option<Value>,
    #[serde(default)]
    pub retrywhere: Option<RetryWhere>,
    #[serde(default)]
    pub failwhere: Option<Vec<Condition>>,
    #[serde(default)]
    pub reauthwhere: Option<Vec<Condition>>,
}

/// A response reduced to the fields the classifiers and `applyToRequest`
/// match against.
pub struct ClassifyInput<'a> {
    pub status: u16,
    pub body: &'a Value,
}

pub enum RetryDecision {
    No,
    Yes { delay_ms: u64 },
}

pub struct FailDecision {
    pub message: String,
}

fn condition_matches(cond: &Condition, input: &ClassifyInput, ctx: &EvalContext) -> bool {
    if let Some(status) = cond.status {
        if status == input.status {
            return true;
        }
    }
    if let Some(expr_src) = &cond.expr {
        let augmented = ctx.as_eval_augmented_for_classify(input);
        if let Ok(v) = expr::eval(expr_src, &augmented) {
            return expr::truthy(&v);
        }
    }
    false
}

trait EvalContextExt {
    fn as_eval_augmented_for_classify(&self, input: &ClassifyInput) -> EvalContext;
}

impl EvalContextExt for EvalContext {
    fn as_eval_augmented_for_classify(&self, input: &ClassifyInput) -> EvalContext {
        let mut augmented = self.clone();
        augmented.extracted_data.insert("response".to_string(), input.body.clone());
        augmented.extracted_data.insert("status".to_string(), Value::from(input.status));
        augmented
    }
}

pub fn apply_to_request(
    transformers: &[&Transformer],
    ctx: &EvalContext,
    headers: &mut BTreeMap<String, String>,
) -> Result<(), Error> {
    for t in transformers {
        if let Some(t_headers) = &t.headers {
            for (k, v) in t_headers {
                let interpolated = expr::interpolate(v, ctx).unwrap_or_else(|_| v.clone());
                headers.insert(k.clone(), interpolated);
            }
        }
    }
    Ok(())
}

pub fn should_retry(
    transformers: &[&Transformer],
    input: &ClassifyInput,
    ctx: &EvalContext,
    attempt: u32,
) -> RetryDecision {
    for t in transformers {
        let Some(retrywhere) = &t.retrywhere else { continue };
        for cond in &retrywhere.conditions {
            if condition_matches(cond, input, ctx) {
                let retries = retrywhere.retries.unwrap_or(DEFAULT_RETRIES);
                if attempt >= retries {
                    return RetryDecision::No;
                }
                let initial = retrywhere.initial_delay.unwrap_or(DEFAULT_INITIAL_DELAY_MS);
                let max_wait = retrywhere.max_wait.unwrap_or(DEFAULT_MAX_WAIT_MS);
                let delay = initial.saturating_mul(1u64 << attempt.saturating_sub(1).min(62));
                return RetryDecision::Yes { delay_ms: delay.min(max_wait) };
            }
        }
    }
    RetryDecision::No
}

pub fn should_reauth(transformers: &[&Transformer], input: &ClassifyInput, ctx: &EvalContext) -> bool {
    transformers.iter().any(|t| {
        t.reauthwhere
            .as_ref()
            .map(|conds| conds.iter().any(|c| condition_matches(c, input, ctx)))
            .unwrap_or(false)
    })
}

pub fn should_fail(transformers: &[&Transformer], input: &ClassifyInput, ctx: &EvalContext) -> Option<FailDecision> {
    for t in transformers {
        let Some(failwhere) = &t.failwhere else { continue };
        for cond in failwhere {
            if condition_matches(cond, input, ctx) {
                let message = cond.message.clone().unwrap_or_else(|| "fail condition triggered".to_string());
                return Some(FailDecision { message });
            }
        }
    }
    None
}
