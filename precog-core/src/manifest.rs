//! The manifest data model (spec.md §3) — loaded once, read-only for the run.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reading manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing manifest json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest missing required field `{0}`")]
    MissingField(&'static str),
    #[error("select `{0}` on edge must have at least one of path, expr, or a derived type")]
    InvalidSelect(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CredentialField {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sensitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadType {
    Initial,
    Delta,
}

impl LoadType {
    pub fn is_delta(&self) -> bool {
        matches!(self, LoadType::Delta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum FunctionKind {
    #[serde(rename = "interactiveOAuth2Authorization")]
    InteractiveOAuth2Authorization,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestDef {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub transformers: Vec<String>,
    #[serde(default)]
    pub function: Option<FunctionKind>,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub loadtype: Option<LoadType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectType {
    String,
    Number,
    Status,
    #[serde(rename = "full-body")]
    FullBody,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Select {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, rename = "type")]
    pub r#type: Option<SelectType>,
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub authy: bool,
    #[serde(default)]
    pub select: Vec<Select>,
    #[serde(default, rename = "up-to")]
    pub up_to: Option<usize>,
}

impl Select {
    fn validate(&self) -> Result<(), Error> {
        let has_derived_type = matches!(self.r#type, Some(SelectType::Status) | Some(SelectType::FullBody));
        if self.path.is_none() && self.expr.is_none() && !has_derived_type && self.select.is_empty() {
            return Err(Error::InvalidSelect(self.name.clone()));
        }
        for nested in &self.select {
            nested.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Edge {
    pub from: Vec<String>,
    pub to: Vec<String>,
    #[serde(default)]
    pub select: Vec<Select>,
    #[serde(default)]
    pub selectwhere: Option<String>,
    #[serde(default)]
    pub loadtype: Option<LoadType>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Dataset {
    pub name: String,
    pub data: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    pub id: String,
    #[serde(default, rename = "configSchema")]
    pub config_schema: BTreeMap<String, CredentialField>,
    #[serde(default)]
    pub transformers: Vec<crate::transformer::Transformer>,
    pub reqs: Vec<RequestDef>,
    #[serde(default)]
    pub deps: Vec<Edge>,
    pub datasets: Vec<Dataset>,
}

impl Manifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let raw: Value = serde_json::from_str(text)?;
        if raw.get("id").is_none() {
            return Err(Error::MissingField("id"));
        }
        if raw.get("reqs").is_none() {
            return Err(Error::MissingField("reqs"));
        }
        if raw.get("datasets").is_none() {
            return Err(Error::MissingField("datasets"));
        }
        let manifest: Manifest = serde_json::from_value(raw)?;
        for edge in &manifest.deps {
            for select in &edge.select {
                select.validate()?;
            }
        }
        Ok(manifest)
    }

    pub fn request(&self, name: &str) -> Option<&RequestDef> {
        self.reqs.iter().find(|r| r.name == name)
    }

    pub fn transformer(&self, name: &str) -> Option<&crate::transformer::Transformer> {
        self.transformers.iter().find(|t| t.name == name)
    }

    pub fn edges_from(&self, name: &str) -> impl Iterator<Item = &Edge> {
        self.deps.iter().filter(move |e| e.from.iter().any(|f| f == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_id() {
        let err = Manifest::parse(r#"{"reqs": [], "datasets": []}"#).unwrap_err();
        assert!(matches!(err, Error::MissingField("id")));
    }

    #[test]
    fn parses_minimal_manifest() {
        let text = r#"{
            "id": "m1",
            "reqs": [{"name": "items", "url": "https://ex/api/items"}],
            "datasets": [{"name": "Items", "data": ["items"]}]
        }"#;
        let m = Manifest::parse(text).unwrap();
        assert_eq!(m.id, "m1");
        assert_eq!(m.reqs.len(), 1);
        assert_eq!(m.reqs[0].method, Method::Get);
    }

    #[test]
    fn select_requires_path_expr_or_derived_type() {
        let select = Select {
            name: "x".into(),
            path: None,
            r#type: None,
            expr: None,
            authy: false,
            select: vec![],
            up_to: None,
        };
        assert!(select.validate().is_err());
    }
}
