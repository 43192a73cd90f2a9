//! Aggregates executed responses into the named output datasets and writes
//! them as pretty-printed JSON arrays (spec.md §4.7.5, §6).

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::http_client::ResponseHistory;
use crate::manifest::Manifest;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("writing dataset file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing dataset: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn aggregate(manifest: &Manifest, history: &ResponseHistory) -> Vec<(String, Vec<Value>)> {
    manifest
        .datasets
        .iter()
        .map(|dataset| {
            let mut rows = Vec::new();
            for source in &dataset.data {
                let Some(responses) = history.get(source) else { continue };
                for resp in responses {
                    match resp.body.get("results").and_then(Value::as_array) {
                        Some(results) => rows.extend(results.iter().cloned()),
                        None => rows.push(resp.body.clone()),
                    }
                }
            }
            (dataset.name.clone(), rows)
        })
        .collect()
}

pub fn write_all(output_dir: &Path, datasets: &[(String, Vec<Value>)]) -> Result<Vec<PathBuf>, Error> {
    let mut written = Vec::new();
    for (name, rows) in datasets {
        if rows.is_empty() {
            log::debug!("skipping empty dataset `{name}`");
            continue;
        }
        let path = output_dir.join(slugify(name));
        let body = serde_json::to_string_pretty(rows)?;
        std::fs::write(&path, body).map_err(|source| Error::Io { path: path.clone(), source })?;
        log::info!("wrote dataset `{name}` ({} rows) to {}", rows.len(), path.display());
        written.push(path);
    }
    Ok(written)
}

fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut slug = String::with_capacity(lowered.len() + 5);
    let mut last_was_space = false;
    for c in lowered.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                slug.push('_');
            }
            last_was_space = true;
        } else {
            slug.push(c);
            last_was_space = false;
        }
    }
    slug.push_str(".json");
    slug
}
