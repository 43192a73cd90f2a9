//! Credential resolution from the environment (spec.md §6).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::manifest::CredentialField;

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing required environment variable(s): {0}")]
    MissingCredentials(String),
}

/// `.env.local`, if present in the working directory, is loaded before the
/// environment is read. A missing file is not an error.
pub fn load_dotenv_local() {
    match dotenvy::from_filename(".env.local") {
        Ok(_) => log::debug!("loaded .env.local"),
        Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to load .env.local: {e}"),
    }
}

/// Uppercases a credential field name and collapses whitespace runs to a
/// single underscore: `"API Key"` -> `"API_KEY"`.
pub fn env_var_name(field: &str) -> String {
    WHITESPACE_RUN.replace_all(&field.to_uppercase(), "_").into_owned()
}

/// Resolves every field in `configSchema` from the environment. Fields
/// marked `sensitive` are required; missing ones are collected and reported
/// together rather than failing on the first miss.
pub fn resolve_credentials(schema: &BTreeMap<String, CredentialField>) -> Result<BTreeMap<String, String>, Error> {
    let mut resolved = BTreeMap::new();
    let mut missing = Vec::new();

    for (field, spec) in schema {
        let env_name = env_var_name(field);
        match std::env::var(&env_name) {
            Ok(value) => {
                resolved.insert(field.clone(), value);
            }
            Err(_) if spec.sensitive => missing.push(env_name),
            Err(_) => {}
        }
    }

    if !missing.is_empty() {
        missing.sort();
        return Err(Error::MissingCredentials(missing.join(", ")));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_name_uppercases_and_collapses_whitespace() {
        assert_eq!(env_var_name("API Key"), "API_KEY");
        assert_eq!(env_var_name("Client   Secret"), "CLIENT_SECRET");
    }

    #[test]
    fn missing_sensitive_field_is_reported() {
        let mut schema = BTreeMap::new();
        schema.insert("Nonexistent Field XYZ".to_string(), CredentialField { description: String::new(), sensitive: true });
        let err = resolve_credentials(&schema).unwrap_err();
        assert!(matches!(err, Error::MissingCredentials(_)));
    }

    #[test]
    fn missing_non_sensitive_field_is_ignored() {
        let mut schema = BTreeMap::new();
        schema.insert("Nonexistent Optional XYZ".to_string(), CredentialField { description: String::new(), sensitive: false });
        let resolved = resolve_credentials(&schema).unwrap();
        assert!(!resolved.contains_key("Nonexistent Optional XYZ"));
    }
}
