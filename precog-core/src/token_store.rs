//! Persists authentication state per manifest identity under `.credentials/`.
//!
//! One JSON document per manifest id, written atomically (write to a temp
//! file, then rename into place) so a crash never leaves a half-written
//! document. Readers treat an absent file as an empty store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

const EXPIRY_SAFETY_MARGIN_MS: i64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reading token store: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing token store document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AuthState {
    #[serde(default, rename = "accessToken", skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, rename = "refreshToken", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, rename = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, rename = "authyValues")]
    pub authy_values: BTreeMap<String, Value>,
}

impl AuthState {
    pub fn is_token_expired(&self, now_millis: i64) -> bool {
        match &self.access_token {
            None => true,
            Some(_) => match self.expires_at {
                Some(expires_at) => now_millis >= expires_at,
                None => false,
            },
        }
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }
}

pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        TokenStore { dir: dir.into() }
    }

    fn path_for(&self, manifest_id: &str) -> PathBuf {
        self.dir.join(format!("{manifest_id}.json"))
    }

    pub fn load(&self, manifest_id: &str) -> Result<AuthState, Error> {
        let path = self.path_for(manifest_id);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AuthState::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, manifest_id: &str, state: &AuthState) -> Result<(), Error> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(manifest_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        log::debug!("wrote token store document for manifest `{manifest_id}`");
        Ok(())
    }

    pub fn clear(&self, manifest_id: &str) -> Result<(), Error> {
        let path = self.path_for(manifest_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_authy_value(&self, manifest_id: &str, name: &str, value: Value) -> Result<(), Error> {
        let mut state = self.load(manifest_id)?;
        state.authy_values.insert(name.to_string(), value);
        self.save(manifest_id, &state)
    }

    pub fn get_authy_value(&self, manifest_id: &str, name: &str) -> Result<Option<Value>, Error> {
        Ok(self.load(manifest_id)?.authy_values.get(name).cloned())
    }

    pub fn update_access_token(
        &self,
        manifest_id: &str,
        token: &str,
        ttl_seconds: Option<i64>,
        now_millis: i64,
    ) -> Result<(), Error> {
        let mut state = self.load(manifest_id)?;
        state.access_token = Some(token.to_string());
        state.expires_at = ttl_seconds.map(|ttl| now_millis + (ttl * 1000 - EXPIRY_SAFETY_MARGIN_MS));
        self.save(manifest_id, &state)
    }

    pub fn update_refresh_token(&self, manifest_id: &str, token: &str) -> Result<(), Error> {
        let mut state = self.load(manifest_id)?;
        state.refresh_token = Some(token.to_string());
        self.save(manifest_id, &state)
    }
}

impl AsRef<Path> for TokenStore {
    fn as_ref(&self) -> &Path {
        &self.dir
    }
}
