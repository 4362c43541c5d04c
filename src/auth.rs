//! Credential source for `--authenticate`. A credentials file is JSON with
//! an optional expected user and a required secret; when no file is named,
//! the ambient default location is probed the way cloud SDKs resolve
//! application-default credentials.

use serde::Deserialize;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub user: Option<String>,
    pub secret: String,
}

impl Credentials {
    pub fn load(path: &str) -> Result<Credentials, String> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read credentials file {path}: {e}"))?;
        serde_json::from_str(&data).map_err(|e| format!("malformed credentials file {path}: {e}"))
    }

    /// Resolve the credential source: explicit file first, ambient default
    /// otherwise. Returns an error when authentication is required but no
    /// source resolves.
    pub fn resolve(explicit: Option<&str>) -> Result<Credentials, String> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match ambient_credentials_path() {
            Some(path) => Self::load(&path),
            None => Err(
                "no credentials file specified and no ambient default credentials found"
                    .to_string(),
            ),
        }
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        if let Some(ref expected_user) = self.user {
            if expected_user != user {
                debug!("credential user mismatch for {user}");
                return false;
            }
        }
        self.secret == password
    }
}

/// The ambient default credentials location: `$PGBRIDGE_CREDENTIALS`, else
/// `~/.config/pgbridge/credentials.json` when that file exists.
pub fn ambient_credentials_path() -> Option<String> {
    if let Ok(path) = std::env::var("PGBRIDGE_CREDENTIALS") {
        if !path.is_empty() {
            return Some(path);
        }
    }
    let default: PathBuf = dirs::home_dir()?
        .join(".config")
        .join("pgbridge")
        .join("credentials.json");
    if default.exists() {
        Some(default.to_string_lossy().into_owned())
    } else {
        None
    }
}
