// src/config.rs

//! Configuration and credential loading.
//!
//! Application settings live in `config.toml`; secrets live in a separate
//! credentials file keyed by the `credential` reference of each source:
//!
//! ```toml
//! [lj_main]
//! username = "writer"
//! password = "hunter2"
//!
//! [twitter]
//! token = "AAAA..."
//!
//! [da]
//! client_id = "1234"
//! client_secret = "abcd"
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, FetchError, Result};
use crate::models::{Config, Source, SourceKind};

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file is missing or unreadable.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_or_default(path);
    config.validate()?;
    Ok(config)
}

/// Secrets for one credential reference. Which fields are needed depends on
/// the platform.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Self::default()
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn client(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            client_secret: Some(client_secret.into()),
            ..Self::default()
        }
    }

    /// Names of the fields a platform needs.
    pub fn required_fields(kind: SourceKind) -> &'static [&'static str] {
        match kind {
            SourceKind::Journal => &["username", "password"],
            SourceKind::Microblog => &["token"],
            SourceKind::ArtShare => &["client_id", "client_secret"],
        }
    }

    fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "username" => &self.username,
            "password" => &self.password,
            "token" => &self.token,
            "client_id" => &self.client_id,
            "client_secret" => &self.client_secret,
            _ => return None,
        };
        value.as_deref().filter(|v| !v.trim().is_empty())
    }

    /// A required field, or an auth failure naming the credential reference.
    pub fn require(&self, reference: &str, name: &str) -> std::result::Result<&str, FetchError> {
        self.field(name).ok_or_else(|| {
            FetchError::Auth(format!("credential '{reference}' has no {name}"))
        })
    }

    /// Check that every field the platform needs is present.
    pub fn check(&self, kind: SourceKind, reference: &str) -> std::result::Result<(), FetchError> {
        for name in Self::required_fields(kind) {
            self.require(reference, name)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("token", &redact(&self.token))
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .finish()
    }
}

/// Resolves credential references to secrets.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, reference: &str) -> Option<Credentials>;
}

impl CredentialProvider for HashMap<String, Credentials> {
    fn credentials(&self, reference: &str) -> Option<Credentials> {
        self.get(reference).cloned()
    }
}

/// Credentials read from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct CredentialFile {
    entries: HashMap<String, Credentials>,
}

impl CredentialFile {
    /// Load credentials from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            AppError::config(format!(
                "cannot read credentials file {:?}: {e}",
                path.as_ref()
            ))
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Check that every source has the credentials its platform needs.
    pub fn validate(&self, sources: &[Source]) -> Result<()> {
        for source in sources {
            let credentials = self.credentials(&source.credential).ok_or_else(|| {
                AppError::validation(format!(
                    "source '{}' references unknown credential '{}'",
                    source.name, source.credential
                ))
            })?;
            credentials
                .check(source.kind, &source.credential)
                .map_err(|e| AppError::validation(format!("source '{}': {e}", source.name)))?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CredentialProvider for CredentialFile {
    fn credentials(&self, reference: &str) -> Option<Credentials> {
        self.entries.get(reference).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_credentials_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [lj_main]
            username = "writer"
            password = "secret"

            [twitter]
            token = "abc"
            "#
        )
        .unwrap();

        let creds = CredentialFile::load(file.path()).unwrap();
        assert_eq!(creds.len(), 2);
        assert_eq!(
            creds.credentials("lj_main"),
            Some(Credentials::basic("writer", "secret"))
        );
        assert!(creds.credentials("missing").is_none());
    }

    #[test]
    fn test_require_names_reference() {
        let creds = Credentials::bearer("");
        let err = creds.require("twitter", "token").unwrap_err();
        assert_eq!(
            err,
            FetchError::Auth("credential 'twitter' has no token".to_string())
        );
    }

    #[test]
    fn test_validate_against_sources() {
        let file: CredentialFile = toml::from_str(
            r#"
            [da]
            client_id = "1"
            "#,
        )
        .unwrap();
        let sources = vec![Source::new(SourceKind::ArtShare, "gallery", "painter", "da")];
        assert!(file.validate(&sources).is_err());

        let sources = vec![Source::new(SourceKind::Journal, "lj", "writer", "nope")];
        assert!(file.validate(&sources).is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", Credentials::basic("writer", "hunter2"));
        assert!(rendered.contains("writer"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.toml")).unwrap();
        assert!(config.sources.is_empty());
        assert_eq!(config.sync.max_concurrent, 3);
    }
}
