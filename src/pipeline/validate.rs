// src/pipeline/validate.rs

use std::path::Path;

use crate::config::CredentialFile;
use crate::error::Result;
use crate::models::Config;

/// Validate the configuration file and, when given, the credentials file
/// against the configured sources.
pub fn run_validate(config_path: &Path, credentials_path: Option<&Path>) -> Result<()> {
    log::info!("Validating configuration at {}", config_path.display());

    let config = Config::load(config_path)
        .and_then(|config| config.validate().map(|()| config))
        .inspect_err(|e| log::error!("Configuration is invalid: {e}"))?;
    log::info!("Configuration OK");
    log::info!("  user agent: {}", config.http.user_agent);
    log::info!("  timeout: {}s", config.http.timeout_secs);
    log::info!("  max concurrent sources: {}", config.sync.max_concurrent);
    log::info!("  store: {}", config.store.path);
    for source in &config.sources {
        log::info!(
            "  source '{}': {} account '{}' at {}",
            source.name,
            source.kind,
            source.account,
            source.base_url()
        );
    }

    if let Some(path) = credentials_path {
        let credentials = CredentialFile::load(path)?;
        credentials.validate(&config.sources).inspect_err(|e| {
            log::error!("Credentials are incomplete: {e}");
        })?;
        log::info!(
            "Credentials OK ({} reference(s) in {})",
            credentials.len(),
            path.display()
        );
    }

    Ok(())
}
