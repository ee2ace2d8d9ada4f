//! Utility functions and helpers.

pub mod http;

use url::Url;

/// Resolve a media reference against the page it was found on.
///
/// Without a usable base, or when joining fails, the reference is returned
/// as-is.
pub fn resolve(base_url: Option<&str>, href: &str) -> String {
    base_url
        .and_then(|b| Url::parse(b).ok())
        .and_then(|base| base.join(href).ok())
        .map_or_else(|| href.to_string(), String::from)
}
