//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides a redacted view of connection
//! URLs for logs.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Render a connection URL with any password replaced by `***`.
pub fn redact_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "***".to_string();
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => raw.to_string(),
    }
}
