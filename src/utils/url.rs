//! URL utilities for consistent URL handling
//!
//! Upstream URLs routinely carry credentials and signed tokens; everything
//! that logs a URL goes through `obfuscate_credentials` first.

use url::Url;

/// URL utilities for consistent URL handling
pub struct UrlUtils;

impl UrlUtils {
    /// Join a base URL with a relative reference, handling root-relative
    /// and already-absolute references.
    pub fn join(base: &str, reference: &str) -> Result<String, url::ParseError> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Ok(reference.to_string());
        }
        let base_url = Url::parse(base)?;
        let joined = base_url.join(reference)?;
        Ok(joined.to_string())
    }

    /// Extract the host from a URL, if present.
    pub fn extract_host(url: &str) -> Option<String> {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }

    /// Strip query string and fragment, returning only the path portion.
    pub fn strip_query_and_fragment(url: &str) -> &str {
        let end = url.find(['?', '#']).unwrap_or(url.len());
        &url[..end]
    }

    /// Final path component of a URL, with query/fragment removed.
    pub fn basename(url: &str) -> &str {
        let stripped = Self::strip_query_and_fragment(url);
        stripped.rsplit('/').next().unwrap_or(stripped)
    }

    /// Replace userinfo and common token query parameters so URLs can be
    /// logged without leaking credentials.
    pub fn obfuscate_credentials(url: &str) -> String {
        let Ok(mut parsed) = Url::parse(url) else {
            return url.to_string();
        };

        if !parsed.username().is_empty() || parsed.password().is_some() {
            let _ = parsed.set_username("***");
            let _ = parsed.set_password(Some("***"));
        }

        let sensitive = ["token", "password", "pass", "key", "auth", "secret"];
        let has_sensitive = parsed
            .query_pairs()
            .any(|(k, _)| sensitive.iter().any(|s| k.eq_ignore_ascii_case(s)));
        if has_sensitive {
            let filtered: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| {
                    if sensitive.iter().any(|s| k.eq_ignore_ascii_case(s)) {
                        (k.into_owned(), "***".to_string())
                    } else {
                        (k.into_owned(), v.into_owned())
                    }
                })
                .collect();
            parsed
                .query_pairs_mut()
                .clear()
                .extend_pairs(filtered.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        parsed.to_string()
    }
}
