//! URL normalization for cross-source identity comparison.
//!
//! Two listings that point at the same page must produce byte-identical
//! normalized URLs, otherwise shared-URL evidence silently disappears.

use url::Url;

/// Normalize a URL for comparison: upgrade http to https, lowercase the
/// host, drop any trailing slash. Unparseable input falls back to a
/// trimmed copy so callers can still use it as an opaque key.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.trim_end_matches('/').to_string();
    };
    if url.scheme() == "http" {
        // set_scheme only fails for special-scheme mismatches; https is fine
        let _ = url.set_scheme("https");
    }
    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);
    let mut out = url.to_string();
    if out.ends_with('/') {
        out.pop();
    }
    out
}

/// Host component of a URL, used as the throttling key.
pub fn host_of(raw: &str) -> Option<String> {
    Url::parse(raw.trim())
        .ok()
        .and_then(|url| url.host_str().map(|h| h.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrades_scheme_and_strips_trailing_slash() {
        assert_eq!(
            normalize_url("http://Example.org/event/42030/"),
            "https://example.org/event/42030"
        );
    }

    #[test]
    fn equivalent_forms_normalize_identically() {
        let a = normalize_url("https://example.org/event/1");
        let b = normalize_url("http://EXAMPLE.ORG/event/1/");
        assert_eq!(a, b);
    }

    #[test]
    fn bare_host_loses_root_slash() {
        assert_eq!(normalize_url("https://example.org/"), "https://example.org");
        assert_eq!(normalize_url("https://example.org"), "https://example.org");
    }

    #[test]
    fn query_strings_are_preserved() {
        assert_eq!(
            normalize_url("http://example.org/cal/?start=2024-06-01"),
            "https://example.org/cal?start=2024-06-01"
        );
    }

    #[test]
    fn host_extraction() {
        assert_eq!(
            host_of("https://Seattle.GreenCityPartnerships.org/event/1"),
            Some("seattle.greencitypartnerships.org".to_string())
        );
        assert_eq!(host_of("not a url"), None);
    }
}
