//! Session cookie store.
//!
//! The engine owns its cookie jar rather than delegating to the HTTP client:
//! a previously authenticated session must be seedable from persisted
//! records and exportable back for persistence, which the client's built-in
//! jar does not allow.

use std::collections::HashMap;

use cookie::Cookie;
use reqwest::header::{HeaderMap, SET_COOKIE};
use serde::{Deserialize, Serialize};
use tracing::trace;
use url::Url;

/// A persistable cookie, the unit of session resumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub domain: String,
    pub path: String,
    pub name: String,
    pub value: String,
}

/// Cookie jar keyed by `(domain, path, name)`.
#[derive(Debug, Default)]
pub struct CookieStore {
    cookies: HashMap<(String, String, String), String>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a jar from previously exported records.
    pub fn from_records(records: &[CookieRecord]) -> Self {
        let mut store = Self::new();
        for record in records {
            store.cookies.insert(
                (
                    record.domain.clone(),
                    record.path.clone(),
                    record.name.clone(),
                ),
                record.value.clone(),
            );
        }
        store
    }

    /// Record every `Set-Cookie` header of a response against the request URL.
    pub fn store_response(&mut self, url: &Url, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let Ok(parsed) = Cookie::parse(raw.to_owned()) else {
                continue;
            };
            let domain = parsed
                .domain()
                .map(str::to_owned)
                .unwrap_or_else(|| url.host_str().unwrap_or_default().to_owned());
            let path = parsed
                .path()
                .map(str::to_owned)
                .unwrap_or_else(|| "/".to_owned());
            let key = (domain, path, parsed.name().to_owned());

            // Max-Age=0 is the server deleting the cookie.
            if parsed.max_age().is_some_and(|age| age.whole_seconds() <= 0) {
                self.cookies.remove(&key);
                continue;
            }
            trace!(name = key.2.as_str(), domain = key.0.as_str(), "stored cookie");
            self.cookies.insert(key, parsed.value().to_owned());
        }
    }

    /// Build the `Cookie` request header value for a URL, or `None` when no
    /// stored cookie matches its host and path.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        let request_path = url.path();
        let mut matched: Vec<(&str, &str, &str)> = self
            .cookies
            .iter()
            .filter(|((domain, path, _), _)| {
                domain_matches(host, domain) && path_matches(request_path, path)
            })
            .map(|((_, path, name), value)| (path.as_str(), name.as_str(), value.as_str()))
            .collect();
        if matched.is_empty() {
            return None;
        }
        // Longest path first, then name, for a deterministic header.
        matched.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.1.cmp(b.1)));
        Some(
            matched
                .iter()
                .map(|(_, name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Export the jar for persistence, sorted for determinism.
    pub fn export(&self) -> Vec<CookieRecord> {
        let mut records: Vec<CookieRecord> = self
            .cookies
            .iter()
            .map(|((domain, path, name), value)| CookieRecord {
                domain: domain.clone(),
                path: path.clone(),
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        records.sort_by(|a, b| {
            (&a.domain, &a.path, &a.name).cmp(&(&b.domain, &b.path, &b.name))
        });
        records
    }
}

/// RFC 6265 domain matching: exact host, or the host is a subdomain of the
/// cookie domain.
fn domain_matches(host: &str, cookie_domain: &str) -> bool {
    let domain = cookie_domain.trim_start_matches('.');
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// RFC 6265 path matching.
fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path[cookie_path.len()..].starts_with('/')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn stores_and_sends_session_cookie() {
        let mut store = CookieStore::new();
        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("JSESSIONID=ABC123; Path=/sigaa; HttpOnly"),
        );
        store.store_response(&url("https://sigaa.ifal.edu.br/sigaa/logar.do"), &headers);

        let header = store
            .header_for(&url("https://sigaa.ifal.edu.br/sigaa/portais/discente/discente.jsf"))
            .unwrap();
        assert_eq!(header, "JSESSIONID=ABC123");

        // Path does not match outside /sigaa.
        assert!(store.header_for(&url("https://sigaa.ifal.edu.br/other")).is_none());
    }

    #[test]
    fn max_age_zero_deletes() {
        let mut store = CookieStore::new();
        let target = url("https://sigaa.ifal.edu.br/sigaa/");
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("token=x; Path=/"));
        store.store_response(&target, &headers);
        assert!(store.header_for(&target).is_some());

        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("token=gone; Path=/; Max-Age=0"),
        );
        store.store_response(&target, &headers);
        assert!(store.header_for(&target).is_none());
    }

    #[test]
    fn export_round_trips_through_records() {
        let mut store = CookieStore::new();
        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("JSESSIONID=S1; Path=/sigaa"),
        );
        headers.append(SET_COOKIE, HeaderValue::from_static("portal=p2; Path=/"));
        store.store_response(&url("https://sigaa.ifal.edu.br/sigaa/"), &headers);

        let exported = store.export();
        assert_eq!(exported.len(), 2);

        let reseeded = CookieStore::from_records(&exported);
        assert_eq!(reseeded.export(), exported);
    }

    #[test]
    fn domain_matching_covers_subdomains() {
        assert!(domain_matches("sigaa.ifal.edu.br", "sigaa.ifal.edu.br"));
        assert!(domain_matches("sigaa.ifal.edu.br", ".ifal.edu.br"));
        assert!(!domain_matches("sigaa.ufal.edu.br", "ifal.edu.br"));
    }
}
