//! A minimal cookie jar.
//!
//! Cookies are kept per host. A `Domain` attribute widens a cookie to the named domain and its
//! subdomains; paths, expiry dates and the `Secure` flag are not tracked. Session-wide cookies
//! set through [`CookieJar::set`] go to every host.

use std::collections::BTreeMap;

use http::header::SET_COOKIE;
use http::{HeaderMap, HeaderValue};
use parking_lot::Mutex;
use tracing::trace;
use url::Url;

#[derive(Debug, Default)]
struct Cookies {
    session: BTreeMap<String, String>,
    domains: BTreeMap<String, BTreeMap<String, String>>,
}

/// Stores cookies set by responses and produces `Cookie` headers for requests.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<Cookies>,
}

impl CookieJar {
    /// An empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a cookie sent to every host.
    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies
            .lock()
            .session
            .insert(name.into(), value.into());
    }

    /// The value of `name` that would be sent to the host of `url`.
    pub fn get(&self, url: &Url, name: &str) -> Option<String> {
        let host = url.host_str()?;
        let cookies = self.cookies.lock();
        matching(&cookies, host)
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.to_owned())
    }

    /// Number of stored cookies.
    pub fn len(&self) -> usize {
        let cookies = self.cookies.lock();
        cookies.session.len() + cookies.domains.values().map(BTreeMap::len).sum::<usize>()
    }

    /// Whether the jar is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every cookie.
    pub fn clear(&self) {
        let mut cookies = self.cookies.lock();
        cookies.session.clear();
        cookies.domains.clear();
    }

    /// Record every `Set-Cookie` header of a response from `url`.
    pub(crate) fn store(&self, url: &Url, headers: &HeaderMap) {
        let Some(host) = url.host_str() else {
            return;
        };

        let mut cookies = self.cookies.lock();
        for value in headers.get_all(SET_COOKIE) {
            let Some(cookie) = value.to_str().ok().and_then(SetCookie::parse) else {
                continue;
            };

            let domain = cookie
                .domain
                .filter(|domain| domain_matches(host, domain))
                .unwrap_or(host)
                .trim_start_matches('.')
                .to_ascii_lowercase();

            let bucket = cookies.domains.entry(domain).or_default();
            if cookie.expired {
                trace!(name = cookie.name, "cookie deleted");
                bucket.remove(cookie.name);
            } else {
                trace!(name = cookie.name, "cookie stored");
                bucket.insert(cookie.name.to_owned(), cookie.value.to_owned());
            }
        }
        cookies.domains.retain(|_, bucket| !bucket.is_empty());
    }

    /// `Cookie` header value for a request to `url`, if any cookie matches.
    pub(crate) fn header_for(&self, url: &Url) -> Option<HeaderValue> {
        let host = url.host_str()?;
        let cookies = self.cookies.lock();

        let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
        for (name, value) in matching(&cookies, host) {
            merged.entry(name).or_insert(value);
        }
        if merged.is_empty() {
            return None;
        }

        let header = merged
            .into_iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::try_from(header).ok()
    }
}

/// Cookies visible to `host`, most specific first: host cookies, then parent domains, then
/// session-wide cookies.
fn matching<'a>(cookies: &'a Cookies, host: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
    let host = host.trim_start_matches('.');
    let mut domains: Vec<_> = cookies
        .domains
        .iter()
        .filter(|(domain, _)| domain_matches(host, domain))
        .collect();
    domains.sort_by_key(|(domain, _)| std::cmp::Reverse(domain.len()));

    domains
        .into_iter()
        .flat_map(|(_, bucket)| bucket.iter())
        .chain(cookies.session.iter())
        .map(|(name, value)| (name.as_str(), value.as_str()))
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    host.eq_ignore_ascii_case(domain)
        || (host.len() > domain.len()
            && host[host.len() - domain.len()..].eq_ignore_ascii_case(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

#[derive(Debug)]
struct SetCookie<'a> {
    name: &'a str,
    value: &'a str,
    domain: Option<&'a str>,
    expired: bool,
}

impl<'a> SetCookie<'a> {
    fn parse(header: &'a str) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = SetCookie {
            name,
            value: value.trim().trim_matches('"'),
            domain: None,
            expired: false,
        };

        for attribute in parts {
            let (key, val) = attribute
                .split_once('=')
                .map_or((attribute.trim(), ""), |(k, v)| (k.trim(), v.trim()));
            if key.eq_ignore_ascii_case("max-age") {
                cookie.expired = val.parse::<i64>().is_ok_and(|age| age <= 0);
            } else if key.eq_ignore_ascii_case("domain") && !val.is_empty() {
                cookie.domain = Some(val);
            }
        }

        Some(cookie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn set_cookies(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(SET_COOKIE, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn stored_per_host() {
        let jar = CookieJar::new();
        jar.store(
            &url("http://a.example/"),
            &set_cookies(&["sid=1; Path=/; HttpOnly", "theme=dark"]),
        );

        assert_eq!(
            jar.header_for(&url("http://a.example/page")).unwrap(),
            "sid=1; theme=dark"
        );
        assert!(jar.header_for(&url("http://b.example/")).is_none());
        assert_eq!(jar.len(), 2);
    }

    #[test]
    fn max_age_zero_deletes() {
        let jar = CookieJar::new();
        let page = url("http://a.example/");
        jar.store(&page, &set_cookies(&["sid=1"]));
        jar.store(&page, &set_cookies(&["sid=; Max-Age=0"]));
        assert!(jar.header_for(&page).is_none());
        assert!(jar.is_empty());
    }

    #[test]
    fn domain_attribute_covers_subdomains() {
        let jar = CookieJar::new();
        jar.store(
            &url("http://www.example.com/"),
            &set_cookies(&["wide=1; Domain=.example.com"]),
        );
        assert_eq!(jar.get(&url("http://api.example.com/"), "wide").as_deref(), Some("1"));
        assert!(jar.get(&url("http://notexample.com/"), "wide").is_none());
    }

    #[test]
    fn foreign_domain_attribute_is_ignored() {
        let jar = CookieJar::new();
        jar.store(
            &url("http://a.example/"),
            &set_cookies(&["x=1; Domain=other.example"]),
        );
        assert!(jar.get(&url("http://other.example/"), "x").is_none());
        assert_eq!(jar.get(&url("http://a.example/"), "x").as_deref(), Some("1"));
    }

    #[test]
    fn host_cookie_shadows_session_cookie() {
        let jar = CookieJar::new();
        jar.set("lang", "en");
        jar.store(&url("http://a.example/"), &set_cookies(&["lang=fr"]));

        assert_eq!(jar.header_for(&url("http://a.example/")).unwrap(), "lang=fr");
        assert_eq!(jar.header_for(&url("http://b.example/")).unwrap(), "lang=en");

        jar.clear();
        assert!(jar.header_for(&url("http://b.example/")).is_none());
    }
}
