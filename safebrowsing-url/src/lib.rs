//! URL processing and canonicalization for Safe Browsing lookups
//!
//! This crate turns a URL into the bounded set of `host + path` expressions
//! that are hashed and checked against the prefix database: at most five host
//! suffixes times at most five path prefixes.

use idna::domain_to_ascii;
use safebrowsing_hash::{prefix_for, FullHash, SbPrefix};

use std::fmt;
use thiserror::Error;
use tracing::debug;
use url::{Host, Url};

/// Host suffixes examined in addition to the full host
const MAX_HOST_SUFFIXES: usize = 4;

/// Root-anchored path prefixes examined in addition to the exact path
const MAX_PATH_PREFIXES: usize = 4;

/// Upper bound on the number of paths checked for one URL
pub const MAX_PATHS_TO_CHECK: usize = 5;

/// Upper bound on the number of hosts checked for one URL
pub const MAX_HOSTS_TO_CHECK: usize = MAX_HOST_SUFFIXES + 1;

/// Error type for URL operations
#[derive(Debug, Error)]
pub enum UrlError {
    /// Error parsing URL
    #[error("URL parse error: {0}")]
    Parse(#[from] url::ParseError),

    /// Invalid host in URL
    #[error("Invalid host in URL: {0}")]
    InvalidHost(String),

    /// IDNA encoding error
    #[error("IDNA encoding error: {0}")]
    Idna(String),
}

/// Result type for URL operations
pub type Result<T> = std::result::Result<T, UrlError>;

/// Information about a canonicalized URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalUrl {
    /// The original URL that was canonicalized
    pub original: String,

    /// The canonicalized URL
    pub url: String,

    /// The hostname from the URL
    pub host: String,

    /// Whether the host is an IPv4 or IPv6 literal
    pub is_ip: bool,

    /// The path component, without the query
    pub path: String,

    /// The query component, without the leading `?`
    pub query: Option<String>,
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Check if a URL string is potentially valid
pub fn validate_url(url_str: &str) -> bool {
    canonicalize_url(url_str).is_ok()
}

/// Canonicalize a URL for lookup
///
/// This lowercases the host, converts IDNs to punycode, strips stray dots
/// from the host, drops the fragment and default ports, and defaults a
/// missing scheme to `http`.
pub fn canonicalize_url(url_str: &str) -> Result<CanonicalUrl> {
    let url_str = url_str.trim();
    let url_str = if !url_str.contains("://") && !url_str.starts_with("//") {
        format!("http://{url_str}")
    } else {
        url_str.to_string()
    };

    let parsed_url = Url::parse(&url_str)?;

    let (host, is_ip) = match parsed_url.host() {
        Some(Host::Domain(domain)) => {
            let ascii = domain_to_ascii(domain)
                .map_err(|e| UrlError::Idna(e.to_string()))?
                .to_lowercase();
            (normalize_dots(&ascii), false)
        }
        Some(Host::Ipv4(ip)) => (ip.to_string(), true),
        Some(Host::Ipv6(ip)) => (format!("[{ip}]"), true),
        None => return Err(UrlError::InvalidHost("No host in URL".to_string())),
    };
    if host.is_empty() {
        return Err(UrlError::InvalidHost(url_str));
    }

    let mut path = parsed_url.path().to_string();
    if path.is_empty() {
        path = "/".to_string();
    }
    let query = parsed_url.query().map(str::to_string);

    let scheme = parsed_url.scheme();
    let mut canonical_url = match parsed_url.port() {
        Some(p) => format!("{scheme}://{host}:{p}{path}"),
        None => format!("{scheme}://{host}{path}"),
    };
    if let Some(query) = &query {
        canonical_url.push('?');
        canonical_url.push_str(query);
    }

    Ok(CanonicalUrl {
        original: url_str,
        url: canonical_url,
        host,
        is_ip,
        path,
        query,
    })
}

/// Strip leading and trailing dots and collapse runs of dots.
fn normalize_dots(host: &str) -> String {
    host.split('.')
        .filter(|label| !label.is_empty())
        .collect::<Vec<_>>()
        .join(".")
}

/// Hosts to look up for a URL
///
/// The full host is always checked. For a domain name, up to four more
/// hosts are formed from the last five components by successively dropping
/// the leading component; the last component is never checked on its own.
/// IP literals are checked as-is.
pub fn generate_hosts_to_check(url: &CanonicalUrl) -> Vec<String> {
    let host = url.host.as_str();
    if host.is_empty() {
        return Vec::new();
    }
    if url.is_ip {
        return vec![host.to_string()];
    }

    let mut hosts = Vec::with_capacity(MAX_HOSTS_TO_CHECK);
    let mut skipped_last_component = false;
    for (i, _) in host.rmatch_indices('.') {
        if hosts.len() >= MAX_HOST_SUFFIXES {
            break;
        }
        if skipped_last_component {
            hosts.push(host[i + 1..].to_string());
        } else {
            skipped_last_component = true;
        }
    }
    hosts.push(host.to_string());
    hosts
}

/// Paths to look up for a URL
///
/// The exact path with its query (if any), the exact path without it, and
/// the paths formed by walking from the root one `/`-terminated component at
/// a time, capped at [`MAX_PATHS_TO_CHECK`] entries. When the cap bites, the
/// longest root-anchored prefixes are dropped first.
pub fn generate_paths_to_check(url: &CanonicalUrl) -> Vec<String> {
    let path = url.path.as_str();
    if path.is_empty() {
        return Vec::new();
    }

    let mut prefixes: Vec<&str> = path
        .match_indices('/')
        .map(|(i, _)| &path[..=i])
        .take(MAX_PATH_PREFIXES)
        .collect();

    let mut paths = Vec::with_capacity(MAX_PATHS_TO_CHECK);
    if let Some(query) = &url.query {
        paths.push(format!("{path}?{query}"));
    }
    if prefixes.last() != Some(&path) {
        paths.push(path.to_string());
    }

    while paths.len() + prefixes.len() > MAX_PATHS_TO_CHECK {
        prefixes.pop();
    }
    paths.extend(prefixes.iter().rev().map(|p| p.to_string()));
    paths
}

/// Generate every `host + path` expression to check for a URL
pub fn generate_patterns(url: &CanonicalUrl) -> Vec<String> {
    let hosts = generate_hosts_to_check(url);
    let paths = generate_paths_to_check(url);

    let mut patterns = Vec::with_capacity(hosts.len() * paths.len());
    for host in &hosts {
        for path in &paths {
            patterns.push(format!("{host}{path}"));
        }
    }

    debug!("Generated {} patterns for URL: {}", patterns.len(), url.url);
    patterns
}

/// Full hashes of every `host + path` expression for a URL
pub fn generate_full_hashes(url: &CanonicalUrl) -> Vec<FullHash> {
    generate_patterns(url)
        .iter()
        .map(|pattern| FullHash::from_pattern(pattern))
        .collect()
}

/// The bucket key of a host: the prefix of `host + "/"`
pub fn host_key(host: &str) -> SbPrefix {
    prefix_for(&format!("{host}/"))
}

/// Host keys for every host checked for a URL
pub fn generate_host_keys(url: &CanonicalUrl) -> Vec<SbPrefix> {
    generate_hosts_to_check(url)
        .iter()
        .map(|host| host_key(host))
        .collect()
}

/// Index of the first hash in `full_hashes` that matches one of the URL's
/// `host + path` expressions.
pub fn compare_full_hashes<'a, I>(url: &CanonicalUrl, full_hashes: I) -> Option<usize>
where
    I: IntoIterator<Item = &'a FullHash>,
{
    let candidates = generate_full_hashes(url);
    full_hashes
        .into_iter()
        .position(|hash| candidates.contains(hash))
}

/// Extract the domain from a URL
pub fn extract_domain(url_str: &str) -> Result<String> {
    let canonical = canonicalize_url(url_str)?;
    Ok(canonical.host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("http://example.com"));
        assert!(validate_url("https://example.com/path?query=1"));
        assert!(validate_url("example.com"));
        assert!(!validate_url("not a url"));
    }

    #[test]
    fn test_canonicalize_url() {
        let canonical = canonicalize_url("http://Example.Com/path").unwrap();
        assert_eq!(canonical.url, "http://example.com/path");
        assert_eq!(canonical.host, "example.com");
        assert_eq!(canonical.path, "/path");
        assert_eq!(canonical.query, None);

        let canonical = canonicalize_url("example.com").unwrap();
        assert_eq!(canonical.url, "http://example.com/");

        let canonical = canonicalize_url("http://example.com/path?query=1").unwrap();
        assert_eq!(canonical.url, "http://example.com/path?query=1");
        assert_eq!(canonical.path, "/path");
        assert_eq!(canonical.query.as_deref(), Some("query=1"));

        let canonical = canonicalize_url("http://example.com:80/path").unwrap();
        assert_eq!(canonical.url, "http://example.com/path");

        let canonical = canonicalize_url("http://example.com:8080/path").unwrap();
        assert_eq!(canonical.url, "http://example.com:8080/path");

        let canonical = canonicalize_url("http://example.com/path#fragment").unwrap();
        assert_eq!(canonical.url, "http://example.com/path");

        let canonical = canonicalize_url("http://例子.测试").unwrap();
        assert!(canonical.host.starts_with("xn--"));
    }

    #[test]
    fn test_canonicalize_strips_dots() {
        let canonical = canonicalize_url("http://www.example.com./").unwrap();
        assert_eq!(canonical.host, "www.example.com");
    }

    #[test]
    fn test_generate_hosts_to_check() {
        let url = canonicalize_url("http://a.b.c.d.e.f.g/1.html").unwrap();
        assert_eq!(
            generate_hosts_to_check(&url),
            vec!["f.g", "e.f.g", "d.e.f.g", "c.d.e.f.g", "a.b.c.d.e.f.g"]
        );

        let url = canonicalize_url("http://b.c/").unwrap();
        assert_eq!(generate_hosts_to_check(&url), vec!["b.c"]);

        let url = canonicalize_url("http://www.google.com/").unwrap();
        assert_eq!(
            generate_hosts_to_check(&url),
            vec!["google.com", "www.google.com"]
        );
    }

    #[test]
    fn test_ip_hosts_are_not_expanded() {
        let url = canonicalize_url("http://192.168.0.1/1.html").unwrap();
        assert!(url.is_ip);
        assert_eq!(generate_hosts_to_check(&url), vec!["192.168.0.1"]);
    }

    #[test]
    fn test_generate_paths_to_check() {
        let url = canonicalize_url("http://a.b.c.d.e.f.g/1/2.html?param=1").unwrap();
        assert_eq!(
            generate_paths_to_check(&url),
            vec!["/1/2.html?param=1", "/1/2.html", "/1/", "/"]
        );

        let url = canonicalize_url("http://a.b/").unwrap();
        assert_eq!(generate_paths_to_check(&url), vec!["/"]);

        let url = canonicalize_url("http://a.b/1/2/").unwrap();
        assert_eq!(generate_paths_to_check(&url), vec!["/1/2/", "/1/", "/"]);
    }

    #[test]
    fn test_paths_are_capped() {
        let url = canonicalize_url("http://a.b/1/2/3/4/5.html?x=y").unwrap();
        let paths = generate_paths_to_check(&url);
        assert_eq!(paths.len(), MAX_PATHS_TO_CHECK);
        assert_eq!(
            paths,
            vec!["/1/2/3/4/5.html?x=y", "/1/2/3/4/5.html", "/1/2/", "/1/", "/"]
        );
    }

    #[test]
    fn test_generate_patterns() {
        let url = canonicalize_url("http://a.b.c.d.e.f/1/2.html?param=1").unwrap();
        let patterns = generate_patterns(&url);

        assert!(patterns.len() <= MAX_HOSTS_TO_CHECK * MAX_PATHS_TO_CHECK);
        assert!(patterns.contains(&"d.e.f/1/2.html?param=1".to_string()));
        assert!(patterns.contains(&"a.b.c.d.e.f/1/2.html?param=1".to_string()));
        assert!(patterns.contains(&"e.f/".to_string()));
        assert!(patterns.contains(&"c.d.e.f/1/".to_string()));
        assert!(patterns.contains(&"b.c.d.e.f/1/2.html".to_string()));
        assert!(!patterns.iter().any(|p| p.starts_with("f/")));
    }

    #[test]
    fn test_compare_full_hashes() {
        let url = canonicalize_url("http://www.evil.com/phish.html").unwrap();
        let unrelated = FullHash::from_pattern("www.good.com/");
        let listed = FullHash::from_pattern("evil.com/phish.html");

        assert_eq!(compare_full_hashes(&url, &[unrelated, listed]), Some(1));
        assert_eq!(compare_full_hashes(&url, &[unrelated]), None);
    }

    #[test]
    fn test_host_keys() {
        let url = canonicalize_url("http://www.evil.com/a").unwrap();
        let keys = generate_host_keys(&url);
        assert_eq!(keys, vec![host_key("evil.com"), host_key("www.evil.com")]);
        assert_eq!(host_key("evil.com"), prefix_for("evil.com/"));
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("http://example.com/path").unwrap(),
            "example.com"
        );
        assert_eq!(
            extract_domain("https://sub.example.co.uk").unwrap(),
            "sub.example.co.uk"
        );
    }
}
