//! Request-to-routing-key resolution strategies.
//!
//! Domain mode keys on the request host; path mode keys on the first
//! path segment and strips it before the request is proxied.

use axum::body::Body;
use axum::http::uri::PathAndQuery;
use axum::http::{header, Request, Uri};

/// Maps requests to routing keys and record domains to table keys.
pub trait RequestResolver: Send + Sync + 'static {
    /// Fully-qualified form of a published domain.
    fn fqdn(&self, domain: &str) -> String;

    /// Extracts the routing key; may rewrite the request.
    fn routing_key(&self, request: &mut Request<Body>) -> Option<String>;
}

/// Resolution by requested host, with an optional root domain appended
/// to every published record.
pub struct ByDomain {
    root_domain: String,
}

impl ByDomain {
    pub fn new(root_domain: impl Into<String>) -> Self {
        Self {
            root_domain: root_domain.into(),
        }
    }
}

impl RequestResolver for ByDomain {
    fn fqdn(&self, domain: &str) -> String {
        if self.root_domain.is_empty() || domain.ends_with(&format!(".{}", self.root_domain)) {
            return domain.to_string();
        }
        format!("{domain}.{}", self.root_domain)
    }

    fn routing_key(&self, request: &mut Request<Body>) -> Option<String> {
        let host = request
            .uri()
            .host()
            .map(str::to_string)
            .or_else(|| {
                request
                    .headers()
                    .get(header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            })?;
        let host = host.rsplit_once(':').map_or(host.as_str(), |(name, port)| {
            if port.chars().all(|c| c.is_ascii_digit()) {
                name
            } else {
                host.as_str()
            }
        });
        if host.is_empty() {
            return None;
        }
        Some(host.to_string())
    }
}

/// Resolution by the first path segment, which is consumed.
pub struct ByPath;

impl RequestResolver for ByPath {
    fn fqdn(&self, domain: &str) -> String {
        domain.to_string()
    }

    fn routing_key(&self, request: &mut Request<Body>) -> Option<String> {
        let path = request.uri().path().to_string();
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return None;
        }
        let (key, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
        let key = key.to_string();

        let mut remainder = format!("/{rest}");
        if let Some(query) = request.uri().query() {
            remainder.push('?');
            remainder.push_str(query);
        }

        let mut parts = request.uri().clone().into_parts();
        parts.path_and_query = PathAndQuery::try_from(remainder).ok();
        if let Ok(uri) = Uri::from_parts(parts) {
            *request.uri_mut() = uri;
        }
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, host: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(header::HOST, host);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_by_domain_uses_host_header() {
        let resolver = ByDomain::new("");
        let mut req = request("/x", Some("app.localhost:8080"));
        assert_eq!(resolver.routing_key(&mut req).as_deref(), Some("app.localhost"));
    }

    #[test]
    fn test_by_domain_without_port() {
        let resolver = ByDomain::new("");
        let mut req = request("/", Some("app.localhost"));
        assert_eq!(resolver.routing_key(&mut req).as_deref(), Some("app.localhost"));
    }

    #[test]
    fn test_by_domain_fqdn_appends_root() {
        let resolver = ByDomain::new("example.com");
        assert_eq!(resolver.fqdn("app"), "app.example.com");
        assert_eq!(resolver.fqdn("app.example.com"), "app.example.com");
    }

    #[test]
    fn test_by_path_consumes_first_segment() {
        let resolver = ByPath;
        let mut req = request("/app.example.com/some/path?x=1", None);
        assert_eq!(
            resolver.routing_key(&mut req).as_deref(),
            Some("app.example.com")
        );
        assert_eq!(req.uri().path(), "/some/path");
        assert_eq!(req.uri().query(), Some("x=1"));
    }

    #[test]
    fn test_by_path_segment_only() {
        let resolver = ByPath;
        let mut req = request("/app", None);
        assert_eq!(resolver.routing_key(&mut req).as_deref(), Some("app"));
        assert_eq!(req.uri().path(), "/");
    }

    #[test]
    fn test_by_path_empty() {
        let resolver = ByPath;
        let mut req = request("/", None);
        assert_eq!(resolver.routing_key(&mut req), None);
    }
}
