//! HTTP front door.
//!
//! Holds the immutable routing table, resolves every request to a
//! record, runs the optional JWT check and hands the request to the
//! upstream proxy. Unknown routing keys render the index page (when
//! enabled) with a 404 status.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::auth::{extract_token, AuthFailure, JwtVerifier, USER_HEADER};
use super::proxy::{status_response, UpstreamProxy};
use super::resolvers::RequestResolver;
use super::RouteRecord;

const CORRELATION_HEADER: &str = "x-correlation-id";
const REQUEST_ID_HEADER: &str = "x-request-id";

type RouteTable = HashMap<String, RouteRecord>;

/// Routing engine state shared across requests.
pub struct Router {
    table: RwLock<Arc<RouteTable>>,
    resolver: Box<dyn RequestResolver>,
    auth: Option<JwtVerifier>,
    proxy: UpstreamProxy,
    index_enabled: bool,
    ctx: CancellationToken,
}

impl Router {
    pub fn new(
        ctx: CancellationToken,
        resolver: Box<dyn RequestResolver>,
        auth: Option<JwtVerifier>,
        proxy: UpstreamProxy,
        index_enabled: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: RwLock::new(Arc::new(HashMap::new())),
            resolver,
            auth,
            proxy,
            index_enabled,
            ctx,
        })
    }

    /// Replaces the routing table; in-flight requests keep the snapshot
    /// they already resolved against.
    pub fn set(&self, records: Vec<RouteRecord>) {
        let mut table = HashMap::with_capacity(records.len());
        for record in records {
            let key = self.resolver.fqdn(&record.domain);
            table.insert(key, record);
        }
        info!(routes = table.len(), "routing table updated");
        *self.table.write().expect("routing table lock") = Arc::new(table);
    }

    /// True when a published domain matches `host` exactly.
    pub fn has_domain(&self, host: &str) -> bool {
        self.snapshot().contains_key(host)
    }

    /// All published domains.
    pub fn domains(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    fn snapshot(&self) -> Arc<RouteTable> {
        Arc::clone(&self.table.read().expect("routing table lock"))
    }

    /// Builds the axum application serving this router.
    pub fn into_service(self: Arc<Self>) -> axum::Router {
        axum::Router::new().fallback(dispatch).with_state(self)
    }

    async fn serve(&self, mut request: Request<Body>) -> Response<Body> {
        let correlation_id = request
            .headers()
            .get(CORRELATION_HEADER)
            .cloned();
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .cloned()
            .unwrap_or_else(|| {
                let generated = Uuid::new_v4().simple().to_string();
                HeaderValue::from_str(&generated)
                    .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
            });
        request
            .headers_mut()
            .insert(REQUEST_ID_HEADER, request_id.clone());

        let table = self.snapshot();
        let record = self
            .resolver
            .routing_key(&mut request)
            .and_then(|key| table.get(&key).cloned());

        let mut response = match record {
            Some(record) => self.serve_route(request, &record).await,
            None => self.not_found(&table),
        };

        // The correlation id always mirrors the request, whatever the
        // upstream answered; the request id is echoed for tracing.
        match correlation_id {
            Some(value) => {
                response.headers_mut().insert(CORRELATION_HEADER, value);
            }
            None => {
                response.headers_mut().remove(CORRELATION_HEADER);
            }
        }
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
        response
    }

    async fn serve_route(
        &self,
        mut request: Request<Body>,
        record: &RouteRecord,
    ) -> Response<Body> {
        if let Some(verifier) = &self.auth {
            let token = extract_token(request.headers(), request.uri().query());
            let verdict = token
                .ok_or(AuthFailure::Unauthorized)
                .and_then(|token| verifier.verify(&token, request.method(), &record.group));
            match verdict {
                Ok(audience) => {
                    debug!(domain = %record.domain, user = %audience, "request authorized");
                    if let Ok(value) = HeaderValue::from_str(&audience) {
                        request.headers_mut().insert(USER_HEADER, value);
                    }
                }
                Err(failure) => {
                    return status_response(failure.status(), "");
                }
            }
        }
        self.proxy.forward(&self.ctx, request, record).await
    }

    fn not_found(&self, table: &RouteTable) -> Response<Body> {
        if !self.index_enabled {
            return status_response(StatusCode::NOT_FOUND, "404 page not found");
        }
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(render_index(table)))
            .unwrap_or_default()
    }
}

async fn dispatch(
    State(router): State<Arc<Router>>,
    request: Request<Body>,
) -> Response<Body> {
    router.serve(request).await
}

/// Renders the fallback index: all known routes grouped by namespace.
fn render_index(table: &RouteTable) -> String {
    let mut by_group: HashMap<&str, Vec<&RouteRecord>> = HashMap::new();
    for record in table.values() {
        by_group.entry(&record.group).or_default().push(record);
    }
    let mut groups: Vec<_> = by_group.into_iter().collect();
    groups.sort_by(|a, b| a.0.cmp(b.0));

    let mut page = String::from(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>git-pipe</title></head>\n<body>\n<h1>Services</h1>\n",
    );
    for (group, mut records) in groups {
        records.sort_by(|a, b| a.domain.cmp(&b.domain));
        page.push_str(&format!("<h2>{}</h2>\n<ul>\n", escape_html(group)));
        for record in records {
            let domain = escape_html(&record.domain);
            page.push_str(&format!(
                "<li><a href=\"//{domain}\">{domain}</a></li>\n"
            ));
        }
        page.push_str("</ul>\n");
    }
    page.push_str("</body>\n</html>\n");
    page
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::super::resolvers::ByDomain;
    use super::*;

    fn router(index: bool) -> Arc<Router> {
        Router::new(
            CancellationToken::new(),
            Box::new(ByDomain::new("")),
            None,
            UpstreamProxy::new(None),
            index,
        )
    }

    fn record(domain: &str, group: &str) -> RouteRecord {
        RouteRecord {
            domain: domain.to_string(),
            addresses: vec!["10.0.0.1:80".to_string()],
            group: group.to_string(),
        }
    }

    #[test]
    fn test_set_and_lookup() {
        let router = router(true);
        router.set(vec![record("app.localhost", "app")]);
        assert!(router.has_domain("app.localhost"));
        assert!(!router.has_domain("other.localhost"));
    }

    #[test]
    fn test_set_replaces_table() {
        let router = router(true);
        router.set(vec![record("a.localhost", "a")]);
        router.set(vec![record("b.localhost", "b")]);
        assert!(!router.has_domain("a.localhost"));
        assert!(router.has_domain("b.localhost"));
    }

    #[test]
    fn test_index_groups_records() {
        let mut table = RouteTable::new();
        table.insert("web.app.localhost".to_string(), record("web.app.localhost", "app"));
        table.insert("api.app.localhost".to_string(), record("api.app.localhost", "app"));
        table.insert("other.localhost".to_string(), record("other.localhost", "other"));

        let page = render_index(&table);
        assert!(page.contains("<h2>app</h2>"));
        assert!(page.contains("<h2>other</h2>"));
        assert!(page.contains("web.app.localhost"));
        // Groups are sorted for stable output.
        assert!(page.find("<h2>app</h2>").unwrap() < page.find("<h2>other</h2>").unwrap());
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
