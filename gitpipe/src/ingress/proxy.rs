//! Upstream request forwarding.
//!
//! One address is picked uniformly at random from the record, resolved
//! into a reachable endpoint through the network fabric and the request
//! is replayed against it with bodies streamed both ways.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Request, Response, StatusCode};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::RouteRecord;
use crate::BoxError;

/// Connection-level headers never forwarded in either direction.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Maps in-network addresses to endpoints reachable by this process.
#[async_trait]
pub trait AddressResolver: Send + Sync + 'static {
    async fn resolve(&self, ctx: &CancellationToken, address: &str) -> Result<String, BoxError>;
}

#[async_trait]
impl AddressResolver for crate::core::DockerNetwork {
    async fn resolve(&self, ctx: &CancellationToken, address: &str) -> Result<String, BoxError> {
        Ok(crate::core::DockerNetwork::resolve(self, ctx, address).await?)
    }
}

/// Reverse-proxy leg talking plain HTTP to workloads.
pub struct UpstreamProxy {
    client: reqwest::Client,
    resolver: Option<Arc<dyn AddressResolver>>,
}

impl UpstreamProxy {
    /// A `None` resolver disables address resolution (addresses are
    /// used as published).
    pub fn new(resolver: Option<Arc<dyn AddressResolver>>) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { client, resolver }
    }

    /// Forwards the request to one of the record's upstreams.
    pub async fn forward(
        &self,
        ctx: &CancellationToken,
        request: Request<Body>,
        record: &RouteRecord,
    ) -> Response<Body> {
        if record.addresses.is_empty() {
            return status_response(StatusCode::BAD_GATEWAY, "no upstream available");
        }
        let pick = rand::thread_rng().gen_range(0..record.addresses.len());
        let address = &record.addresses[pick];

        let endpoint = match &self.resolver {
            Some(resolver) => match resolver.resolve(ctx, address).await {
                Ok(endpoint) => endpoint,
                Err(error) => {
                    warn!(address = %address, error = %error, "resolve upstream failed");
                    return status_response(StatusCode::BAD_GATEWAY, "upstream unresolvable");
                }
            },
            None => address.clone(),
        };
        debug!(address = %address, endpoint = %endpoint, "proxy endpoint resolved");

        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let url = format!("http://{endpoint}{path_and_query}");

        let (parts, body) = request.into_parts();
        let mut upstream = self
            .client
            .request(parts.method, url)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()));
        for (name, value) in filter_headers(&parts.headers) {
            upstream = upstream.header(name, value);
        }

        match upstream.send().await {
            Ok(response) => {
                let mut builder = Response::builder().status(response.status());
                if let Some(headers) = builder.headers_mut() {
                    for (name, value) in filter_headers(response.headers()) {
                        headers.append(name, value);
                    }
                }
                builder
                    .body(Body::from_stream(response.bytes_stream()))
                    .unwrap_or_else(|_| {
                        status_response(StatusCode::INTERNAL_SERVER_ERROR, "proxy error")
                    })
            }
            Err(error) => {
                warn!(endpoint = %endpoint, error = %error, "upstream request failed");
                status_response(StatusCode::BAD_GATEWAY, "upstream unreachable")
            }
        }
    }
}

fn filter_headers(headers: &HeaderMap) -> Vec<(HeaderName, axum::http::HeaderValue)> {
    headers
        .iter()
        .filter(|(name, _)| *name != header::HOST && !HOP_BY_HOP.contains(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

pub(crate) fn status_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_drops_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::HOST, "app.localhost".parse().unwrap());
        headers.insert(header::ACCEPT, "text/html".parse().unwrap());
        headers.insert("x-custom", "1".parse().unwrap());

        let kept = filter_headers(&headers);
        let names: Vec<String> = kept.iter().map(|(name, _)| name.to_string()).collect();
        assert!(names.contains(&"accept".to_string()));
        assert!(names.contains(&"x-custom".to_string()));
        assert!(!names.contains(&"connection".to_string()));
        assert!(!names.contains(&"host".to_string()));
    }

    #[tokio::test]
    async fn test_no_addresses_is_bad_gateway() {
        let ctx = CancellationToken::new();
        let proxy = UpstreamProxy::new(None);
        let record = RouteRecord {
            domain: "app.localhost".to_string(),
            addresses: Vec::new(),
            group: "app".to_string(),
        };
        let request = Request::builder().body(Body::empty()).unwrap();
        let response = proxy.forward(&ctx, request, &record).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let ctx = CancellationToken::new();
        let proxy = UpstreamProxy::new(None);
        let record = RouteRecord {
            domain: "app.localhost".to_string(),
            // Reserved port on localhost with nothing listening.
            addresses: vec!["127.0.0.1:9".to_string()],
            group: "app".to_string(),
        };
        let request = Request::builder()
            .uri("/x")
            .body(Body::empty())
            .unwrap();
        let response = proxy.forward(&ctx, request, &record).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
