//! Cloudflare DNS provider.
//!
//! Upserts A-records through the v4 REST API. The public IP is detected
//! once at startup when not configured explicitly.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DnsError, DnsProvider};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const IP_ECHO: &str = "https://myexternalip.com/json";

/// Cloudflare provider configuration.
#[derive(Debug, Clone, Default)]
pub struct CloudflareConfig {
    /// API token with DNS edit permission.
    pub api_token: String,
    /// Public address for the records; auto-detected when empty.
    pub ip: Option<String>,
    /// Let Cloudflare proxy the traffic.
    pub proxied: bool,
}

/// Cloudflare REST client.
pub struct Cloudflare {
    client: reqwest::Client,
    config: CloudflareConfig,
    ip: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    success: bool,
    result: Option<T>,
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct Zone {
    id: String,
}

#[derive(Deserialize)]
struct Record {
    id: String,
    name: String,
}

impl Cloudflare {
    /// Builds the provider, detecting the public IP when needed.
    pub async fn new(
        ctx: &CancellationToken,
        config: CloudflareConfig,
    ) -> Result<Self, DnsError> {
        let client = reqwest::Client::new();
        let ip = match &config.ip {
            Some(ip) if !ip.is_empty() => ip.clone(),
            _ => detect_public_ip(ctx, &client).await?,
        };
        info!(ip = %ip, "dns records will point here");
        Ok(Self { client, config, ip })
    }

    async fn api<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, DnsError> {
        let response = request
            .bearer_auth(&self.config.api_token)
            .send()
            .await?
            .json::<Envelope<T>>()
            .await?;
        if !response.success {
            let details = response
                .errors
                .iter()
                .map(|error| format!("{}: {}", error.code, error.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(DnsError::Api(details));
        }
        response
            .result
            .ok_or_else(|| DnsError::Api("missing result".to_string()))
    }

    async fn zone_id(&self, zone: &str) -> Result<String, DnsError> {
        let zones: Vec<Zone> = self
            .api(self.client.get(format!("{API_BASE}/zones")).query(&[("name", zone)]))
            .await?;
        zones
            .into_iter()
            .next()
            .map(|found| found.id)
            .ok_or_else(|| DnsError::ZoneNotFound(zone.to_string()))
    }

    async fn upsert(&self, zone_id: &str, domain: &str) -> Result<(), DnsError> {
        let existing: Vec<Record> = self
            .api(
                self.client
                    .get(format!("{API_BASE}/zones/{zone_id}/dns_records"))
                    .query(&[("type", "A"), ("name", domain)]),
            )
            .await?;

        let body = serde_json::json!({
            "type": "A",
            "name": domain,
            "content": self.ip,
            "ttl": 1,
            "proxied": self.config.proxied,
        });

        match existing.iter().find(|record| record.name == domain) {
            Some(record) => {
                debug!(domain, record = %record.id, "updating A record");
                let _: serde_json::Value = self
                    .api(
                        self.client
                            .put(format!(
                                "{API_BASE}/zones/{zone_id}/dns_records/{}",
                                record.id
                            ))
                            .json(&body),
                    )
                    .await?;
            }
            None => {
                debug!(domain, "creating A record");
                let _: serde_json::Value = self
                    .api(
                        self.client
                            .post(format!("{API_BASE}/zones/{zone_id}/dns_records"))
                            .json(&body),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for Cloudflare {
    async fn register(
        &self,
        ctx: &CancellationToken,
        domains: &[String],
    ) -> Result<(), DnsError> {
        let mut zone_ids: HashMap<String, String> = HashMap::new();
        for domain in domains {
            if ctx.is_cancelled() {
                break;
            }
            let zone = zone_of(domain);
            if !zone_ids.contains_key(&zone) {
                let id = self.zone_id(&zone).await?;
                zone_ids.insert(zone.clone(), id);
            }
            self.upsert(&zone_ids[&zone], domain).await?;
        }
        Ok(())
    }
}

/// Last two labels of a domain, the Cloudflare zone name.
fn zone_of(domain: &str) -> String {
    let labels: Vec<&str> = domain.rsplit('.').take(2).collect();
    labels.into_iter().rev().collect::<Vec<_>>().join(".")
}

async fn detect_public_ip(
    ctx: &CancellationToken,
    client: &reqwest::Client,
) -> Result<String, DnsError> {
    #[derive(Deserialize)]
    struct IpInfo {
        ip: String,
    }

    let info = tokio::select! {
        response = async { client.get(IP_ECHO).send().await?.json::<IpInfo>().await } => response?,
        _ = ctx.cancelled() => return Err(DnsError::Api("ip detection cancelled".to_string())),
    };
    Ok(info.ip)
}
