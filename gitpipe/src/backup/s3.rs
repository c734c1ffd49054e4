//! S3-compatible object-store backend.
//!
//! Talks plain HTTPS with AWS signature v4 and unsigned payloads, which
//! keeps uploads streaming. Credentials and bucket come from the backup
//! location URL: `s3://id:secret@host/bucket?region=...&path_style=true`.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Backend, BackupError};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_REGION: &str = "us-west-1";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Object-store backend for any S3-compatible endpoint.
pub struct S3Backend {
    client: reqwest::Client,
    host: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
    path_style: bool,
}

impl S3Backend {
    /// Parses an `s3://` location URL.
    pub fn from_url(url: &Url) -> Result<Self, BackupError> {
        let host = url
            .host_str()
            .ok_or_else(|| BackupError::InvalidLocation("missing s3 host".to_string()))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let bucket = url.path().trim_matches('/').to_string();
        if bucket.is_empty() {
            return Err(BackupError::InvalidLocation(
                "missing s3 bucket in path".to_string(),
            ));
        }

        let mut region = DEFAULT_REGION.to_string();
        let mut path_style = false;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "region" => region = value.to_string(),
                "path_style" => path_style = value.parse().unwrap_or(false),
                _ => {}
            }
        }

        Ok(Self {
            client: reqwest::Client::new(),
            host,
            bucket,
            region,
            access_key: url.username().to_string(),
            secret_key: url.password().unwrap_or_default().to_string(),
            path_style,
        })
    }

    fn object_address(&self, name: &str) -> (String, String, String) {
        let key = uri_encode(name);
        if self.path_style {
            let uri = format!("/{}/{key}", self.bucket);
            (
                format!("https://{}{uri}", self.host),
                self.host.clone(),
                uri,
            )
        } else {
            let host = format!("{}.{}", self.bucket, self.host);
            (format!("https://{host}/{key}"), host, format!("/{key}"))
        }
    }

    fn signed_headers(
        &self,
        method: &str,
        host: &str,
        uri: &str,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{date}/{}/s3/aws4_request", self.region);

        let canonical_request = format!(
            "{method}\n{uri}\n\nhost:{host}\nx-amz-content-sha256:{UNSIGNED_PAYLOAD}\nx-amz-date:{amz_date}\n\nhost;x-amz-content-sha256;x-amz-date\n{UNSIGNED_PAYLOAD}"
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex(&Sha256::digest(canonical_request.as_bytes()))
        );

        let mut key = hmac(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        key = hmac(&key, self.region.as_bytes());
        key = hmac(&key, b"s3");
        key = hmac(&key, b"aws4_request");
        let signature = hex(&hmac(&key, string_to_sign.as_bytes()));

        vec![
            (
                "Authorization".to_string(),
                format!(
                    "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature={signature}",
                    self.access_key
                ),
            ),
            ("x-amz-date".to_string(), amz_date),
            (
                "x-amz-content-sha256".to_string(),
                UNSIGNED_PAYLOAD.to_string(),
            ),
        ]
    }
}

#[async_trait]
impl Backend for S3Backend {
    async fn store(
        &self,
        ctx: &CancellationToken,
        name: &str,
        source: &Path,
    ) -> Result<(), BackupError> {
        let (address, host, uri) = self.object_address(name);
        let file = tokio::fs::File::open(source).await?;
        let length = file.metadata().await?.len();

        let mut request = self
            .client
            .put(&address)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        for (header, value) in self.signed_headers("PUT", &host, &uri, Utc::now()) {
            request = request.header(header, value);
        }

        let response = tokio::select! {
            response = request.send() => response?,
            _ = ctx.cancelled() => return Err(BackupError::Unexpected {
                status: 0,
                body: "upload cancelled".to_string(),
            }),
        };
        if !response.status().is_success() {
            return Err(BackupError::Unexpected {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn fetch(
        &self,
        ctx: &CancellationToken,
        name: &str,
        dest: &Path,
    ) -> Result<(), BackupError> {
        let (address, host, uri) = self.object_address(name);
        let mut request = self.client.get(&address);
        for (header, value) in self.signed_headers("GET", &host, &uri, Utc::now()) {
            request = request.header(header, value);
        }

        let response = tokio::select! {
            response = request.send() => response?,
            _ = ctx.cancelled() => return Err(BackupError::Unexpected {
                status: 0,
                body: "download cancelled".to_string(),
            }),
        };
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackupError::NotFound);
        }
        if !response.status().is_success() {
            return Err(BackupError::Unexpected {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let mut output = tokio::fs::File::create(dest).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            output.write_all(&chunk?).await?;
        }
        output.flush().await?;
        Ok(())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut acc, byte| {
        use std::fmt::Write;
        let _ = write!(acc, "{byte:02x}");
        acc
    })
}

fn uri_encode(value: &str) -> String {
    value
        .bytes()
        .map(|byte| match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (byte as char).to_string()
            }
            other => format!("%{other:02X}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn backend(path_style: bool) -> S3Backend {
        let url = Url::parse(&format!(
            "s3://AKID:sekret@s3.example.com/backups?region=eu-central-1&path_style={path_style}"
        ))
        .unwrap();
        S3Backend::from_url(&url).unwrap()
    }

    #[test]
    fn test_from_url_parses_credentials() {
        let s3 = backend(false);
        assert_eq!(s3.access_key, "AKID");
        assert_eq!(s3.secret_key, "sekret");
        assert_eq!(s3.bucket, "backups");
        assert_eq!(s3.region, "eu-central-1");
    }

    #[test]
    fn test_virtual_host_address() {
        let s3 = backend(false);
        let (address, host, uri) = s3.object_address("my-app");
        assert_eq!(address, "https://backups.s3.example.com/my-app");
        assert_eq!(host, "backups.s3.example.com");
        assert_eq!(uri, "/my-app");
    }

    #[test]
    fn test_path_style_address() {
        let s3 = backend(true);
        let (address, host, uri) = s3.object_address("my-app");
        assert_eq!(address, "https://s3.example.com/backups/my-app");
        assert_eq!(host, "s3.example.com");
        assert_eq!(uri, "/backups/my-app");
    }

    #[test]
    fn test_missing_bucket_rejected() {
        let url = Url::parse("s3://id:secret@host/").unwrap();
        assert!(matches!(
            S3Backend::from_url(&url),
            Err(BackupError::InvalidLocation(_))
        ));
    }

    #[test]
    fn test_signature_is_stable() {
        let s3 = backend(true);
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let headers = s3.signed_headers("PUT", "s3.example.com", "/backups/my-app", now);

        let authorization = &headers[0].1;
        assert!(authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKID/20240501/eu-central-1/s3/aws4_request"
        ));
        assert!(authorization.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));

        // Same inputs must yield the same signature.
        let again = s3.signed_headers("PUT", "s3.example.com", "/backups/my-app", now);
        assert_eq!(headers, again);
    }

    #[test]
    fn test_uri_encode_preserves_safe_chars() {
        assert_eq!(uri_encode("my-app_v1.2~x"), "my-app_v1.2~x");
        assert_eq!(uri_encode("a b"), "a%20b");
    }
}
