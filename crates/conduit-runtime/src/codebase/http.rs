// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote codebase source fetched over HTTP(S).
//!
//! The URL points at the codebase entry. Versions come from the `ETag`
//! response header when the origin sends one, otherwise from a digest of the
//! body. Unforced syncs send `If-None-Match` so an unchanged origin can answer
//! `304 Not Modified` without a body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use tracing::debug;

use super::traits::*;
use crate::admin::tls::TlsOptions;
use crate::status::Status;

/// Request timeout for a single fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying the instance UUID on every fetch.
pub const INSTANCE_UUID_HEADER: &str = "x-conduit-instance-uuid";
/// Header carrying the instance name on every fetch.
pub const INSTANCE_NAME_HEADER: &str = "x-conduit-instance-name";

/// Codebase fetched from a remote repository.
#[derive(Debug)]
pub struct HttpCodebase {
    url: reqwest::Url,
    client: reqwest::Client,
    entry: Option<Entry>,
    etag: Option<String>,
    version: String,
}

impl HttpCodebase {
    /// Create a source for `url` using the given outbound TLS material.
    pub fn new(url: &str, tls: &TlsOptions) -> Result<Self> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| CodebaseError::Other(format!("invalid codebase URL {url}: {e}")))?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(FETCH_TIMEOUT);

        if let Some(path) = &tls.trusted {
            let pem = std::fs::read(path).map_err(|e| {
                CodebaseError::Tls(format!("cannot read {}: {e}", path.display()))
            })?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .map_err(|e| CodebaseError::Tls(format!("{}: {e}", path.display())))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
            let mut pem = std::fs::read(cert).map_err(|e| {
                CodebaseError::Tls(format!("cannot read {}: {e}", cert.display()))
            })?;
            pem.extend(std::fs::read(key).map_err(|e| {
                CodebaseError::Tls(format!("cannot read {}: {e}", key.display()))
            })?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| CodebaseError::Tls(format!("client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        Ok(Self {
            url,
            client: builder.build()?,
            entry: None,
            etag: None,
            version: String::new(),
        })
    }

    /// The codebase URL.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

/// Strip quotes and the weak marker from an entity tag.
fn etag_version(etag: &str) -> String {
    etag.trim_start_matches("W/").trim_matches('"').to_string()
}

#[async_trait]
impl CodebaseSource for HttpCodebase {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn sync(&mut self, status: &Status, force: bool) -> Result<SyncOutcome> {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(INSTANCE_UUID_HEADER, status.uuid.as_str())
            .header(INSTANCE_NAME_HEADER, status.name.as_str());

        if !force && let Some(etag) = &self.etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }

        let response = request.send().await?;

        if response.status() == StatusCode::NOT_MODIFIED && self.entry.is_some() {
            debug!(url = %self.url, "Remote codebase not modified");
            return Ok(SyncOutcome::Unchanged);
        }

        if !response.status().is_success() {
            return Err(CodebaseError::HttpStatus {
                url: self.url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        let version = etag
            .as_deref()
            .map(etag_version)
            .unwrap_or_else(|| content_version(&body));
        let changed = version != self.version;

        debug!(
            url = %self.url,
            version = %version,
            bytes = body.len(),
            changed,
            "Remote codebase fetched"
        );

        if !force && !changed {
            return Ok(SyncOutcome::Unchanged);
        }

        self.entry = Some(Entry {
            path: self.url.path().to_string(),
            source: body,
        });
        self.etag = etag;
        self.version = version;
        Ok(SyncOutcome::Updated)
    }

    fn entry(&self) -> Option<&Entry> {
        self.entry.as_ref()
    }

    fn version(&self) -> &str {
        &self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_etag_version() {
        assert_eq!(etag_version("\"abc\""), "abc");
        assert_eq!(etag_version("W/\"abc\""), "abc");
        assert_eq!(etag_version("plain"), "plain");
    }

    #[test]
    fn test_invalid_url() {
        let err = HttpCodebase::new("not a url", &TlsOptions::default()).unwrap_err();
        assert!(matches!(err, CodebaseError::Other(_)));
    }

    #[test]
    fn test_missing_trusted_bundle() {
        let tls = TlsOptions {
            trusted: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        let err = HttpCodebase::new("https://repo.example.com/app", &tls).unwrap_err();
        assert!(matches!(err, CodebaseError::Tls(_)));
    }

    #[test]
    fn test_new_keeps_url() {
        let codebase =
            HttpCodebase::new("http://repo.local:6060/repo/app/", &TlsOptions::default()).unwrap();
        assert_eq!(codebase.url(), "http://repo.local:6060/repo/app/");
        assert_eq!(codebase.kind(), "http");
        assert!(codebase.entry().is_none());
    }
}
