// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ClickHouse client over the HTTP interface.
//!
//! Batches are sent as `INSERT INTO threats FORMAT JSONEachRow` with one
//! serialized row per line; DDL goes through the same query endpoint. The
//! reachability probe uses the built-in `/ping` handler.

use super::{ColumnarStore, StoreError, ThreatRow};
use crate::config::Config;
use async_trait::async_trait;

/// ClickHouse-over-HTTP store.
pub struct ClickHouseStore {
    client: reqwest::Client,
    base_url: String,
    database: String,
    user: String,
    password: String,
}

impl ClickHouseStore {
    /// Build a client from the bridge configuration.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.query_timeout())
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(std::time::Duration::from_secs(30));

        if config.tls.enable {
            if let Some(ca) = &config.tls.ca {
                let pem = std::fs::read(ca)
                    .map_err(|e| anyhow::anyhow!("reading TLS CA {ca}: {e}"))?;
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
            }
            if let (Some(cert), Some(key)) = (&config.tls.cert, &config.tls.key) {
                let mut pem = std::fs::read(cert)
                    .map_err(|e| anyhow::anyhow!("reading TLS cert {cert}: {e}"))?;
                pem.extend(
                    std::fs::read(key)
                        .map_err(|e| anyhow::anyhow!("reading TLS key {key}: {e}"))?,
                );
                builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
            }
        }

        let client = builder.build()?;

        Ok(Self {
            client,
            base_url: normalize_url(&config.store_url),
            database: config.store_db.clone(),
            user: config.store_user.clone(),
            password: config.store_pass.clone(),
        })
    }

    fn query_request(&self, query: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.base_url)
            .query(&[("database", self.database.as_str()), ("query", query)]);
        if !self.user.is_empty() {
            request = request.header("X-ClickHouse-User", &self.user);
        }
        if !self.password.is_empty() {
            request = request.header("X-ClickHouse-Key", &self.password);
        }
        request
    }

    async fn check_response(response: reqwest::Response) -> Result<(), StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 {
            return Err(StoreError::TooManyRequests(message));
        }
        Err(StoreError::Server {
            code: status.as_u16(),
            message,
        })
    }

    fn map_send_error(e: reqwest::Error) -> StoreError {
        if e.is_timeout() {
            StoreError::Timeout(e.to_string())
        } else if e.is_connect() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Server {
                code: 0,
                message: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl ColumnarStore for ClickHouseStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let url = format!("{}/ping", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::check_response(response).await
    }

    async fn exec(&self, ddl: &str) -> Result<(), StoreError> {
        let response = self
            .query_request(ddl)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::check_response(response).await
    }

    async fn insert_batch(&self, rows: &[ThreatRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut body = String::with_capacity(rows.len() * 512);
        for row in rows {
            let line = serde_json::to_string(row)
                .map_err(|e| StoreError::Invalid(format!("row serialization: {e}")))?;
            body.push_str(&line);
            body.push('\n');
        }

        let response = self
            .query_request("INSERT INTO threats FORMAT JSONEachRow")
            .body(body)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::check_response(response).await
    }
}

/// Accept bare `host:port` endpoints as well as full URLs.
fn normalize_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("localhost:9000"), "http://localhost:9000");
        assert_eq!(normalize_url("http://ch:8123/"), "http://ch:8123");
        assert_eq!(normalize_url("https://ch:8443"), "https://ch:8443");
    }

    #[test]
    fn test_store_builds_from_config() {
        let config = Config::default();
        let store = ClickHouseStore::new(&config).unwrap();
        assert_eq!(store.base_url, "http://localhost:9000");
        assert_eq!(store.database, "ultra_siem");
    }
}
