//! Cloudflare DNS adapter: bearer-token v4 API with a zone-id cache.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use crate::common::Error;

use super::{record_name, DnsProvider, API_TIMEOUT};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

pub struct Cloudflare {
    token: String,
    /// Optional pre-configured zone id; skips the lookup entirely.
    fixed_zone: String,
    api_base: String,
    zone_cache: RwLock<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ApiList<T> {
    #[serde(default)]
    success: bool,
    #[serde(default = "Vec::new")]
    result: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ZoneRow {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RecordRow {
    id: String,
    #[serde(default)]
    content: String,
}

impl Cloudflare {
    pub fn new(token: &str, zone_id: &str) -> Self {
        Self {
            token: token.to_string(),
            fixed_zone: zone_id.to_string(),
            api_base: API_BASE.to_string(),
            zone_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Point the adapter at a different API root (tests).
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    fn http(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("http client")
    }

    async fn check<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<T> {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if status >= 400 {
            if status == 401 || status == 403 {
                return Err(
                    Error::AuthDenied(format!("{}: HTTP {}: {}", what, status, body)).into(),
                );
            }
            return Err(Error::Protocol(format!("{}: HTTP {}: {}", what, status, body)).into());
        }
        serde_json::from_str(&body).with_context(|| format!("parse {} response", what))
    }

    async fn zone_id(&self, root_domain: &str) -> Result<String> {
        if !self.fixed_zone.is_empty() {
            return Ok(self.fixed_zone.clone());
        }
        if let Some(cached) = self.zone_cache.read().await.get(root_domain) {
            return Ok(cached.clone());
        }

        let response = self
            .http()?
            .get(format!("{}/zones?name={}", self.api_base, root_domain))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("cloudflare zone lookup")?;
        let list: ApiList<ZoneRow> = Self::check(response, "cloudflare zone lookup").await?;
        if !list.success || list.result.is_empty() {
            return Err(Error::Config(format!(
                "no Cloudflare zone found for {}",
                root_domain
            ))
            .into());
        }

        let zone = list.result[0].id.clone();
        self.zone_cache
            .write()
            .await
            .insert(root_domain.to_string(), zone.clone());
        Ok(zone)
    }
}

#[async_trait]
impl DnsProvider for Cloudflare {
    async fn upsert(
        &self,
        rr: &str,
        domain: &str,
        record_type: &str,
        value: &str,
        ttl: u32,
    ) -> Result<()> {
        let zone = self.zone_id(domain).await?;
        let name = record_name(rr, domain);
        let ttl = if ttl == 0 { 1 } else { ttl }; // 1 = auto

        let response = self
            .http()?
            .get(format!(
                "{}/zones/{}/dns_records?type={}&name={}",
                self.api_base, zone, record_type, name
            ))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("cloudflare record lookup")?;
        let list: ApiList<RecordRow> = Self::check(response, "cloudflare record lookup").await?;

        let payload = json!({
            "type": record_type,
            "name": name,
            "content": value,
            "ttl": ttl,
            "proxied": false,
        });

        match list.result.into_iter().next() {
            Some(record) if record.content == value => Ok(()),
            Some(record) => {
                let response = self
                    .http()?
                    .put(format!(
                        "{}/zones/{}/dns_records/{}",
                        self.api_base, zone, record.id
                    ))
                    .bearer_auth(&self.token)
                    .json(&payload)
                    .send()
                    .await
                    .context("cloudflare record update")?;
                let _: serde_json::Value = Self::check(response, "cloudflare record update").await?;
                Ok(())
            }
            None => {
                let response = self
                    .http()?
                    .post(format!("{}/zones/{}/dns_records", self.api_base, zone))
                    .bearer_auth(&self.token)
                    .json(&payload)
                    .send()
                    .await
                    .context("cloudflare record create")?;
                let _: serde_json::Value = Self::check(response, "cloudflare record create").await?;
                Ok(())
            }
        }
    }
}
