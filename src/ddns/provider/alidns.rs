//! Alibaba Cloud DNS adapter: HMAC-SHA1 signed GET requests.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;

use crate::common::Error;

use super::{percent_encode, DnsProvider, API_TIMEOUT};

const ENDPOINT: &str = "https://alidns.aliyuncs.com/";
const API_VERSION: &str = "2015-01-09";

pub struct AliDns {
    access_key_id: String,
    access_key_secret: String,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    #[serde(rename = "DomainRecords", default)]
    domain_records: Option<DomainRecords>,
}

#[derive(Debug, Deserialize)]
struct DomainRecords {
    #[serde(rename = "Record", default)]
    record: Vec<Record>,
}

#[derive(Debug, Deserialize)]
struct Record {
    #[serde(rename = "RecordId")]
    record_id: String,
    #[serde(rename = "Value")]
    value: String,
}

impl AliDns {
    pub fn new(access_key_id: &str, access_key_secret: &str) -> Self {
        Self {
            access_key_id: access_key_id.to_string(),
            access_key_secret: access_key_secret.to_string(),
            endpoint: ENDPOINT.to_string(),
        }
    }

    /// HMAC-SHA1 over the canonicalized, percent-encoded query string.
    fn sign(&self, params: &BTreeMap<String, String>) -> String {
        let canonical = params
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let string_to_sign = format!("GET&%2F&{}", percent_encode(&canonical));

        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(
            format!("{}&", self.access_key_secret).as_bytes(),
        )
        .expect("HMAC can take key of any size");
        mac.update(string_to_sign.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    async fn request(
        &self,
        action: &str,
        extra: &[(&str, &str)],
    ) -> Result<serde_json::Value> {
        let mut params: BTreeMap<String, String> = BTreeMap::new();
        params.insert("Action".into(), action.into());
        params.insert("AccessKeyId".into(), self.access_key_id.clone());
        params.insert("Format".into(), "JSON".into());
        params.insert("Version".into(), API_VERSION.into());
        params.insert("SignatureMethod".into(), "HMAC-SHA1".into());
        params.insert("SignatureVersion".into(), "1.0".into());
        params.insert(
            "SignatureNonce".into(),
            format!("{:x}", rand::random::<u64>()),
        );
        params.insert(
            "Timestamp".into(),
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        );
        for (k, v) in extra {
            params.insert((*k).into(), (*v).into());
        }
        let signature = self.sign(&params);
        params.insert("Signature".into(), signature);

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("http client")?;
        let response = client
            .get(format!("{}?{}", self.endpoint, query))
            .send()
            .await
            .with_context(|| format!("alidns {}", action))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if status >= 400 {
            if body.contains("InvalidAccessKeyId") || body.contains("SignatureDoesNotMatch") {
                return Err(
                    Error::AuthDenied(format!("alidns {}: HTTP {}: {}", action, status, body))
                        .into(),
                );
            }
            return Err(Error::Protocol(format!(
                "alidns {}: HTTP {}: {}",
                action, status, body
            ))
            .into());
        }
        serde_json::from_str(&body).with_context(|| format!("parse alidns {} response", action))
    }
}

#[async_trait]
impl DnsProvider for AliDns {
    async fn upsert(
        &self,
        rr: &str,
        domain: &str,
        record_type: &str,
        value: &str,
        ttl: u32,
    ) -> Result<()> {
        let listed = self
            .request(
                "DescribeDomainRecords",
                &[
                    ("DomainName", domain),
                    ("RRKeyWord", rr),
                    ("Type", record_type),
                ],
            )
            .await?;
        let listed: DescribeResponse =
            serde_json::from_value(listed).context("parse DescribeDomainRecords")?;

        let ttl = if ttl == 0 { 600 } else { ttl };
        let ttl_str = ttl.to_string();

        match listed
            .domain_records
            .map(|r| r.record)
            .unwrap_or_default()
            .into_iter()
            .next()
        {
            Some(record) if record.value == value => Ok(()),
            Some(record) => {
                self.request(
                    "UpdateDomainRecord",
                    &[
                        ("RecordId", record.record_id.as_str()),
                        ("RR", rr),
                        ("Type", record_type),
                        ("Value", value),
                        ("TTL", ttl_str.as_str()),
                    ],
                )
                .await?;
                Ok(())
            }
            None => {
                self.request(
                    "AddDomainRecord",
                    &[
                        ("DomainName", domain),
                        ("RR", rr),
                        ("Type", record_type),
                        ("Value", value),
                        ("TTL", ttl_str.as_str()),
                    ],
                )
                .await?;
                Ok(())
            }
        }
    }
}
