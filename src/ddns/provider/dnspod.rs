//! DNSPod adapter (Tencent Cloud API v3, TC3-HMAC-SHA256 signed).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::common::sign::tc3_authorization;
use crate::common::Error;

use super::{DnsProvider, API_TIMEOUT};

const HOST: &str = "dnspod.tencentcloudapi.com";
const API_VERSION: &str = "2021-03-23";
const RECORD_LINE: &str = "默认";

pub struct Dnspod {
    secret_id: String,
    secret_key: String,
    endpoint: String,
}

impl Dnspod {
    pub fn new(secret_id: &str, secret_key: &str) -> Self {
        Self {
            secret_id: secret_id.to_string(),
            secret_key: secret_key.to_string(),
            endpoint: format!("https://{}", HOST),
        }
    }

    async fn request(&self, action: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        let payload = payload.to_string();
        let timestamp = chrono::Utc::now().timestamp();
        let authorization = tc3_authorization(
            &self.secret_id,
            &self.secret_key,
            "dnspod",
            HOST,
            &payload,
            timestamp,
        );

        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("http client")?;
        let response = client
            .post(&self.endpoint)
            .header("Authorization", authorization)
            .header("Content-Type", "application/json; charset=utf-8")
            .header("Host", HOST)
            .header("X-TC-Action", action)
            .header("X-TC-Timestamp", timestamp.to_string())
            .header("X-TC-Version", API_VERSION)
            .body(payload)
            .send()
            .await
            .with_context(|| format!("dnspod {}", action))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if status >= 400 {
            return Err(Error::Protocol(format!(
                "dnspod {}: HTTP {}: {}",
                action, status, body
            ))
            .into());
        }
        let parsed: serde_json::Value =
            serde_json::from_str(&body).with_context(|| format!("parse dnspod {} response", action))?;

        if let Some(error) = parsed.get("Response").and_then(|r| r.get("Error")) {
            let code = error.get("Code").and_then(|c| c.as_str()).unwrap_or("");
            // An empty record list is an "error" in this API; callers treat
            // it as zero rows.
            if code.starts_with("ResourceNotFound") {
                return Ok(json!({ "Response": { "RecordList": [] } }));
            }
            let message = error.get("Message").and_then(|m| m.as_str()).unwrap_or("?");
            if code.starts_with("AuthFailure") {
                return Err(Error::AuthDenied(format!("dnspod {}: {}", code, message)).into());
            }
            return Err(Error::Protocol(format!("dnspod {}: {}", code, message)).into());
        }
        Ok(parsed)
    }
}

#[async_trait]
impl DnsProvider for Dnspod {
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
                "DescribeRecordList",
                json!({
                    "Domain": domain,
                    "Subdomain": rr,
                    "RecordType": record_type,
                }),
            )
            .await?;

        let records = listed
            .get("Response")
            .and_then(|r| r.get("RecordList"))
            .and_then(|l| l.as_array())
            .cloned()
            .unwrap_or_default();
        let ttl = if ttl == 0 { 600 } else { ttl };

        match records.first() {
            Some(record)
                if record.get("Value").and_then(|v| v.as_str()) == Some(value) =>
            {
                Ok(())
            }
            Some(record) => {
                let record_id = record
                    .get("RecordId")
                    .and_then(|i| i.as_u64())
                    .ok_or_else(|| Error::Protocol("record without RecordId".into()))?;
                self.request(
                    "ModifyRecord",
                    json!({
                        "Domain": domain,
                        "RecordId": record_id,
                        "SubDomain": rr,
                        "RecordType": record_type,
                        "RecordLine": RECORD_LINE,
                        "Value": value,
                        "TTL": ttl,
                    }),
                )
                .await?;
                Ok(())
            }
            None => {
                self.request(
                    "CreateRecord",
                    json!({
                        "Domain": domain,
                        "SubDomain": rr,
                        "RecordType": record_type,
                        "RecordLine": RECORD_LINE,
                        "Value": value,
                        "TTL": ttl,
                    }),
                )
                .await?;
                Ok(())
            }
        }
    }
}
