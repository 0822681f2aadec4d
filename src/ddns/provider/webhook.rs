//! Webhook "provider": template-expanded HTTP call instead of a DNS API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::common::Error;

use super::{percent_encode, record_name, DnsProvider, API_TIMEOUT};

pub struct WebhookDns {
    url_template: String,
    method: String,
}

impl WebhookDns {
    pub fn new(url_template: &str, method: &str) -> Self {
        Self {
            url_template: url_template.to_string(),
            method: if method.is_empty() {
                "GET".to_string()
            } else {
                method.to_uppercase()
            },
        }
    }

    fn expand_url(&self, domain: &str, record_type: &str, ip: &str) -> String {
        self.url_template
            .replace("{ip}", &percent_encode(ip))
            .replace("{domain}", &percent_encode(domain))
            .replace("{type}", &percent_encode(record_type))
    }
}

#[async_trait]
impl DnsProvider for WebhookDns {
    async fn upsert(
        &self,
        rr: &str,
        domain: &str,
        record_type: &str,
        value: &str,
        ttl: u32,
    ) -> Result<()> {
        if self.url_template.is_empty() {
            return Err(Error::Config("webhook URL is empty".into()).into());
        }
        let full_domain = record_name(rr, domain);
        let url = self.expand_url(&full_domain, record_type, value);

        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("http client")?;

        let request = match self.method.as_str() {
            "POST" | "PUT" => client
                .request(self.method.parse().unwrap_or(reqwest::Method::POST), &url)
                .json(&json!({
                    "ip": value,
                    "domain": full_domain,
                    "type": record_type,
                    "ttl": ttl,
                })),
            _ => client.get(&url),
        };

        let response = request.send().await.context("send webhook")?;
        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!("webhook: HTTP {}: {}", status, body)).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_expansion() {
        let hook = WebhookDns::new("https://dns.example/update?host={domain}&ip={ip}&t={type}", "");
        let url = hook.expand_url("home.example.com", "A", "1.2.3.4");
        assert_eq!(
            url,
            "https://dns.example/update?host=home.example.com&ip=1.2.3.4&t=A"
        );
    }

    #[test]
    fn template_encodes_values() {
        let hook = WebhookDns::new("https://x/{ip}", "");
        assert_eq!(hook.expand_url("d", "AAAA", "2001:db8::1"), "https://x/2001%3Adb8%3A%3A1");
    }

    #[test]
    fn method_defaults_to_get() {
        let hook = WebhookDns::new("https://x", "");
        assert_eq!(hook.method, "GET");
        let hook = WebhookDns::new("https://x", "post");
        assert_eq!(hook.method, "POST");
    }
}
