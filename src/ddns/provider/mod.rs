//! DNS provider adapters.
//!
//! Every adapter implements an idempotent upsert: when the remote record
//! already carries the desired value, no write is issued.

pub mod alidns;
pub mod cloudflare;
pub mod dnspod;
pub mod webhook;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use alidns::AliDns;
pub use cloudflare::Cloudflare;
pub use dnspod::Dnspod;
pub use webhook::WebhookDns;

pub(crate) const API_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Ensure `rr`.`domain` of `record_type` points at `value`.
    async fn upsert(
        &self,
        rr: &str,
        domain: &str,
        record_type: &str,
        value: &str,
        ttl: u32,
    ) -> Result<()>;
}

/// Adapter factory keyed by the persisted provider name.
pub fn create(name: &str, access_id: &str, access_secret: &str) -> Option<Box<dyn DnsProvider>> {
    match name.to_lowercase().as_str() {
        "alidns" | "aliyun" => Some(Box::new(AliDns::new(access_id, access_secret))),
        // access_id doubles as an optional fixed zone id
        "cloudflare" | "cf" => Some(Box::new(Cloudflare::new(access_secret, access_id))),
        "dnspod" => Some(Box::new(Dnspod::new(access_id, access_secret))),
        // access_id carries the URL template, access_secret the method
        "webhook" => Some(Box::new(WebhookDns::new(access_id, access_secret))),
        _ => None,
    }
}

/// Split a full domain into `(rr, root)`: `home.example.com` →
/// `("home", "example.com")`, a bare root maps to `("@", root)`.
pub fn split_domain(full: &str) -> (String, String) {
    let parts: Vec<&str> = full.split('.').collect();
    if parts.len() <= 2 {
        return ("@".to_string(), full.to_string());
    }
    (
        parts[..parts.len() - 2].join("."),
        parts[parts.len() - 2..].join("."),
    )
}

/// Full record name from an `(rr, root)` pair.
pub fn record_name(rr: &str, domain: &str) -> String {
    if rr == "@" {
        domain.to_string()
    } else {
        format!("{}.{}", rr, domain)
    }
}

/// RFC 3986 percent-encoding with the unreserved set, as the Alibaba
/// signature canonicalization requires (space → %20, `*` → %2A, `~` kept).
pub(crate) fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_subdomain() {
        assert_eq!(
            split_domain("home.example.com"),
            ("home".to_string(), "example.com".to_string())
        );
        assert_eq!(
            split_domain("a.b.example.com"),
            ("a.b".to_string(), "example.com".to_string())
        );
    }

    #[test]
    fn split_bare_root() {
        assert_eq!(
            split_domain("example.com"),
            ("@".to_string(), "example.com".to_string())
        );
    }

    #[test]
    fn record_name_rebuild() {
        assert_eq!(record_name("home", "example.com"), "home.example.com");
        assert_eq!(record_name("@", "example.com"), "example.com");
    }

    #[test]
    fn factory_known_providers() {
        assert!(create("alidns", "id", "secret").is_some());
        assert!(create("Cloudflare", "", "token").is_some());
        assert!(create("dnspod", "id", "key").is_some());
        assert!(create("webhook", "https://x/{ip}", "GET").is_some());
        assert!(create("route53", "id", "secret").is_none());
    }

    #[test]
    fn percent_encoding_rules() {
        assert_eq!(percent_encode("abc-XYZ_0.9~"), "abc-XYZ_0.9~");
        assert_eq!(percent_encode("a b"), "a%20b");
        assert_eq!(percent_encode("a*b"), "a%2Ab");
        assert_eq!(percent_encode("a=b&c"), "a%3Db%26c");
        assert_eq!(percent_encode("时"), "%E6%97%B6");
    }
}
