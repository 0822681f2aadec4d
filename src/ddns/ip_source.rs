//! Current-IP resolution for DDNS tasks.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::common::net::interface_ip;
use crate::common::Error;
use crate::store::{DdnsTask, IpFamily, IpSource};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_V4_URLS: &[&str] = &[
    "https://4.ipw.cn",
    "https://ip.3322.net",
    "https://myip4.ipip.net",
    "https://v4.ident.me",
];

pub const DEFAULT_V6_URLS: &[&str] = &[
    "https://6.ipw.cn",
    "https://ipv6.ddnspod.com",
    "https://v6.ident.me",
];

const V4_PATTERN: &str =
    r"(25[0-5]|2[0-4]\d|1\d{2}|[1-9]\d|\d)(\.(25[0-5]|2[0-4]\d|1\d{2}|[1-9]\d|\d)){3}";
const V6_PATTERN: &str = r"([0-9a-fA-F]{0,4}:){2,7}[0-9a-fA-F]{0,4}";

pub fn default_regex(family: IpFamily) -> &'static Regex {
    static V4: OnceLock<Regex> = OnceLock::new();
    static V6: OnceLock<Regex> = OnceLock::new();
    match family {
        IpFamily::V4 => V4.get_or_init(|| Regex::new(V4_PATTERN).unwrap()),
        IpFamily::V6 => V6.get_or_init(|| Regex::new(V6_PATTERN).unwrap()),
    }
}

/// Resolve the task's current IP according to its `ip_source`.
///
/// A custom `ip_regex` replaces the default extraction pattern for URL
/// probes and post-filters the other sources; a non-match fails the cycle.
pub async fn current_ip(client: &reqwest::Client, task: &DdnsTask) -> Result<String> {
    let custom_re = if task.ip_regex.is_empty() {
        None
    } else {
        Some(
            Regex::new(&task.ip_regex)
                .map_err(|e| Error::Config(format!("invalid ip_regex: {}", e)))?,
        )
    };

    match &task.ip_source {
        IpSource::Custom { ip } => {
            if ip.is_empty() {
                return Err(Error::Config("custom IP source is empty".into()).into());
            }
            post_filter(ip, custom_re.as_ref())
        }
        IpSource::Interface { name } => {
            let ip = interface_ip(name, task.family == IpFamily::V6)?.to_string();
            post_filter(&ip, custom_re.as_ref())
        }
        IpSource::Url { urls } => {
            let effective: Vec<&str> = if urls.is_empty() {
                match task.family {
                    IpFamily::V4 => DEFAULT_V4_URLS.to_vec(),
                    IpFamily::V6 => DEFAULT_V6_URLS.to_vec(),
                }
            } else {
                urls.iter().map(|s| s.as_str()).collect()
            };
            let re = custom_re
                .as_ref()
                .unwrap_or_else(|| default_regex(task.family));
            fetch_from_urls(client, &effective, re).await
        }
    }
}

fn post_filter(ip: &str, re: Option<&Regex>) -> Result<String> {
    match re {
        None => Ok(ip.to_string()),
        Some(re) => re
            .find(ip)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| anyhow::anyhow!("IP '{}' does not match ip_regex", ip)),
    }
}

async fn fetch_from_urls(
    client: &reqwest::Client,
    urls: &[&str],
    re: &Regex,
) -> Result<String> {
    let mut last_error = None;
    for url in urls {
        let response = match client.get(*url).timeout(PROBE_TIMEOUT).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = url, error = %e, "IP probe failed");
                last_error = Some(e.to_string());
                continue;
            }
        };
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                last_error = Some(e.to_string());
                continue;
            }
        };
        if let Some(m) = re.find(&body) {
            return Ok(m.as_str().to_string());
        }
        debug!(url = url, "IP probe response had no IP-looking match");
    }
    match last_error {
        Some(e) => Err(anyhow::anyhow!("all IP probe URLs failed, last error: {}", e)),
        None => Err(anyhow::anyhow!("no IP probe URL returned a usable address")),
    }
    .context("resolve current IP")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_pattern_extracts_from_noise() {
        let re = default_regex(IpFamily::V4);
        let body = "current ip: 203.0.113.57\n";
        assert_eq!(re.find(body).unwrap().as_str(), "203.0.113.57");
    }

    #[test]
    fn v4_pattern_rejects_out_of_range_octets() {
        let re = default_regex(IpFamily::V4);
        // 999.1.2.3 as a whole is not a match start; the regex finds the
        // valid suffix instead.
        let m = re.find("999.1.2.3").unwrap().as_str();
        assert_ne!(m, "999.1.2.3");
    }

    #[test]
    fn v6_pattern_matches_compressed() {
        let re = default_regex(IpFamily::V6);
        assert!(re.is_match("2001:db8::1"));
        assert!(re.is_match("fe80:0:0:0:1:2:3:4"));
    }

    #[test]
    fn post_filter_applies_custom_regex() {
        let re = Regex::new(r"^10\.\d+\.\d+\.\d+$").unwrap();
        assert_eq!(post_filter("10.1.2.3", Some(&re)).unwrap(), "10.1.2.3");
        assert!(post_filter("192.168.1.1", Some(&re)).is_err());
        assert_eq!(post_filter("anything", None).unwrap(), "anything");
    }

    #[tokio::test]
    async fn custom_source_returns_verbatim() {
        let task: DdnsTask = serde_json::from_value(serde_json::json!({
            "id": 1, "name": "t",
            "ip_source": {"kind": "custom", "ip": "198.51.100.4"}
        }))
        .unwrap();
        let client = reqwest::Client::new();
        assert_eq!(current_ip(&client, &task).await.unwrap(), "198.51.100.4");
    }

    #[tokio::test]
    async fn empty_custom_source_is_config_error() {
        let task: DdnsTask = serde_json::from_value(serde_json::json!({
            "id": 1, "name": "t",
            "ip_source": {"kind": "custom", "ip": ""}
        }))
        .unwrap();
        let client = reqwest::Client::new();
        let err = current_ip(&client, &task).await.unwrap_err();
        assert!(crate::common::error::is_fatal(&err));
    }

    #[tokio::test]
    async fn invalid_custom_regex_is_config_error() {
        let task: DdnsTask = serde_json::from_value(serde_json::json!({
            "id": 1, "name": "t",
            "ip_source": {"kind": "custom", "ip": "1.2.3.4"},
            "ip_regex": "("
        }))
        .unwrap();
        let client = reqwest::Client::new();
        assert!(current_ip(&client, &task).await.is_err());
    }
}
