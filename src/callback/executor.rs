//! Callback executors: push an address change into an external system.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use crate::common::sign::tc3_authorization;
use crate::common::Error;
use crate::store::CallbackAccount;

use super::TriggerEvent;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn execute(account: &CallbackAccount, event: &TriggerEvent) -> Result<()> {
    match account.kind.as_str() {
        "webhook" => webhook(account, event).await,
        "cf_origin" => cf_origin(account, event).await,
        "ali_esa" => ali_esa(account, event).await,
        "tencent_eo" => tencent_eo(account, event).await,
        other => Err(Error::Config(format!("unsupported callback account type: {}", other)).into()),
    }
}

fn cfg<'a>(account: &'a CallbackAccount, key: &str) -> Option<&'a str> {
    account.config.get(key).and_then(|v| v.as_str())
}

fn require<'a>(account: &'a CallbackAccount, key: &str) -> Result<&'a str> {
    cfg(account, key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Config(format!("callback account missing '{}'", key)).into())
}

/// Event target port: a fixed `origin_port` in the account config wins over
/// the event's new port.
fn target_port(account: &CallbackAccount, event: &TriggerEvent) -> u16 {
    cfg(account, "origin_port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(event.new_port)
}

fn client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("http client")
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<String> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() >= 400 {
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::AuthDenied(format!("{}: HTTP {}: {}", what, status, body)).into());
        }
        return Err(Error::Protocol(format!("{}: HTTP {}: {}", what, status, body)).into());
    }
    Ok(body)
}

/// Generic webhook: JSON POST (or configured method) with the full event.
async fn webhook(account: &CallbackAccount, event: &TriggerEvent) -> Result<()> {
    let url = require(account, "url")?;
    let method = cfg(account, "method").unwrap_or("POST").to_uppercase();

    let payload = json!({
        "event": event.kind.trigger_type(),
        "new_ip": event.new_ip,
        "new_port": event.new_port,
        "old_ip": event.old_ip,
        "old_port": event.old_port,
    });

    let client = client()?;
    let mut request = client
        .request(method.parse().unwrap_or(reqwest::Method::POST), url)
        .json(&payload);
    if let Some(token) = cfg(account, "token").filter(|t| !t.is_empty()) {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.context("send webhook")?;
    check_status(response, "webhook").await?;
    Ok(())
}

/// Rewrite the origin port of a Cloudflare origin-rule via the Rulesets API.
async fn cf_origin(account: &CallbackAccount, event: &TriggerEvent) -> Result<()> {
    let api_token = require(account, "api_token")?;
    let zone_id = require(account, "zone_id")?;
    let rule_id = require(account, "rule_id")?;
    let port = target_port(account, event);

    let url = format!(
        "https://api.cloudflare.com/client/v4/zones/{}/rulesets/phases/http_request_origin/entrypoint/rules/{}",
        zone_id, rule_id
    );
    let body = json!({
        "action": "route",
        "action_parameters": { "origin": { "port": port } },
    });

    let response = client()?
        .patch(&url)
        .bearer_auth(api_token)
        .json(&body)
        .send()
        .await
        .context("cloudflare rule patch")?;
    check_status(response, "cloudflare origin rule").await?;
    Ok(())
}

/// Point an Alibaba ESA origin pool at the new address.
async fn ali_esa(account: &CallbackAccount, event: &TriggerEvent) -> Result<()> {
    let access_key_id = require(account, "access_key_id")?;
    let _access_key_secret = require(account, "access_key_secret")?;
    let site_id = require(account, "site_id")?;
    let port = target_port(account, event);

    let mut body = json!({
        "SiteId": site_id,
        "Origin": format!("{}:{}", event.new_ip, port),
    });
    if let Some(rule_id) = cfg(account, "rule_id").filter(|r| !r.is_empty()) {
        body["Id"] = json!(rule_id);
    }

    let response = client()?
        .post("https://esa.aliyuncs.com/")
        .header("x-acs-action", "UpdateOriginPool")
        .header("x-acs-version", "2024-09-10")
        .header("x-acs-accesskeyid", access_key_id)
        .json(&body)
        .send()
        .await
        .context("alibaba esa request")?;
    check_status(response, "alibaba esa").await?;
    Ok(())
}

/// Update a Tencent EdgeOne origin group (TC3-signed `ModifyOriginGroup`).
async fn tencent_eo(account: &CallbackAccount, event: &TriggerEvent) -> Result<()> {
    let secret_id = require(account, "secret_id")?;
    let secret_key = require(account, "secret_key")?;
    let zone_id = require(account, "zone_id")?;
    let group_id = cfg(account, "rule_id").unwrap_or_default();
    let port = target_port(account, event);

    let host = "teo.tencentcloudapi.com";
    let body = json!({
        "ZoneId": zone_id,
        "OriginGroupId": group_id,
        "Origins": [{
            "OriginId": "origin-1",
            "Origin": event.new_ip,
            "OriginPort": port.to_string(),
            "Weight": 100,
            "Private": false,
        }],
    });
    let payload = body.to_string();
    let timestamp = chrono::Utc::now().timestamp();
    let authorization =
        tc3_authorization(secret_id, secret_key, "teo", host, &payload, timestamp);

    let response = client()?
        .post(format!("https://{}/", host))
        .header("Authorization", authorization)
        .header("Content-Type", "application/json; charset=utf-8")
        .header("Host", host)
        .header("X-TC-Action", "ModifyOriginGroup")
        .header("X-TC-Version", "2022-09-01")
        .header("X-TC-Timestamp", timestamp.to_string())
        .body(payload)
        .send()
        .await
        .context("tencent eo request")?;
    let body = check_status(response, "tencent eo").await?;

    // API-level errors come back 200 with an Error object.
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&body) {
        if let Some(error) = parsed.get("Response").and_then(|r| r.get("Error")) {
            return Err(Error::Protocol(format!(
                "tencent eo error: {} - {}",
                error.get("Code").and_then(|c| c.as_str()).unwrap_or("?"),
                error.get("Message").and_then(|m| m.as_str()).unwrap_or("?"),
            ))
            .into());
        }
    }
    Ok(())
}
