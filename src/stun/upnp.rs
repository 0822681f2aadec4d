//! UPnP IGD client: SSDP discovery, device description scrape, SOAP calls.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::common::net::outbound_local_ip;
use crate::common::Error;

const SSDP_ADDR: &str = "239.255.255.250:1900";
const SSDP_TIMEOUT: Duration = Duration::from_secs(3);
const SOAP_TIMEOUT: Duration = Duration::from_secs(10);

const SSDP_SEARCH: &str = "M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: 2\r\n\
ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\r\n";

const WAN_IP_SERVICE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
const WAN_PPP_SERVICE: &str = "urn:schemas-upnp-org:service:WANPPPConnection:1";

const MAPPING_DESCRIPTION: &str = "netward";

pub struct Gateway {
    control_url: String,
    service_type: String,
    http: reqwest::Client,
}

/// Discover the gateway, fetch its external IP, and map `port` on it.
/// Returns the external `(ip, port)` pair.
pub async fn map_port(port: u16, protocol: &str) -> Result<(String, u16)> {
    let gateway = discover().await?;
    let external_ip = gateway.external_ip().await?;
    let local_ip = outbound_local_ip().await.context("local LAN IP")?;

    let protocol = if protocol.eq_ignore_ascii_case("udp") {
        "UDP"
    } else {
        "TCP"
    };
    gateway
        .add_port_mapping(port, port, local_ip, protocol, MAPPING_DESCRIPTION)
        .await?;
    Ok((external_ip, port))
}

/// SSDP multicast search followed by a device-description fetch.
pub async fn discover() -> Result<Gateway> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.context("ssdp socket")?;
    socket
        .send_to(SSDP_SEARCH.as_bytes(), SSDP_ADDR)
        .await
        .context("ssdp search")?;

    let mut buf = [0u8; 4096];
    let (n, from) = tokio::time::timeout(SSDP_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| Error::Timeout("no UPnP gateway answered".into()))?
        .context("ssdp recv")?;

    let response = String::from_utf8_lossy(&buf[..n]).to_string();
    let location = find_header(&response, "location")
        .ok_or_else(|| Error::Protocol("SSDP response without LOCATION".into()))?;
    debug!(gateway = %from, location = %location, "UPnP gateway discovered");

    let http = reqwest::Client::builder()
        .timeout(SOAP_TIMEOUT)
        .build()
        .context("http client")?;

    let description = http
        .get(&location)
        .send()
        .await
        .context("fetch device description")?
        .text()
        .await
        .context("read device description")?;

    let (control_url, service_type) = extract_control_url(&description, &location)?;
    Ok(Gateway {
        control_url,
        service_type,
        http,
    })
}

impl Gateway {
    pub async fn external_ip(&self) -> Result<String> {
        let body = format!(
            "<u:GetExternalIPAddress xmlns:u=\"{}\"></u:GetExternalIPAddress>",
            self.service_type
        );
        let response = self.soap("GetExternalIPAddress", &body).await?;
        extract_tag(&response, "NewExternalIPAddress")
            .ok_or_else(|| Error::Protocol("no external IP in SOAP response".into()).into())
    }

    pub async fn add_port_mapping(
        &self,
        external_port: u16,
        internal_port: u16,
        internal_client: IpAddr,
        protocol: &str,
        description: &str,
    ) -> Result<()> {
        let body = format!(
            "<u:AddPortMapping xmlns:u=\"{service}\">\
<NewRemoteHost></NewRemoteHost>\
<NewExternalPort>{external}</NewExternalPort>\
<NewProtocol>{protocol}</NewProtocol>\
<NewInternalPort>{internal}</NewInternalPort>\
<NewInternalClient>{client}</NewInternalClient>\
<NewEnabled>1</NewEnabled>\
<NewPortMappingDescription>{description}</NewPortMappingDescription>\
<NewLeaseDuration>0</NewLeaseDuration>\
</u:AddPortMapping>",
            service = self.service_type,
            external = external_port,
            protocol = protocol,
            internal = internal_port,
            client = internal_client,
            description = description,
        );
        self.soap("AddPortMapping", &body).await?;
        Ok(())
    }

    /// SOAP 1.1 POST against the control URL.
    async fn soap(&self, action: &str, body: &str) -> Result<String> {
        let envelope = format!(
            "<?xml version=\"1.0\"?>\n\
<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\n\
<s:Body>{}</s:Body>\n\
</s:Envelope>",
            body
        );

        let response = self
            .http
            .post(&self.control_url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header(
                "SOAPAction",
                format!("\"{}#{}\"", self.service_type, action),
            )
            .body(envelope)
            .send()
            .await
            .with_context(|| format!("SOAP {}", action))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.as_u16() >= 400 {
            return Err(Error::Protocol(format!(
                "SOAP {} failed: HTTP {}: {}",
                action, status, text
            ))
            .into());
        }
        Ok(text)
    }
}

/// Case-insensitive header lookup in a raw HTTP-ish response.
fn find_header(response: &str, name: &str) -> Option<String> {
    for line in response.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Locate the WANIPConnection/WANPPPConnection control URL in the device
/// description XML. Relative URLs resolve against the LOCATION's
/// scheme+authority.
fn extract_control_url(xml: &str, location: &str) -> Result<(String, String)> {
    for service_type in [WAN_IP_SERVICE, WAN_PPP_SERVICE] {
        let Some(service_at) = xml.find(service_type) else {
            continue;
        };
        let tail = &xml[service_at..];
        let Some(url) = extract_tag(tail, "controlURL") else {
            continue;
        };
        let url = if url.starts_with("http") {
            url
        } else {
            format!("{}{}", base_url(location), url)
        };
        return Ok((url, service_type.to_string()));
    }
    Err(Error::Protocol("no WANIPConnection or WANPPPConnection service".into()).into())
}

/// `http://host:port` prefix of a URL.
fn base_url(location: &str) -> String {
    let after_scheme = location.find("://").map(|i| i + 3).unwrap_or(0);
    match location[after_scheme..].find('/') {
        Some(slash) => location[..after_scheme + slash].to_string(),
        None => location.to_string(),
    }
}

fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim().to_string())
}
