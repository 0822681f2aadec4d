//! Request signing shared by the Tencent Cloud API consumers
//! (DNSPod records, EdgeOne origin callbacks).

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex(&hasher.finalize())
}

pub fn hmac_sha256(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// TC3-HMAC-SHA256 `Authorization` header for a Tencent Cloud API v3 call.
///
/// The request is always `POST /` with JSON body and `content-type;host`
/// as the signed header set. Returns the full header value.
pub fn tc3_authorization(
    secret_id: &str,
    secret_key: &str,
    service: &str,
    host: &str,
    payload: &str,
    timestamp: i64,
) -> String {
    let date = chrono::DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string();

    let canonical_request = [
        "POST",
        "/",
        "",
        &format!("content-type:application/json; charset=utf-8\nhost:{}\n", host),
        "content-type;host",
        &sha256_hex(payload),
    ]
    .join("\n");

    let credential_scope = format!("{}/{}/tc3_request", date, service);
    let string_to_sign = [
        "TC3-HMAC-SHA256".to_string(),
        timestamp.to_string(),
        credential_scope.clone(),
        sha256_hex(&canonical_request),
    ]
    .join("\n");

    let secret_date = hmac_sha256(format!("TC3{}", secret_key).as_bytes(), &date);
    let secret_service = hmac_sha256(&secret_date, service);
    let secret_signing = hmac_sha256(&secret_service, "tc3_request");
    let signature = hex(&hmac_sha256(&secret_signing, &string_to_sign));

    format!(
        "TC3-HMAC-SHA256 Credential={}/{}, SignedHeaders=content-type;host, Signature={}",
        secret_id, credential_scope, signature
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(hex(&[0x00, 0xAB, 0xFF]), "00abff");
    }

    #[test]
    fn tc3_header_shape() {
        let auth = tc3_authorization(
            "AKIDexample",
            "secret",
            "dnspod",
            "dnspod.tencentcloudapi.com",
            "{}",
            1_700_000_000,
        );
        assert!(auth.starts_with("TC3-HMAC-SHA256 Credential=AKIDexample/2023-11-14/dnspod/tc3_request"));
        assert!(auth.contains("SignedHeaders=content-type;host"));
        // 32-byte signature in hex
        let sig = auth.rsplit("Signature=").next().unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tc3_signature_is_deterministic() {
        let a = tc3_authorization("id", "key", "teo", "teo.tencentcloudapi.com", "{\"a\":1}", 1_700_000_000);
        let b = tc3_authorization("id", "key", "teo", "teo.tencentcloudapi.com", "{\"a\":1}", 1_700_000_000);
        assert_eq!(a, b);

        let c = tc3_authorization("id", "key", "teo", "teo.tencentcloudapi.com", "{\"a\":2}", 1_700_000_000);
        assert_ne!(a, c);
    }
}
