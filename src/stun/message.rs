//! RFC 3489 STUN message encoding and parsing.
//!
//! 20-byte header (type, length, magic cookie, 12-byte transaction id)
//! followed by TLV attributes at 4-byte alignment.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::BufMut;

use super::StunError;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_LEN: usize = 20;

pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_RESPONSE: u16 = 0x0101;

pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_CHANGE_REQUEST: u16 = 0x0003;
pub const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const CHANGE_IP_FLAG: u32 = 0x04;
const CHANGE_PORT_FLAG: u32 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u16,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<(u16, Vec<u8>)>,
}

impl Message {
    /// Binding Request with a fresh random transaction id and an optional
    /// CHANGE-REQUEST attribute.
    pub fn binding_request(change_ip: bool, change_port: bool) -> Self {
        let mut attributes = Vec::new();
        if change_ip || change_port {
            let mut flags: u32 = 0;
            if change_ip {
                flags |= CHANGE_IP_FLAG;
            }
            if change_port {
                flags |= CHANGE_PORT_FLAG;
            }
            attributes.push((ATTR_CHANGE_REQUEST, flags.to_be_bytes().to_vec()));
        }
        Self {
            msg_type: BINDING_REQUEST,
            transaction_id: rand::random(),
            attributes,
        }
    }

    pub fn is_success(&self) -> bool {
        self.msg_type == BINDING_RESPONSE
    }

    pub fn encode(&self) -> Vec<u8> {
        let body_len: usize = self
            .attributes
            .iter()
            .map(|(_, v)| 4 + v.len() + pad(v.len()))
            .sum();

        let mut buf = Vec::with_capacity(HEADER_LEN + body_len);
        buf.put_u16(self.msg_type);
        buf.put_u16(body_len as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);
        for (attr_type, value) in &self.attributes {
            buf.put_u16(*attr_type);
            buf.put_u16(value.len() as u16);
            buf.put_slice(value);
            buf.put_bytes(0, pad(value.len()));
        }
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, StunError> {
        if data.len() < HEADER_LEN {
            return Err(StunError::BadResponse(format!(
                "message too short: {} bytes",
                data.len()
            )));
        }

        let msg_type = u16::from_be_bytes([data[0], data[1]]);
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        while offset + 4 <= data.len() {
            let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;
            if offset + attr_len > data.len() {
                break;
            }
            attributes.push((attr_type, data[offset..offset + attr_len].to_vec()));
            offset += attr_len + pad(attr_len);
        }

        Ok(Self {
            msg_type,
            transaction_id,
            attributes,
        })
    }

    pub fn attribute(&self, attr_type: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(t, _)| *t == attr_type)
            .map(|(_, v)| v.as_slice())
    }

    /// Public address the server observed, XOR-MAPPED-ADDRESS preferred.
    pub fn mapped_address(&self) -> Result<(IpAddr, u16), StunError> {
        if let Some(data) = self.attribute(ATTR_XOR_MAPPED_ADDRESS) {
            return decode_address(data, Some(&self.transaction_id));
        }
        if let Some(data) = self.attribute(ATTR_MAPPED_ADDRESS) {
            return decode_address(data, None);
        }
        Err(StunError::BadResponse(
            "no mapped address attribute".into(),
        ))
    }

    /// Alternate server endpoint announced for Test I(b).
    pub fn changed_address(&self) -> Result<(IpAddr, u16), StunError> {
        let data = self
            .attribute(ATTR_CHANGED_ADDRESS)
            .ok_or_else(|| StunError::BadResponse("no CHANGED-ADDRESS attribute".into()))?;
        decode_address(data, None)
    }
}

fn pad(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Decode a (XOR-)address attribute: family(1 at offset 1), port(2), addr.
/// XOR decoding folds in the magic cookie, and for IPv6 the transaction id.
fn decode_address(data: &[u8], xor_tid: Option<&[u8; 12]>) -> Result<(IpAddr, u16), StunError> {
    if data.len() < 8 {
        return Err(StunError::BadResponse("address attribute too short".into()));
    }
    let family = data[1];
    let raw_port = u16::from_be_bytes([data[2], data[3]]);
    let cookie = MAGIC_COOKIE.to_be_bytes();

    match family {
        0x01 => {
            let mut octets = [data[4], data[5], data[6], data[7]];
            let port = match xor_tid {
                Some(_) => {
                    for (octet, key) in octets.iter_mut().zip(cookie.iter()) {
                        *octet ^= key;
                    }
                    raw_port ^ (MAGIC_COOKIE >> 16) as u16
                }
                None => raw_port,
            };
            Ok((IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            if data.len() < 20 {
                return Err(StunError::BadResponse("IPv6 address truncated".into()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            let port = match xor_tid {
                Some(tid) => {
                    let mut key = [0u8; 16];
                    key[..4].copy_from_slice(&cookie);
                    key[4..].copy_from_slice(tid);
                    for (octet, k) in octets.iter_mut().zip(key.iter()) {
                        *octet ^= k;
                    }
                    raw_port ^ (MAGIC_COOKIE >> 16) as u16
                }
                None => raw_port,
            };
            Ok((IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(StunError::BadResponse(format!(
            "unknown address family 0x{:02x}",
            other
        ))),
    }
}

/// Build a (XOR-)MAPPED-ADDRESS attribute value. Used by tests and by any
/// embedded responder.
pub fn encode_address(ip: IpAddr, port: u16, xor_tid: Option<&[u8; 12]>) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut out = Vec::new();
    out.push(0);
    match ip {
        IpAddr::V4(v4) => {
            out.push(0x01);
            let port = match xor_tid {
                Some(_) => port ^ (MAGIC_COOKIE >> 16) as u16,
                None => port,
            };
            out.extend_from_slice(&port.to_be_bytes());
            let mut octets = v4.octets();
            if xor_tid.is_some() {
                for (octet, key) in octets.iter_mut().zip(cookie.iter()) {
                    *octet ^= key;
                }
            }
            out.extend_from_slice(&octets);
        }
        IpAddr::V6(v6) => {
            out.push(0x02);
            let port = match xor_tid {
                Some(_) => port ^ (MAGIC_COOKIE >> 16) as u16,
                None => port,
            };
            out.extend_from_slice(&port.to_be_bytes());
            let mut octets = v6.octets();
            if let Some(tid) = xor_tid {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&cookie);
                key[4..].copy_from_slice(tid);
                for (octet, k) in octets.iter_mut().zip(key.iter()) {
                    *octet ^= k;
                }
            }
            out.extend_from_slice(&octets);
        }
    }
    out
}
