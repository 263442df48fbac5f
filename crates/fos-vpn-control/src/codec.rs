//! Control Message Codec
//!
//! Versioned, length-prefixed binary envelopes for the tunnel IPC channel.
//!
//! # Envelope Format
//!
//! ```text
//! +---------+------+------------+------------+-----------------+
//! | version | kind |    seq     |    len     |     payload     |
//! |   u8    |  u8  |  u32 (BE)  |  u32 (BE)  |    len bytes    |
//! +---------+------+------------+------------+-----------------+
//! ```
//!
//! Strings are a `u32` length followed by UTF-8 bytes, optionals a `u8`
//! presence flag, timestamps `u64` unix seconds.

use crate::certificate::Certificate;
use crate::config::{Endpoint, ServerTarget, TunnelConfig, TunnelProtocol};
use crate::features::{NetShieldLevel, VpnFeatures};
use crate::message::{ControlMessage, ControlResponse};
use std::net::IpAddr;
use std::time::Duration;

/// Current envelope version
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope header length
pub const HEADER_LEN: usize = 10;

/// Largest accepted payload
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Longest error text carried in an `Error` response; longer text is cut
pub const MAX_ERROR_LEN: usize = 4096;

const KIND_REFRESH_CERTIFICATE: u8 = 0x01;
const KIND_SET_SESSION_SELECTOR: u8 = 0x02;
const KIND_START_TUNNEL: u8 = 0x03;
const KIND_STOP_TUNNEL: u8 = 0x04;

const KIND_OK: u8 = 0x80;
const KIND_ERROR: u8 = 0x81;
const KIND_ERROR_SESSION_EXPIRED: u8 = 0x82;
const KIND_ERROR_NEED_KEY_REGENERATION: u8 = 0x83;
const KIND_ERROR_TOO_MANY_CERT_REQUESTS: u8 = 0x84;
const KIND_CERTIFICATE: u8 = 0x85;

const FLAG_ACCELERATOR: u8 = 1 << 0;
const FLAG_MODERATE_NAT: u8 = 1 << 1;
const FLAG_PORT_FORWARDING: u8 = 1 << 2;
const FLAG_SAFE_MODE_SET: u8 = 1 << 3;
const FLAG_SAFE_MODE: u8 = 1 << 4;

/// Decoded envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: u8,
    pub seq: u32,
    pub len: usize,
}

impl Header {
    /// Parse and validate a header
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, CodecError> {
        let version = bytes[0];
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let seq = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let len = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(CodecError::TooLarge(len));
        }

        Ok(Self {
            version,
            kind: bytes[1],
            seq,
            len,
        })
    }

    pub fn is_response(&self) -> bool {
        self.kind & 0x80 != 0
    }
}

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("Truncated message")]
    Truncated,

    #[error("Payload too large ({0} bytes)")]
    TooLarge(usize),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Invalid field: {0}")]
    InvalidField(&'static str),
}

/// Encode a request envelope
pub fn encode_request(seq: u32, message: &ControlMessage) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::default();
    let kind = match message {
        ControlMessage::RefreshCertificate { features } => {
            w.put_opt(features.as_ref(), |w, f| w.put_features(f));
            KIND_REFRESH_CERTIFICATE
        }
        ControlMessage::SetSessionSelector { selector, cookie } => {
            w.put_str(selector);
            w.put_opt(cookie.as_ref(), |w, c| w.put_str(c));
            KIND_SET_SESSION_SELECTOR
        }
        ControlMessage::StartTunnel(config) => {
            w.put_tunnel_config(config);
            KIND_START_TUNNEL
        }
        ControlMessage::StopTunnel => KIND_STOP_TUNNEL,
    };
    w.into_envelope(kind, seq)
}

/// Encode a response envelope
pub fn encode_response(seq: u32, response: &ControlResponse) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::default();
    let kind = match response {
        ControlResponse::Ok => KIND_OK,
        ControlResponse::Error(message) => {
            w.put_str(truncate_at_char(message, MAX_ERROR_LEN));
            KIND_ERROR
        }
        ControlResponse::ErrorSessionExpired => KIND_ERROR_SESSION_EXPIRED,
        ControlResponse::ErrorNeedKeyRegeneration => KIND_ERROR_NEED_KEY_REGENERATION,
        ControlResponse::ErrorTooManyCertRequests { retry_after } => {
            w.put_u32(u32::try_from(retry_after.as_secs()).unwrap_or(u32::MAX));
            KIND_ERROR_TOO_MANY_CERT_REQUESTS
        }
        ControlResponse::Certificate(certificate) => {
            w.put_str(&certificate.certificate);
            w.put_u64(certificate.valid_until_unix());
            w.put_u64(certificate.refresh_after_unix());
            w.put_features(&certificate.features);
            KIND_CERTIFICATE
        }
    };
    w.into_envelope(kind, seq)
}

fn truncate_at_char(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Decode a complete request envelope
pub fn decode_request(frame: &[u8]) -> Result<(u32, ControlMessage), CodecError> {
    let (header, mut r) = split_envelope(frame)?;
    let message = match header.kind {
        KIND_REFRESH_CERTIFICATE => ControlMessage::RefreshCertificate {
            features: r.opt(Reader::features)?,
        },
        KIND_SET_SESSION_SELECTOR => ControlMessage::SetSessionSelector {
            selector: r.string()?,
            cookie: r.opt(Reader::string)?,
        },
        KIND_START_TUNNEL => ControlMessage::StartTunnel(r.tunnel_config()?),
        KIND_STOP_TUNNEL => ControlMessage::StopTunnel,
        other => return Err(CodecError::UnknownKind(other)),
    };
    r.finish()?;
    Ok((header.seq, message))
}

/// Decode a complete response envelope
pub fn decode_response(frame: &[u8]) -> Result<(u32, ControlResponse), CodecError> {
    let (header, mut r) = split_envelope(frame)?;
    let response = match header.kind {
        KIND_OK => ControlResponse::Ok,
        KIND_ERROR => ControlResponse::Error(r.string()?),
        KIND_ERROR_SESSION_EXPIRED => ControlResponse::ErrorSessionExpired,
        KIND_ERROR_NEED_KEY_REGENERATION => ControlResponse::ErrorNeedKeyRegeneration,
        KIND_ERROR_TOO_MANY_CERT_REQUESTS => ControlResponse::ErrorTooManyCertRequests {
            retry_after: Duration::from_secs(u64::from(r.u32()?)),
        },
        KIND_CERTIFICATE => {
            let text = r.string()?;
            let valid_until = r.u64()?;
            let refresh_after = r.u64()?;
            let features = r.features()?;
            ControlResponse::Certificate(Certificate::from_unix(
                text,
                valid_until,
                refresh_after,
                features,
            ))
        }
        other => return Err(CodecError::UnknownKind(other)),
    };
    r.finish()?;
    Ok((header.seq, response))
}

fn split_envelope(frame: &[u8]) -> Result<(Header, Reader<'_>), CodecError> {
    let head: &[u8; HEADER_LEN] = frame
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(CodecError::Truncated)?;
    let header = Header::parse(head)?;

    let body = &frame[HEADER_LEN..];
    if body.len() < header.len {
        return Err(CodecError::Truncated);
    }
    if body.len() > header.len {
        return Err(CodecError::TrailingBytes(body.len() - header.len));
    }
    Ok((header, Reader { buf: body, pos: 0 }))
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_str(&mut self, s: &str) {
        // Anything that saturates here is over the payload limit anyway
        self.put_u32(u32::try_from(s.len()).unwrap_or(u32::MAX));
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn put_opt<T>(&mut self, value: Option<&T>, put: impl FnOnce(&mut Self, &T)) {
        match value {
            Some(v) => {
                self.put_u8(1);
                put(self, v);
            }
            None => self.put_u8(0),
        }
    }

    fn put_features(&mut self, features: &VpnFeatures) {
        let mut flags = 0u8;
        if features.vpn_accelerator {
            flags |= FLAG_ACCELERATOR;
        }
        if features.moderate_nat {
            flags |= FLAG_MODERATE_NAT;
        }
        if features.port_forwarding {
            flags |= FLAG_PORT_FORWARDING;
        }
        if let Some(safe_mode) = features.safe_mode {
            flags |= FLAG_SAFE_MODE_SET;
            if safe_mode {
                flags |= FLAG_SAFE_MODE;
            }
        }
        self.put_u8(features.netshield.as_u8());
        self.put_u8(flags);
    }

    fn put_tunnel_config(&mut self, config: &TunnelConfig) {
        self.put_str(&config.target.server_id);
        self.put_str(&config.target.hostname);
        self.put_str(&config.target.endpoint.addr.to_string());
        self.put_u16(config.target.endpoint.port);
        self.put_u8(config.protocol.as_u8());
        self.put_features(&config.features);
        self.put_u8(u8::from(config.kill_switch));
    }

    fn into_envelope(self, kind: u8, seq: u32) -> Result<Vec<u8>, CodecError> {
        let len = self.buf.len();
        if len > MAX_PAYLOAD_LEN {
            return Err(CodecError::TooLarge(len));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + len);
        frame.push(PROTOCOL_VERSION);
        frame.push(kind);
        frame.extend_from_slice(&seq.to_be_bytes());
        // Bounded by MAX_PAYLOAD_LEN above
        frame.extend_from_slice(&(len as u32).to_be_bytes());
        frame.extend_from_slice(&self.buf);
        Ok(frame)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        self.take(N)?.try_into().map_err(|_| CodecError::Truncated)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn opt<T>(
        &mut self,
        read: impl FnOnce(&mut Self) -> Result<T, CodecError>,
    ) -> Result<Option<T>, CodecError> {
        match self.u8()? {
            0 => Ok(None),
            1 => read(self).map(Some),
            _ => Err(CodecError::InvalidField("presence flag")),
        }
    }

    fn features(&mut self) -> Result<VpnFeatures, CodecError> {
        let netshield =
            NetShieldLevel::from_u8(self.u8()?).ok_or(CodecError::InvalidField("netshield"))?;
        let flags = self.u8()?;
        Ok(VpnFeatures {
            netshield,
            vpn_accelerator: flags & FLAG_ACCELERATOR != 0,
            moderate_nat: flags & FLAG_MODERATE_NAT != 0,
            port_forwarding: flags & FLAG_PORT_FORWARDING != 0,
            safe_mode: (flags & FLAG_SAFE_MODE_SET != 0).then_some(flags & FLAG_SAFE_MODE != 0),
        })
    }

    fn tunnel_config(&mut self) -> Result<TunnelConfig, CodecError> {
        let server_id = self.string()?;
        let hostname = self.string()?;
        let addr: IpAddr = self
            .string()?
            .parse()
            .map_err(|_| CodecError::InvalidField("endpoint address"))?;
        let port = self.u16()?;
        let protocol =
            TunnelProtocol::from_u8(self.u8()?).ok_or(CodecError::InvalidField("protocol"))?;
        let features = self.features()?;
        let kill_switch = self.u8()? != 0;

        Ok(TunnelConfig {
            target: ServerTarget::new(server_id, hostname, Endpoint::new(addr, port)),
            protocol,
            features,
            kill_switch,
        })
    }

    fn finish(self) -> Result<(), CodecError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel_config() -> TunnelConfig {
        TunnelConfig::new(
            ServerTarget::new(
                "srv-42",
                "de-12.example.net",
                Endpoint::ipv4(185, 186, 78, 1, 51820),
            ),
            TunnelProtocol::WireGuardTls,
            VpnFeatures {
                netshield: NetShieldLevel::AdsAndTrackers,
                vpn_accelerator: false,
                moderate_nat: true,
                port_forwarding: true,
                safe_mode: Some(false),
            },
        )
        .with_kill_switch(true)
    }

    #[test]
    fn test_start_tunnel_preserves_config() {
        let frame = encode_request(7, &ControlMessage::StartTunnel(tunnel_config())).unwrap();
        let (seq, message) = decode_request(&frame).unwrap();

        assert_eq!(seq, 7);
        assert_eq!(message, ControlMessage::StartTunnel(tunnel_config()));
    }

    #[test]
    fn test_header_layout() {
        let frame = encode_request(0x0102_0304, &ControlMessage::StopTunnel).unwrap();

        assert_eq!(frame, vec![1, KIND_STOP_TUNNEL, 1, 2, 3, 4, 0, 0, 0, 0]);
        let header = Header::parse(frame[..HEADER_LEN].try_into().unwrap()).unwrap();
        assert!(!header.is_response());
    }

    #[test]
    fn test_rate_limit_keeps_exact_duration() {
        let frame = encode_response(
            3,
            &ControlResponse::ErrorTooManyCertRequests {
                retry_after: Duration::from_secs(30),
            },
        )
        .unwrap();
        let (_, response) = decode_response(&frame).unwrap();

        assert_eq!(
            response,
            ControlResponse::ErrorTooManyCertRequests {
                retry_after: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn test_certificate_response() {
        let certificate = Certificate::from_unix(
            "-----BEGIN CERTIFICATE-----",
            2_000,
            1_500,
            VpnFeatures::default(),
        );
        let frame = encode_response(9, &ControlResponse::Certificate(certificate.clone())).unwrap();

        assert_eq!(
            decode_response(&frame).unwrap(),
            (9, ControlResponse::Certificate(certificate))
        );
    }

    #[test]
    fn test_selector_without_cookie() {
        let message = ControlMessage::SetSessionSelector {
            selector: "sel".into(),
            cookie: None,
        };
        let frame = encode_request(1, &message).unwrap();
        assert_eq!(decode_request(&frame).unwrap().1, message);
    }

    #[test]
    fn test_rejects_unknown_version_and_kind() {
        let mut frame = encode_request(1, &ControlMessage::StopTunnel).unwrap();
        frame[0] = 9;
        assert_eq!(decode_request(&frame), Err(CodecError::UnsupportedVersion(9)));

        let mut frame = encode_response(1, &ControlResponse::Ok).unwrap();
        frame[1] = 0xfe;
        assert_eq!(decode_response(&frame), Err(CodecError::UnknownKind(0xfe)));
    }

    #[test]
    fn test_rejects_truncated_and_trailing() {
        let frame = encode_response(1, &ControlResponse::Error("boom".into())).unwrap();
        assert_eq!(decode_response(&frame[..frame.len() - 1]), Err(CodecError::Truncated));
        assert_eq!(decode_response(&frame[..4]), Err(CodecError::Truncated));

        let mut padded = frame.clone();
        padded.push(0);
        assert_eq!(decode_response(&padded), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn test_rejects_oversized_and_bad_utf8() {
        let mut frame = encode_response(1, &ControlResponse::Ok).unwrap();
        frame[6..10].copy_from_slice(&((MAX_PAYLOAD_LEN as u32) + 1).to_be_bytes());
        assert_eq!(
            decode_response(&frame),
            Err(CodecError::TooLarge(MAX_PAYLOAD_LEN + 1))
        );

        let mut frame = encode_response(1, &ControlResponse::Error("ab".into())).unwrap();
        let last = frame.len() - 1;
        frame[last] = 0xff;
        assert_eq!(decode_response(&frame), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_long_error_text_is_cut_on_a_char_boundary() {
        let message = "é".repeat(MAX_ERROR_LEN);
        let frame = encode_response(4, &ControlResponse::Error(message)).unwrap();

        let (_, response) = decode_response(&frame).unwrap();
        let ControlResponse::Error(text) = response else {
            panic!("expected an error response, got {:?}", response);
        };
        assert_eq!(text.len(), MAX_ERROR_LEN);
        assert!(text.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_oversized_request_is_refused_on_encode() {
        let message = ControlMessage::SetSessionSelector {
            selector: "x".repeat(MAX_PAYLOAD_LEN),
            cookie: None,
        };

        assert!(matches!(
            encode_request(1, &message),
            Err(CodecError::TooLarge(len)) if len > MAX_PAYLOAD_LEN
        ));
    }
}
