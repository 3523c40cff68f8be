//! Transaction signatures (TSIG, RFC 8945)
//!
//! A signed message carries a TSIG record as the very last record of the
//! additional section. Its MAC covers the message as it looked before the
//! record was appended, followed by the TSIG variables in canonical form.
//! Responses also fold in the MAC of the request they answer.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use derive_more::{Display, Error, From};
use hmac::{Hmac, Mac};
use serde_derive::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::protocol::{
    names_equal, DnsPacket, DnsRecord, EncodeError, EncodeOptions, RData, ResultCode,
};
use crate::dns::query_type::{DnsClass, QueryType};
use crate::dns::rdata::CodecRegistry;

/// Default permitted clock skew, in seconds
pub const DEFAULT_FUDGE: u16 = 300;

#[derive(Debug, Display, From, Error)]
pub enum TsigError {
    Encode(EncodeError),
    #[display(fmt = "TSIG secret is not valid base64: {}", _0)]
    Base64(base64::DecodeError),
    #[display(fmt = "unknown TSIG algorithm `{}`", name)]
    #[from(ignore)]
    UnknownAlgorithm { name: String },
    #[display(fmt = "TSIG key cannot be used with {}", algorithm)]
    #[from(ignore)]
    InvalidKey { algorithm: TsigAlgorithm },
    #[display(fmt = "response to a signed query is not signed")]
    Unsigned,
    #[display(
        fmt = "response signed with key {} ({}), expected {} ({})",
        name,
        algorithm,
        expected_name,
        expected_algorithm
    )]
    #[from(ignore)]
    WrongKey {
        name: String,
        algorithm: String,
        expected_name: String,
        expected_algorithm: TsigAlgorithm,
    },
    #[display(fmt = "TSIG MAC does not verify")]
    BadSig,
    #[display(
        fmt = "TSIG time {} is more than {}s away from local time {}",
        time_signed,
        fudge,
        now
    )]
    #[from(ignore)]
    BadTime { time_signed: u64, fudge: u16, now: u64 },
    #[display(fmt = "server rejected the signature: {}", rcode)]
    #[from(ignore)]
    ServerError { rcode: ResultCode },
    #[display(fmt = "TSIG record is malformed")]
    Malformed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TsigAlgorithm {
    HmacSha1,
    HmacSha256,
}

impl TsigAlgorithm {
    pub fn name(&self) -> &'static str {
        match *self {
            TsigAlgorithm::HmacSha1 => "hmac-sha1",
            TsigAlgorithm::HmacSha256 => "hmac-sha256",
        }
    }

    pub fn from_name(name: &str) -> Option<TsigAlgorithm> {
        if names_equal(name, "hmac-sha1") {
            Some(TsigAlgorithm::HmacSha1)
        } else if names_equal(name, "hmac-sha256") {
            Some(TsigAlgorithm::HmacSha256)
        } else {
            None
        }
    }

    fn sign(&self, secret: &[u8], data: &[u8]) -> Result<Vec<u8>, TsigError> {
        let invalid = |_| TsigError::InvalidKey { algorithm: *self };
        let mac = match *self {
            TsigAlgorithm::HmacSha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(secret).map_err(invalid)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            TsigAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(invalid)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(mac)
    }

    fn verify(&self, secret: &[u8], data: &[u8], tag: &[u8]) -> Result<bool, TsigError> {
        let invalid = |_| TsigError::InvalidKey { algorithm: *self };
        let verified = match *self {
            TsigAlgorithm::HmacSha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(secret).map_err(invalid)?;
                mac.update(data);
                mac.verify_slice(tag).is_ok()
            }
            TsigAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(invalid)?;
                mac.update(data);
                mac.verify_slice(tag).is_ok()
            }
        };
        Ok(verified)
    }
}

impl fmt::Display for TsigAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for TsigAlgorithm {
    type Err = TsigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TsigAlgorithm::from_name(s).ok_or_else(|| TsigError::UnknownAlgorithm {
            name: s.to_string(),
        })
    }
}

/// A shared secret known to both ends
#[derive(Clone)]
pub struct TsigKey {
    pub name: String,
    pub algorithm: TsigAlgorithm,
    pub fudge: u16,
    secret: Vec<u8>,
}

impl fmt::Debug for TsigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsigKey")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .field("fudge", &self.fudge)
            .finish_non_exhaustive()
    }
}

impl TsigKey {
    pub fn new(name: &str, algorithm: TsigAlgorithm, secret: Vec<u8>) -> TsigKey {
        TsigKey {
            name: name.trim_end_matches('.').to_ascii_lowercase(),
            algorithm,
            fudge: DEFAULT_FUDGE,
            secret,
        }
    }

    /// Builds a key from the base64 secret found in BIND style key files
    pub fn from_base64(
        name: &str,
        algorithm: TsigAlgorithm,
        secret: &str,
    ) -> Result<TsigKey, TsigError> {
        let secret = base64::decode(secret.trim())?;
        Ok(TsigKey::new(name, algorithm, secret))
    }

    pub fn with_fudge(mut self, fudge: u16) -> TsigKey {
        self.fudge = fudge;
        self
    }
}

/// TSIG record data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TsigRdata {
    pub algorithm: String,
    /// Seconds since the epoch, 48 bits on the wire
    pub time_signed: u64,
    pub fudge: u16,
    pub mac: Vec<u8>,
    pub original_id: u16,
    pub error: u16,
    pub other: Vec<u8>,
}

/// Signature status of a message
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TsigState {
    #[default]
    Unsigned,
    Signed,
    Verified,
    Failed,
}

/// Outcome of signing: the signed packet, its wire form and the MAC, which
/// the caller keeps to verify the response
#[derive(Debug, Clone)]
pub struct SignedMessage {
    pub packet: DnsPacket,
    pub bytes: Vec<u8>,
    pub mac: Vec<u8>,
}

fn now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

pub fn sign(
    packet: &DnsPacket,
    key: &TsigKey,
    request_mac: Option<&[u8]>,
) -> Result<SignedMessage, TsigError> {
    sign_at(packet, key, request_mac, now())
}

pub fn sign_at(
    packet: &DnsPacket,
    key: &TsigKey,
    request_mac: Option<&[u8]>,
    time_signed: u64,
) -> Result<SignedMessage, TsigError> {
    let mut signed = packet.clone();
    signed.resources.retain(|rec| rec.rtype != QueryType::Tsig);

    let unsigned = signed.encode()?;

    let mut tsig = TsigRdata {
        algorithm: key.algorithm.name().to_string(),
        time_signed,
        fudge: key.fudge,
        mac: Vec::new(),
        original_id: signed.header.id,
        error: 0,
        other: Vec::new(),
    };
    let data = signing_data(request_mac, &unsigned, &key.name, &tsig)?;
    tsig.mac = key.algorithm.sign(&key.secret, &data)?;
    let mac = tsig.mac.clone();

    let record = DnsRecord::new(&key.name, QueryType::Tsig, DnsClass::Any, 0, RData::Tsig(tsig));

    // append the record to the bytes that were signed and bump ARCOUNT,
    // so the signed prefix is exactly what goes on the wire
    let offset = unsigned.len();
    let mut buffer = VectorPacketBuffer::from_bytes(unsigned);
    buffer.seek(offset).map_err(EncodeError::from)?;
    record.write(&mut buffer, EncodeOptions::default(), CodecRegistry::standard())?;
    let arcount = signed.resources.len() as u16 + 1;
    buffer.set_u16(10, arcount).map_err(EncodeError::from)?;

    signed.resources.push(record);
    signed.tsig_state = TsigState::Signed;
    signed.tsig_offset = Some(offset);

    Ok(SignedMessage {
        packet: signed,
        bytes: buffer.into_inner(),
        mac,
    })
}

/// Verifies the TSIG record of a decoded packet against the bytes it was
/// decoded from. On success returns the packet's MAC, which a multi-message
/// exchange would feed into the next verification.
pub fn verify(
    bytes: &[u8],
    packet: &mut DnsPacket,
    key: &TsigKey,
    request_mac: Option<&[u8]>,
) -> Result<Vec<u8>, TsigError> {
    verify_at(bytes, packet, key, request_mac, now())
}

pub fn verify_at(
    bytes: &[u8],
    packet: &mut DnsPacket,
    key: &TsigKey,
    request_mac: Option<&[u8]>,
    now: u64,
) -> Result<Vec<u8>, TsigError> {
    let result = check(bytes, packet, key, request_mac, now);
    packet.tsig_state = match result {
        Ok(_) => TsigState::Verified,
        Err(_) => TsigState::Failed,
    };
    result
}

fn check(
    bytes: &[u8],
    packet: &DnsPacket,
    key: &TsigKey,
    request_mac: Option<&[u8]>,
    now: u64,
) -> Result<Vec<u8>, TsigError> {
    let (offset, record) = match (packet.tsig_offset, packet.tsig()) {
        (Some(offset), Some(record)) => (offset, record),
        _ => return Err(TsigError::Unsigned),
    };
    let tsig = match &record.rdata {
        RData::Tsig(tsig) => tsig,
        _ => return Err(TsigError::Malformed),
    };

    if !names_equal(&record.domain, &key.name)
        || TsigAlgorithm::from_name(&tsig.algorithm) != Some(key.algorithm)
    {
        return Err(TsigError::WrongKey {
            name: record.domain.clone(),
            algorithm: tsig.algorithm.clone(),
            expected_name: key.name.clone(),
            expected_algorithm: key.algorithm,
        });
    }

    if tsig.error != 0 {
        return Err(TsigError::ServerError {
            rcode: ResultCode::from_num(tsig.error),
        });
    }

    if offset < 12 || offset > bytes.len() {
        return Err(TsigError::Malformed);
    }

    // rebuild the message as the signer saw it: original id, one record less
    let mut original = bytes[..offset].to_vec();
    original[0..2].copy_from_slice(&tsig.original_id.to_be_bytes());
    let arcount = u16::from_be_bytes([original[10], original[11]]);
    let arcount = arcount.checked_sub(1).ok_or(TsigError::Malformed)?;
    original[10..12].copy_from_slice(&arcount.to_be_bytes());

    let data = signing_data(request_mac, &original, &record.domain, tsig)?;
    if !key.algorithm.verify(&key.secret, &data, &tsig.mac)? {
        return Err(TsigError::BadSig);
    }

    if now.abs_diff(tsig.time_signed) > tsig.fudge as u64 {
        return Err(TsigError::BadTime {
            time_signed: tsig.time_signed,
            fudge: tsig.fudge,
            now,
        });
    }

    Ok(tsig.mac.clone())
}

/// The digest input: request MAC (responses only), the unsigned message,
/// then the TSIG variables with names in canonical form
fn signing_data(
    request_mac: Option<&[u8]>,
    message: &[u8],
    key_name: &str,
    tsig: &TsigRdata,
) -> Result<Vec<u8>, TsigError> {
    let mut buffer = VectorPacketBuffer::new();
    let mut write = || -> Result<(), crate::dns::buffer::BufferError> {
        if let Some(mac) = request_mac {
            buffer.write_u16(mac.len() as u16)?;
            buffer.write_bytes(mac)?;
        }
        buffer.write_bytes(message)?;

        buffer.write_qname(key_name, false, true)?;
        buffer.write_u16(DnsClass::Any.to_num())?;
        buffer.write_u32(0)?;
        buffer.write_qname(&tsig.algorithm, false, true)?;
        buffer.write_u48(tsig.time_signed)?;
        buffer.write_u16(tsig.fudge)?;
        buffer.write_u16(tsig.error)?;
        buffer.write_u16(tsig.other.len() as u16)?;
        buffer.write_bytes(&tsig.other)
    };
    write().map_err(EncodeError::from)?;

    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TsigKey {
        TsigKey::from_base64(
            "transfer-key",
            TsigAlgorithm::HmacSha256,
            "c2VjcmV0LXNlY3JldC1zZWNyZXQtc2VjcmV0IQ==",
        )
        .unwrap()
    }

    fn query() -> DnsPacket {
        DnsPacket::query("example.com", QueryType::Soa, DnsClass::In)
    }

    #[test]
    fn test_sign_and_verify_request() {
        let key = key();
        let signed = sign(&query(), &key, None).unwrap();
        assert_eq!(TsigState::Signed, signed.packet.tsig_state);
        assert_eq!(32, signed.mac.len());

        let mut decoded = DnsPacket::decode(&signed.bytes).unwrap();
        assert_eq!(signed.packet, decoded);

        let mac = verify(&signed.bytes, &mut decoded, &key, None).unwrap();
        assert_eq!(signed.mac, mac);
        assert_eq!(TsigState::Verified, decoded.tsig_state);
    }

    #[test]
    fn test_response_covers_request_mac() {
        let key = key();
        let request = sign(&query(), &key, None).unwrap();

        let response = request.packet.reply();
        let signed = sign(&response, &key, Some(request.mac.as_slice())).unwrap();

        let mut decoded = DnsPacket::decode(&signed.bytes).unwrap();
        assert!(verify(&signed.bytes, &mut decoded, &key, Some(request.mac.as_slice())).is_ok());

        let mut decoded = DnsPacket::decode(&signed.bytes).unwrap();
        assert!(matches!(
            verify(&signed.bytes, &mut decoded, &key, Some(&[0u8; 32][..])),
            Err(TsigError::BadSig)
        ));
        assert_eq!(TsigState::Failed, decoded.tsig_state);
    }

    #[test]
    fn test_tampering_is_detected() {
        let key = key();
        let signed = sign(&query(), &key, None).unwrap();

        let mut bytes = signed.bytes.clone();
        // flip the RD bit
        bytes[2] ^= 0x01;
        let mut decoded = DnsPacket::decode(&bytes).unwrap();

        assert!(matches!(
            verify(&bytes, &mut decoded, &key, None),
            Err(TsigError::BadSig)
        ));
    }

    #[test]
    fn test_id_rewrite_is_tolerated() {
        let key = key();
        let signed = sign(&query(), &key, None).unwrap();

        // a forwarder may change the id; the original is in the record
        let mut bytes = signed.bytes.clone();
        bytes[0] ^= 0xFF;
        let mut decoded = DnsPacket::decode(&bytes).unwrap();

        assert!(verify(&bytes, &mut decoded, &key, None).is_ok());
    }

    #[test]
    fn test_unsigned_response() {
        let packet = query().reply();
        let bytes = packet.encode().unwrap();
        let mut decoded = DnsPacket::decode(&bytes).unwrap();

        assert!(matches!(
            verify(&bytes, &mut decoded, &key(), None),
            Err(TsigError::Unsigned)
        ));
    }

    #[test]
    fn test_wrong_key_name() {
        let signed = sign(&query(), &key(), None).unwrap();
        let other = TsigKey::new("other-key", TsigAlgorithm::HmacSha256, vec![1, 2, 3]);

        let mut decoded = DnsPacket::decode(&signed.bytes).unwrap();
        assert!(matches!(
            verify(&signed.bytes, &mut decoded, &other, None),
            Err(TsigError::WrongKey { .. })
        ));
    }

    #[test]
    fn test_clock_skew() {
        let key = key().with_fudge(10);
        let signed = sign_at(&query(), &key, None, 1_000_000).unwrap();

        let mut decoded = DnsPacket::decode(&signed.bytes).unwrap();
        assert!(verify_at(&signed.bytes, &mut decoded, &key, None, 1_000_010).is_ok());
        assert!(matches!(
            verify_at(&signed.bytes, &mut decoded, &key, None, 1_000_011),
            Err(TsigError::BadTime { .. })
        ));
    }

    #[test]
    fn test_sha1_and_algorithm_names() {
        let key = TsigKey::new("Key.Example.", TsigAlgorithm::HmacSha1, b"secret".to_vec());
        assert_eq!("key.example", key.name);

        let signed = sign(&query(), &key, None).unwrap();
        assert_eq!(20, signed.mac.len());

        assert_eq!(Some(TsigAlgorithm::HmacSha256), TsigAlgorithm::from_name("HMAC-SHA256."));
        assert!("hmac-md5".parse::<TsigAlgorithm>().is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let text = format!("{:?}", key());
        assert!(text.contains("transfer-key"));
        assert!(!text.contains("secret"));
    }
}
