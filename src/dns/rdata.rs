//! record data and the codecs that read and write it
//!
//! Every (type, class) pair maps to an `RdataCodec`. Types without a codec
//! are carried as opaque bytes, so a message containing records this crate
//! knows nothing about still decodes and re-encodes unchanged.

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, OnceLock};

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

use crate::dns::buffer::{BufferError, PacketBuffer};
use crate::dns::edns::EdnsOption;
use crate::dns::protocol::EncodeOptions;
use crate::dns::query_type::{DnsClass, QueryType};
use crate::dns::tsig::TsigRdata;

#[derive(Debug, Display, From, Error)]
pub enum RdataError {
    Buffer(BufferError),
    #[display(fmt = "record data variant does not match the codec")]
    Mismatch,
    #[display(fmt = "{}", reason)]
    #[from(ignore)]
    Malformed { reason: String },
}

type Result<T> = std::result::Result<T, RdataError>;

/// Decoded record data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(String),
    Cname(String),
    Ptr(String),
    Mx {
        preference: u16,
        exchange: String,
    },
    Txt(Vec<String>),
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Opt(Vec<EdnsOption>),
    Tsig(TsigRdata),
    Unknown(Vec<u8>),
}

impl fmt::Display for RData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RData::A(addr) => write!(f, "{}", addr),
            RData::Aaaa(addr) => write!(f, "{}", addr),
            RData::Ns(host) | RData::Cname(host) | RData::Ptr(host) => write!(f, "{}.", host),
            RData::Mx {
                preference,
                exchange,
            } => write!(f, "{} {}.", preference, exchange),
            RData::Txt(strings) => {
                let quoted: Vec<String> = strings.iter().map(|s| format!("{:?}", s)).collect();
                write!(f, "{}", quoted.join(" "))
            }
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => write!(
                f,
                "{}. {}. {} {} {} {} {}",
                mname, rname, serial, refresh, retry, expire, minimum
            ),
            RData::Srv {
                priority,
                weight,
                port,
                target,
            } => write!(f, "{} {} {} {}.", priority, weight, port, target),
            RData::Opt(options) => write!(f, "; {} option(s)", options.len()),
            RData::Tsig(tsig) => write!(
                f,
                "{}. {} {} {}",
                tsig.algorithm,
                tsig.time_signed,
                tsig.fudge,
                tsig.mac.len()
            ),
            RData::Unknown(data) => {
                write!(f, "\\# {}", data.len())?;
                if !data.is_empty() {
                    write!(f, " ")?;
                    for b in data {
                        write!(f, "{:02x}", b)?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Reads and writes the RDATA of one record type.
///
/// `decode` runs with the buffer limited to the record's RDLENGTH, so a
/// codec cannot read into the following record. Names are read through
/// `read_qname`, which may still follow pointers to earlier offsets.
pub trait RdataCodec: Send + Sync {
    fn decode(&self, buffer: &mut dyn PacketBuffer, len: usize) -> Result<RData>;

    fn encode(
        &self,
        rdata: &RData,
        buffer: &mut dyn PacketBuffer,
        options: EncodeOptions,
    ) -> Result<()>;
}

fn read_name(buffer: &mut dyn PacketBuffer) -> Result<String> {
    let mut name = String::new();
    buffer.read_qname(&mut name)?;
    Ok(name)
}

pub struct Ipv4Codec;

impl RdataCodec for Ipv4Codec {
    fn decode(&self, buffer: &mut dyn PacketBuffer, len: usize) -> Result<RData> {
        if len != 4 {
            return Err(RdataError::Malformed {
                reason: format!("A record with {} bytes of data", len),
            });
        }
        let raw_addr = buffer.read_u32()?;
        Ok(RData::A(Ipv4Addr::from(raw_addr)))
    }

    fn encode(&self, rdata: &RData, buffer: &mut dyn PacketBuffer, _: EncodeOptions) -> Result<()> {
        match rdata {
            RData::A(addr) => {
                buffer.write_bytes(&addr.octets())?;
                Ok(())
            }
            _ => Err(RdataError::Mismatch),
        }
    }
}

pub struct Ipv6Codec;

impl RdataCodec for Ipv6Codec {
    fn decode(&self, buffer: &mut dyn PacketBuffer, len: usize) -> Result<RData> {
        if len != 16 {
            return Err(RdataError::Malformed {
                reason: format!("AAAA record with {} bytes of data", len),
            });
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&buffer.read_bytes(16)?);
        Ok(RData::Aaaa(Ipv6Addr::from(octets)))
    }

    fn encode(&self, rdata: &RData, buffer: &mut dyn PacketBuffer, _: EncodeOptions) -> Result<()> {
        match rdata {
            RData::Aaaa(addr) => {
                buffer.write_bytes(&addr.octets())?;
                Ok(())
            }
            _ => Err(RdataError::Mismatch),
        }
    }
}

/// NS, CNAME and PTR: a single, compressible host name
pub struct HostCodec {
    rtype: QueryType,
}

impl HostCodec {
    pub fn new(rtype: QueryType) -> HostCodec {
        HostCodec { rtype }
    }
}

impl RdataCodec for HostCodec {
    fn decode(&self, buffer: &mut dyn PacketBuffer, _: usize) -> Result<RData> {
        let host = read_name(buffer)?;
        match self.rtype {
            QueryType::Ns => Ok(RData::Ns(host)),
            QueryType::Cname => Ok(RData::Cname(host)),
            QueryType::Ptr => Ok(RData::Ptr(host)),
            _ => Err(RdataError::Mismatch),
        }
    }

    fn encode(
        &self,
        rdata: &RData,
        buffer: &mut dyn PacketBuffer,
        options: EncodeOptions,
    ) -> Result<()> {
        let host = match (self.rtype, rdata) {
            (QueryType::Ns, RData::Ns(host))
            | (QueryType::Cname, RData::Cname(host))
            | (QueryType::Ptr, RData::Ptr(host)) => host,
            _ => return Err(RdataError::Mismatch),
        };
        buffer.write_qname(host, options.compress, options.lowercase)?;
        Ok(())
    }
}

pub struct MxCodec;

impl RdataCodec for MxCodec {
    fn decode(&self, buffer: &mut dyn PacketBuffer, _: usize) -> Result<RData> {
        let preference = buffer.read_u16()?;
        let exchange = read_name(buffer)?;
        Ok(RData::Mx {
            preference,
            exchange,
        })
    }

    fn encode(
        &self,
        rdata: &RData,
        buffer: &mut dyn PacketBuffer,
        options: EncodeOptions,
    ) -> Result<()> {
        match rdata {
            RData::Mx {
                preference,
                exchange,
            } => {
                buffer.write_u16(*preference)?;
                buffer.write_qname(exchange, options.compress, options.lowercase)?;
                Ok(())
            }
            _ => Err(RdataError::Mismatch),
        }
    }
}

pub struct TxtCodec;

impl RdataCodec for TxtCodec {
    fn decode(&self, buffer: &mut dyn PacketBuffer, _: usize) -> Result<RData> {
        let mut strings = Vec::new();
        while buffer.remaining() > 0 {
            let len = buffer.read()? as usize;
            let bytes = buffer.read_bytes(len)?;
            strings.push(String::from_utf8_lossy(&bytes).into_owned());
        }
        Ok(RData::Txt(strings))
    }

    fn encode(&self, rdata: &RData, buffer: &mut dyn PacketBuffer, _: EncodeOptions) -> Result<()> {
        let strings = match rdata {
            RData::Txt(strings) => strings,
            _ => return Err(RdataError::Mismatch),
        };
        for s in strings {
            if s.len() > 255 {
                return Err(RdataError::Malformed {
                    reason: format!("character string of {} bytes", s.len()),
                });
            }
            buffer.write_u8(s.len() as u8)?;
            buffer.write_bytes(s.as_bytes())?;
        }
        Ok(())
    }
}

pub struct SoaCodec;

impl RdataCodec for SoaCodec {
    fn decode(&self, buffer: &mut dyn PacketBuffer, _: usize) -> Result<RData> {
        let mname = read_name(buffer)?;
        let rname = read_name(buffer)?;
        Ok(RData::Soa {
            mname,
            rname,
            serial: buffer.read_u32()?,
            refresh: buffer.read_u32()?,
            retry: buffer.read_u32()?,
            expire: buffer.read_u32()?,
            minimum: buffer.read_u32()?,
        })
    }

    fn encode(
        &self,
        rdata: &RData,
        buffer: &mut dyn PacketBuffer,
        options: EncodeOptions,
    ) -> Result<()> {
        match rdata {
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                buffer.write_qname(mname, options.compress, options.lowercase)?;
                buffer.write_qname(rname, options.compress, options.lowercase)?;
                buffer.write_u32(*serial)?;
                buffer.write_u32(*refresh)?;
                buffer.write_u32(*retry)?;
                buffer.write_u32(*expire)?;
                buffer.write_u32(*minimum)?;
                Ok(())
            }
            _ => Err(RdataError::Mismatch),
        }
    }
}

/// SRV targets are never compressed (RFC 2782)
pub struct SrvCodec;

impl RdataCodec for SrvCodec {
    fn decode(&self, buffer: &mut dyn PacketBuffer, _: usize) -> Result<RData> {
        let priority = buffer.read_u16()?;
        let weight = buffer.read_u16()?;
        let port = buffer.read_u16()?;
        let target = read_name(buffer)?;
        Ok(RData::Srv {
            priority,
            weight,
            port,
            target,
        })
    }

    fn encode(
        &self,
        rdata: &RData,
        buffer: &mut dyn PacketBuffer,
        options: EncodeOptions,
    ) -> Result<()> {
        match rdata {
            RData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(*priority)?;
                buffer.write_u16(*weight)?;
                buffer.write_u16(*port)?;
                buffer.write_qname(target, false, options.lowercase)?;
                Ok(())
            }
            _ => Err(RdataError::Mismatch),
        }
    }
}

pub struct OptCodec;

impl RdataCodec for OptCodec {
    fn decode(&self, buffer: &mut dyn PacketBuffer, _: usize) -> Result<RData> {
        let mut options = Vec::new();
        while buffer.remaining() > 0 {
            if buffer.remaining() < 4 {
                return Err(RdataError::Malformed {
                    reason: format!("{} stray bytes after the last option", buffer.remaining()),
                });
            }
            let code = buffer.read_u16()?;
            let len = buffer.read_u16()? as usize;
            let data = buffer.read_bytes(len)?;
            options.push(EdnsOption { code, data });
        }
        Ok(RData::Opt(options))
    }

    fn encode(&self, rdata: &RData, buffer: &mut dyn PacketBuffer, _: EncodeOptions) -> Result<()> {
        let options = match rdata {
            RData::Opt(options) => options,
            _ => return Err(RdataError::Mismatch),
        };
        for option in options {
            if option.data.len() > u16::MAX as usize {
                return Err(RdataError::Malformed {
                    reason: format!("option {} is {} bytes long", option.code, option.data.len()),
                });
            }
            buffer.write_u16(option.code)?;
            buffer.write_u16(option.data.len() as u16)?;
            buffer.write_bytes(&option.data)?;
        }
        Ok(())
    }
}

/// TSIG record data (RFC 8945 section 4.2). The algorithm name is always
/// written uncompressed and in lower case.
pub struct TsigCodec;

impl RdataCodec for TsigCodec {
    fn decode(&self, buffer: &mut dyn PacketBuffer, _: usize) -> Result<RData> {
        let algorithm = read_name(buffer)?;
        let time_signed = buffer.read_u48()?;
        let fudge = buffer.read_u16()?;
        let mac_len = buffer.read_u16()? as usize;
        let mac = buffer.read_bytes(mac_len)?;
        let original_id = buffer.read_u16()?;
        let error = buffer.read_u16()?;
        let other_len = buffer.read_u16()? as usize;
        let other = buffer.read_bytes(other_len)?;

        Ok(RData::Tsig(TsigRdata {
            algorithm,
            time_signed,
            fudge,
            mac,
            original_id,
            error,
            other,
        }))
    }

    fn encode(&self, rdata: &RData, buffer: &mut dyn PacketBuffer, _: EncodeOptions) -> Result<()> {
        let tsig = match rdata {
            RData::Tsig(tsig) => tsig,
            _ => return Err(RdataError::Mismatch),
        };
        buffer.write_qname(&tsig.algorithm, false, true)?;
        buffer.write_u48(tsig.time_signed)?;
        buffer.write_u16(tsig.fudge)?;
        buffer.write_u16(tsig.mac.len() as u16)?;
        buffer.write_bytes(&tsig.mac)?;
        buffer.write_u16(tsig.original_id)?;
        buffer.write_u16(tsig.error)?;
        buffer.write_u16(tsig.other.len() as u16)?;
        buffer.write_bytes(&tsig.other)?;
        Ok(())
    }
}

/// Fallback for every type without a dedicated codec
pub struct OpaqueCodec;

impl RdataCodec for OpaqueCodec {
    fn decode(&self, buffer: &mut dyn PacketBuffer, len: usize) -> Result<RData> {
        Ok(RData::Unknown(buffer.read_bytes(len)?))
    }

    fn encode(&self, rdata: &RData, buffer: &mut dyn PacketBuffer, _: EncodeOptions) -> Result<()> {
        match rdata {
            RData::Unknown(data) => {
                buffer.write_bytes(data)?;
                Ok(())
            }
            _ => Err(RdataError::Mismatch),
        }
    }
}

/// Lookup table from (type, class) to codec.
///
/// A codec registered without a class serves every class of that type; a
/// class-specific registration takes precedence over it.
pub struct CodecRegistry {
    codecs: HashMap<(QueryType, Option<DnsClass>), Arc<dyn RdataCodec>>,
    fallback: Arc<dyn RdataCodec>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        CodecRegistry::with_standard_codecs()
    }
}

impl CodecRegistry {
    /// A registry that treats every record as opaque
    pub fn empty() -> CodecRegistry {
        CodecRegistry {
            codecs: HashMap::new(),
            fallback: Arc::new(OpaqueCodec),
        }
    }

    pub fn with_standard_codecs() -> CodecRegistry {
        let mut registry = CodecRegistry::empty();

        // address records are only defined for the internet class
        registry.register(QueryType::A, Some(DnsClass::In), Arc::new(Ipv4Codec));
        registry.register(QueryType::Aaaa, Some(DnsClass::In), Arc::new(Ipv6Codec));

        for rtype in [QueryType::Ns, QueryType::Cname, QueryType::Ptr] {
            registry.register(rtype, None, Arc::new(HostCodec::new(rtype)));
        }
        registry.register(QueryType::Mx, None, Arc::new(MxCodec));
        registry.register(QueryType::Txt, None, Arc::new(TxtCodec));
        registry.register(QueryType::Soa, None, Arc::new(SoaCodec));
        registry.register(QueryType::Srv, None, Arc::new(SrvCodec));
        registry.register(QueryType::Opt, None, Arc::new(OptCodec));
        registry.register(QueryType::Tsig, None, Arc::new(TsigCodec));

        registry
    }

    /// Shared registry with the built-in codecs, used by `DnsPacket::encode`
    /// and `DnsPacket::decode`
    pub fn standard() -> &'static CodecRegistry {
        static STANDARD: OnceLock<CodecRegistry> = OnceLock::new();
        STANDARD.get_or_init(CodecRegistry::with_standard_codecs)
    }

    pub fn register(
        &mut self,
        rtype: QueryType,
        class: Option<DnsClass>,
        codec: Arc<dyn RdataCodec>,
    ) {
        self.codecs.insert((rtype, class), codec);
    }

    pub fn get(&self, rtype: QueryType, class: DnsClass) -> &dyn RdataCodec {
        let codec = self
            .codecs
            .get(&(rtype, Some(class)))
            .or_else(|| self.codecs.get(&(rtype, None)))
            .unwrap_or(&self.fallback);
        &**codec
    }
}
