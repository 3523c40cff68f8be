//! EDNS0 Extensions Implementation - RFC 6891
//!
//! The OPT pseudo-record rides in the additional section and reuses the
//! ordinary record fields for its own purposes:
//!
//! * **CLASS** - the largest UDP payload the sender can reassemble
//! * **TTL** - extended rcode (8 bits), version (8 bits), flags (16 bits)
//! * **RDATA** - a list of `{code, length, data}` options

use serde_derive::{Deserialize, Serialize};

use crate::dns::protocol::{DnsRecord, RData};
use crate::dns::query_type::{DnsClass, QueryType};

/// Payload size every DNS implementation must accept without EDNS
pub const LEGACY_UDP_SIZE: u16 = 512;

/// DNSSEC OK flag in the 16 flag bits of the OPT ttl
pub const DNSSEC_OK: u16 = 0x8000;

/// A single EDNS option, kept opaque
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdnsOption {
    pub code: u16,
    pub data: Vec<u8>,
}

/// EDNS0 record (OPT pseudo-record)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdnsRecord {
    /// Extended UDP payload size
    pub udp_size: u16,
    /// Extended RCODE (upper 8 bits)
    pub extended_rcode: u8,
    /// EDNS version
    pub version: u8,
    /// DNSSEC OK flag
    pub dnssec_ok: bool,
    /// Z field (reserved flags)
    pub z: u16,
    /// EDNS options
    pub options: Vec<EdnsOption>,
}

impl Default for EdnsRecord {
    fn default() -> Self {
        Self {
            udp_size: 1232,
            extended_rcode: 0,
            version: 0,
            dnssec_ok: false,
            z: 0,
            options: Vec::new(),
        }
    }
}

impl EdnsRecord {
    /// Create a new EDNS record
    pub fn new(udp_size: u16) -> Self {
        Self {
            udp_size,
            ..Default::default()
        }
    }

    pub fn add_option(&mut self, code: u16, data: Vec<u8>) {
        self.options.push(EdnsOption { code, data });
    }

    pub fn option(&self, code: u16) -> Option<&EdnsOption> {
        self.options.iter().find(|o| o.code == code)
    }

    /// Convert to DNS OPT record
    pub fn to_opt_record(&self) -> DnsRecord {
        DnsRecord {
            domain: String::new(),
            rtype: QueryType::Opt,
            class: DnsClass::from_num(self.udp_size),
            ttl: self.build_flags(),
            rdata: RData::Opt(self.options.clone()),
        }
    }

    /// Packs extended rcode, version and flags into the OPT ttl
    fn build_flags(&self) -> u32 {
        let mut flags = 0u32;

        flags |= (self.extended_rcode as u32) << 24;
        flags |= (self.version as u32) << 16;
        if self.dnssec_ok {
            flags |= DNSSEC_OK as u32;
        }
        flags |= (self.z & !DNSSEC_OK) as u32;

        flags
    }

    /// Parse from OPT record
    pub fn from_opt_record(record: &DnsRecord) -> Option<Self> {
        if record.rtype != QueryType::Opt {
            return None;
        }

        let options = match &record.rdata {
            RData::Opt(options) => options.clone(),
            _ => Vec::new(),
        };

        let flags = record.ttl;
        Some(Self {
            udp_size: record.class.to_num(),
            extended_rcode: ((flags >> 24) & 0xFF) as u8,
            version: ((flags >> 16) & 0xFF) as u8,
            dnssec_ok: (flags & DNSSEC_OK as u32) != 0,
            z: (flags & 0x7FFF) as u16,
            options,
        })
    }
}
