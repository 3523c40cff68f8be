//! DNS record types and classes, with their numeric conversions

use std::fmt;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};

/// `QueryType` represents the requested Record Type of a query
///
/// The specific type Unknown that an integer parameter in order to retain the
/// id of an unknown query when compiling the reply. An integer can be converted
/// to a querytype using the `from_num` function, and back to an integer using
/// the `to_num` method.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueryType {
    Unknown(u16),
    A,      // 1
    Ns,     // 2
    Cname,  // 5
    Soa,    // 6
    Ptr,    // 12
    Mx,     // 15
    Txt,    // 16
    Aaaa,   // 28
    Srv,    // 33
    Ds,     // 43
    Rrsig,  // 46
    Nsec,   // 47
    Dnskey, // 48
    Nsec3,  // 50
    Opt,    // 41
    Tsig,   // 250
    Ixfr,   // 251
    Axfr,   // 252
    Any,    // 255
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Soa => 6,
            QueryType::Ptr => 12,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
            QueryType::Opt => 41,
            QueryType::Ds => 43,
            QueryType::Rrsig => 46,
            QueryType::Nsec => 47,
            QueryType::Dnskey => 48,
            QueryType::Nsec3 => 50,
            QueryType::Tsig => 250,
            QueryType::Ixfr => 251,
            QueryType::Axfr => 252,
            QueryType::Any => 255,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            6 => QueryType::Soa,
            12 => QueryType::Ptr,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            41 => QueryType::Opt,
            43 => QueryType::Ds,
            46 => QueryType::Rrsig,
            47 => QueryType::Nsec,
            48 => QueryType::Dnskey,
            50 => QueryType::Nsec3,
            250 => QueryType::Tsig,
            251 => QueryType::Ixfr,
            252 => QueryType::Axfr,
            255 => QueryType::Any,
            _ => QueryType::Unknown(num),
        }
    }

    /// Pseudo-records that only ever live in the additional section and
    /// describe the message rather than the zone
    pub fn is_meta(&self) -> bool {
        matches!(self, QueryType::Opt | QueryType::Tsig)
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            QueryType::Unknown(x) => write!(f, "TYPE{}", x),
            QueryType::A => write!(f, "A"),
            QueryType::Ns => write!(f, "NS"),
            QueryType::Cname => write!(f, "CNAME"),
            QueryType::Soa => write!(f, "SOA"),
            QueryType::Ptr => write!(f, "PTR"),
            QueryType::Mx => write!(f, "MX"),
            QueryType::Txt => write!(f, "TXT"),
            QueryType::Aaaa => write!(f, "AAAA"),
            QueryType::Srv => write!(f, "SRV"),
            QueryType::Opt => write!(f, "OPT"),
            QueryType::Ds => write!(f, "DS"),
            QueryType::Rrsig => write!(f, "RRSIG"),
            QueryType::Nsec => write!(f, "NSEC"),
            QueryType::Dnskey => write!(f, "DNSKEY"),
            QueryType::Nsec3 => write!(f, "NSEC3"),
            QueryType::Tsig => write!(f, "TSIG"),
            QueryType::Ixfr => write!(f, "IXFR"),
            QueryType::Axfr => write!(f, "AXFR"),
            QueryType::Any => write!(f, "ANY"),
        }
    }
}

impl FromStr for QueryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let qtype = match upper.as_str() {
            "A" => QueryType::A,
            "NS" => QueryType::Ns,
            "CNAME" => QueryType::Cname,
            "SOA" => QueryType::Soa,
            "PTR" => QueryType::Ptr,
            "MX" => QueryType::Mx,
            "TXT" => QueryType::Txt,
            "AAAA" => QueryType::Aaaa,
            "SRV" => QueryType::Srv,
            "OPT" => QueryType::Opt,
            "DS" => QueryType::Ds,
            "RRSIG" => QueryType::Rrsig,
            "NSEC" => QueryType::Nsec,
            "DNSKEY" => QueryType::Dnskey,
            "NSEC3" => QueryType::Nsec3,
            "TSIG" => QueryType::Tsig,
            "IXFR" => QueryType::Ixfr,
            "AXFR" => QueryType::Axfr,
            "ANY" => QueryType::Any,
            other => match other.strip_prefix("TYPE").map(str::parse::<u16>) {
                Some(Ok(num)) => QueryType::from_num(num),
                _ => return Err(format!("unknown record type `{}`", s)),
            },
        };
        Ok(qtype)
    }
}

/// Record classes. Only IN sees real use, but CH queries still show up for
/// server identification and NONE/ANY are needed by TSIG and updates.
#[derive(
    PartialEq, Eq, Debug, Clone, Hash, Copy, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum DnsClass {
    Unknown(u16),
    #[default]
    In, // 1
    Ch,   // 3
    Hs,   // 4
    None, // 254
    Any,  // 255
}

impl DnsClass {
    pub fn to_num(&self) -> u16 {
        match *self {
            DnsClass::Unknown(x) => x,
            DnsClass::In => 1,
            DnsClass::Ch => 3,
            DnsClass::Hs => 4,
            DnsClass::None => 254,
            DnsClass::Any => 255,
        }
    }

    pub fn from_num(num: u16) -> DnsClass {
        match num {
            1 => DnsClass::In,
            3 => DnsClass::Ch,
            4 => DnsClass::Hs,
            254 => DnsClass::None,
            255 => DnsClass::Any,
            _ => DnsClass::Unknown(num),
        }
    }
}

impl fmt::Display for DnsClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DnsClass::Unknown(x) => write!(f, "CLASS{}", x),
            DnsClass::In => write!(f, "IN"),
            DnsClass::Ch => write!(f, "CH"),
            DnsClass::Hs => write!(f, "HS"),
            DnsClass::None => write!(f, "NONE"),
            DnsClass::Any => write!(f, "ANY"),
        }
    }
}

impl FromStr for DnsClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let class = match upper.as_str() {
            "IN" => DnsClass::In,
            "CH" | "CHAOS" => DnsClass::Ch,
            "HS" => DnsClass::Hs,
            "NONE" => DnsClass::None,
            "ANY" => DnsClass::Any,
            other => match other.strip_prefix("CLASS").map(str::parse::<u16>) {
                Some(Ok(num)) => DnsClass::from_num(num),
                _ => return Err(format!("unknown class `{}`", s)),
            },
        };
        Ok(class)
    }
}
