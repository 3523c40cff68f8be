//! implements the DNS protocol in a transport agnostic fashion

use std::fmt;
use std::net::SocketAddr;

use derive_more::{Display, Error, From};
use rand::random;
use serde_derive::{Deserialize, Serialize};

use crate::dns::buffer::{BufferError, BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use crate::dns::edns::EdnsRecord;
use crate::dns::rdata::{CodecRegistry, RdataError};
use crate::dns::rrset::RRSet;
use crate::dns::tsig::TsigState;
use crate::dns::validator::SecurityLevel;

pub use crate::dns::query_type::{DnsClass, QueryType};
pub use crate::dns::rdata::RData;

/// Reasons a message could not be parsed
#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(BufferError),
    #[display(fmt = "bad {} record data: {}", rtype, source)]
    #[from(ignore)]
    Rdata { rtype: QueryType, source: RdataError },
    #[display(
        fmt = "{} record data is {} bytes but its decoder consumed {}",
        rtype,
        expected,
        consumed
    )]
    #[from(ignore)]
    TrailingRdata {
        rtype: QueryType,
        expected: usize,
        consumed: usize,
    },
    #[display(fmt = "TSIG record is not the last record of the message")]
    TsigNotLast,
}

/// Reasons a message could not be serialized
#[derive(Debug, Display, From, Error)]
pub enum EncodeError {
    Buffer(BufferError),
    #[display(fmt = "no encoder for the record data of a {} {} record", class, rtype)]
    #[from(ignore)]
    NoEncoder { rtype: QueryType, class: DnsClass },
    #[display(fmt = "cannot encode {} record: {}", rtype, source)]
    #[from(ignore)]
    Rdata { rtype: QueryType, source: RdataError },
    #[display(fmt = "{} record data of {} bytes does not fit RDLENGTH", rtype, len)]
    #[from(ignore)]
    RdataTooLong { rtype: QueryType, len: usize },
    #[display(fmt = "{} section holds {} entries", section, count)]
    #[from(ignore)]
    TooManyEntries { section: Section, count: usize },
}

/// A failed decode.
///
/// Carries whatever was parsed before the failure so the caller can still
/// look at the header (id, TC flag) of a damaged response.
#[derive(Debug, Display, Error)]
#[display(fmt = "malformed message in {} section: {}", section, source)]
pub struct DecodeError {
    pub section: Section,
    pub source: ProtocolError,
    pub partial: Box<DnsPacket>,
}

impl DecodeError {
    fn new(section: Section, source: ProtocolError, partial: DnsPacket) -> DecodeError {
        DecodeError {
            section,
            source,
            partial: Box::new(partial),
        }
    }
}

/// Options controlling how names are written
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Replace repeated name suffixes with pointers
    pub compress: bool,
    /// Lower-case every name (canonical form)
    pub lowercase: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions {
            compress: true,
            lowercase: false,
        }
    }
}

impl EncodeOptions {
    pub fn canonical() -> EncodeOptions {
        EncodeOptions {
            compress: false,
            lowercase: true,
        }
    }
}

/// Message sections
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Section {
    #[display(fmt = "header")]
    Header,
    #[display(fmt = "question")]
    Question,
    #[display(fmt = "answer")]
    Answer,
    #[display(fmt = "authority")]
    Authority,
    #[display(fmt = "additional")]
    Additional,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Opcode {
    #[default]
    Query,
    IQuery,
    Status,
    Notify,
    Update,
    Unknown(u8),
}

impl Opcode {
    pub fn to_num(&self) -> u8 {
        match *self {
            Opcode::Query => 0,
            Opcode::IQuery => 1,
            Opcode::Status => 2,
            Opcode::Notify => 4,
            Opcode::Update => 5,
            Opcode::Unknown(x) => x & 0x0F,
        }
    }

    pub fn from_num(num: u8) -> Opcode {
        match num {
            0 => Opcode::Query,
            1 => Opcode::IQuery,
            2 => Opcode::Status,
            4 => Opcode::Notify,
            5 => Opcode::Update,
            _ => Opcode::Unknown(num),
        }
    }
}

/// The result code for a DNS query, as defined by RFC 1035 and RFC 6891
///
/// Values above 15 only exist in combination with EDNS, which carries the
/// upper 8 bits of the 12 bit code.
#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResultCode {
    #[default]
    NOERROR,
    FORMERR,
    SERVFAIL,
    NXDOMAIN,
    NOTIMP,
    REFUSED,
    YXDOMAIN,
    YXRRSET,
    NXRRSET,
    NOTAUTH,
    NOTZONE,
    BADVERS,
    BADKEY,
    BADTIME,
    Unknown(u16),
}

impl ResultCode {
    pub fn to_num(&self) -> u16 {
        match *self {
            ResultCode::NOERROR => 0,
            ResultCode::FORMERR => 1,
            ResultCode::SERVFAIL => 2,
            ResultCode::NXDOMAIN => 3,
            ResultCode::NOTIMP => 4,
            ResultCode::REFUSED => 5,
            ResultCode::YXDOMAIN => 6,
            ResultCode::YXRRSET => 7,
            ResultCode::NXRRSET => 8,
            ResultCode::NOTAUTH => 9,
            ResultCode::NOTZONE => 10,
            ResultCode::BADVERS => 16,
            ResultCode::BADKEY => 17,
            ResultCode::BADTIME => 18,
            ResultCode::Unknown(x) => x & 0x0FFF,
        }
    }

    pub fn from_num(num: u16) -> ResultCode {
        match num {
            0 => ResultCode::NOERROR,
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            6 => ResultCode::YXDOMAIN,
            7 => ResultCode::YXRRSET,
            8 => ResultCode::NXRRSET,
            9 => ResultCode::NOTAUTH,
            10 => ResultCode::NOTZONE,
            16 => ResultCode::BADVERS,
            17 => ResultCode::BADKEY,
            18 => ResultCode::BADTIME,
            _ => ResultCode::Unknown(num),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ResultCode::Unknown(x) => write!(f, "RCODE{}", x),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Representation of a DNS header
///
/// The reserved Z bit is neither stored nor written.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: Opcode,             // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits, 12 with EDNS
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    /// The second 16 bit word of the header
    pub fn flags(&self) -> u16 {
        ((self.response as u16) << 15)
            | ((self.opcode.to_num() as u16) << 11)
            | ((self.authoritative_answer as u16) << 10)
            | ((self.truncated_message as u16) << 9)
            | ((self.recursion_desired as u16) << 8)
            | ((self.recursion_available as u16) << 7)
            | ((self.authed_data as u16) << 5)
            | ((self.checking_disabled as u16) << 4)
            | (self.rescode.to_num() & 0x0F)
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<(), BufferError> {
        buffer.write_u16(self.id)?;
        buffer.write_u16(self.flags())?;
        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn binary_len(&self) -> usize {
        12
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<(), BufferError> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        self.response = (flags & (1 << 15)) > 0;
        self.opcode = Opcode::from_num(((flags >> 11) & 0x0F) as u8);
        self.authoritative_answer = (flags & (1 << 10)) > 0;
        self.truncated_message = (flags & (1 << 9)) > 0;
        self.recursion_desired = (flags & (1 << 8)) > 0;
        self.recursion_available = (flags & (1 << 7)) > 0;
        self.authed_data = (flags & (1 << 5)) > 0;
        self.checking_disabled = (flags & (1 << 4)) > 0;
        self.rescode = ResultCode::from_num(flags & 0x0F);

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            ";; ->>HEADER<<- opcode: {:?}, status: {}, id: {}",
            self.opcode, self.rescode, self.id
        )?;

        let mut flags = Vec::new();
        for (set, name) in [
            (self.response, "qr"),
            (self.authoritative_answer, "aa"),
            (self.truncated_message, "tc"),
            (self.recursion_desired, "rd"),
            (self.recursion_available, "ra"),
            (self.authed_data, "ad"),
            (self.checking_disabled, "cd"),
        ] {
            if set {
                flags.push(name);
            }
        }

        write!(
            f,
            ";; flags: {}; QUERY: {}, ANSWER: {}, AUTHORITY: {}, ADDITIONAL: {}",
            flags.join(" "),
            self.questions,
            self.answers,
            self.authoritative_entries,
            self.resource_entries
        )
    }
}

/// Representation of a DNS question
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
    pub qclass: DnsClass,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion {
            name,
            qtype,
            qclass: DnsClass::In,
        }
    }

    pub fn with_class(name: String, qtype: QueryType, qclass: DnsClass) -> DnsQuestion {
        DnsQuestion {
            name,
            qtype,
            qclass,
        }
    }

    /// Names compare case-insensitively, type and class exactly
    pub fn matches(&self, other: &DnsQuestion) -> bool {
        names_equal(&self.name, &other.name)
            && self.qtype == other.qtype
            && self.qclass == other.qclass
    }

    pub fn write<T: PacketBuffer>(
        &self,
        buffer: &mut T,
        options: EncodeOptions,
    ) -> Result<(), BufferError> {
        buffer.write_qname(&self.name, options.compress, options.lowercase)?;
        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(self.qclass.to_num())?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsQuestion, BufferError> {
        let mut name = String::new();
        buffer.read_qname(&mut name)?;
        let qtype = QueryType::from_num(buffer.read_u16()?);
        let qclass = DnsClass::from_num(buffer.read_u16()?);

        Ok(DnsQuestion {
            name,
            qtype,
            qclass,
        })
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ";{}.\t{}\t{}", self.name, self.qclass, self.qtype)
    }
}

/// Compares two domain names ignoring ASCII case and a trailing dot
pub fn names_equal(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// `DnsRecord` is the primary representation of a DNS record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DnsRecord {
    pub domain: String,
    pub rtype: QueryType,
    pub class: DnsClass,
    pub ttl: u32,
    pub rdata: RData,
}

impl DnsRecord {
    pub fn new(domain: &str, rtype: QueryType, class: DnsClass, ttl: u32, rdata: RData) -> DnsRecord {
        DnsRecord {
            domain: domain.to_string(),
            rtype,
            class,
            ttl,
            rdata,
        }
    }

    pub fn read<T: PacketBuffer>(
        buffer: &mut T,
        registry: &CodecRegistry,
    ) -> Result<DnsRecord, ProtocolError> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let rtype = QueryType::from_num(buffer.read_u16()?);
        let class = DnsClass::from_num(buffer.read_u16()?);
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()? as usize;

        let start = buffer.pos();
        let end = start + data_len;
        buffer.push_limit(end)?;
        let rdata = registry.get(rtype, class).decode(buffer, data_len);
        buffer.pop_limit();

        let rdata = rdata.map_err(|source| ProtocolError::Rdata { rtype, source })?;
        if buffer.pos() != end {
            return Err(ProtocolError::TrailingRdata {
                rtype,
                expected: data_len,
                consumed: buffer.pos() - start,
            });
        }

        Ok(DnsRecord {
            domain,
            rtype,
            class,
            ttl,
            rdata,
        })
    }

    pub fn write<T: PacketBuffer>(
        &self,
        buffer: &mut T,
        options: EncodeOptions,
        registry: &CodecRegistry,
    ) -> Result<usize, EncodeError> {
        let start_pos = buffer.pos();

        // TSIG owner names are never compressed
        let compress = options.compress && self.rtype != QueryType::Tsig;
        buffer.write_qname(&self.domain, compress, options.lowercase)?;
        buffer.write_u16(self.rtype.to_num())?;
        buffer.write_u16(self.class.to_num())?;
        buffer.write_u32(self.ttl)?;

        let len_pos = buffer.pos();
        buffer.write_u16(0)?;

        registry
            .get(self.rtype, self.class)
            .encode(&self.rdata, buffer, options)
            .map_err(|e| match e {
                RdataError::Buffer(e) => EncodeError::Buffer(e),
                RdataError::Mismatch => EncodeError::NoEncoder {
                    rtype: self.rtype,
                    class: self.class,
                },
                source => EncodeError::Rdata {
                    rtype: self.rtype,
                    source,
                },
            })?;

        let size = buffer.pos() - (len_pos + 2);
        if size > u16::MAX as usize {
            return Err(EncodeError::RdataTooLong {
                rtype: self.rtype,
                len: size,
            });
        }
        buffer.set_u16(len_pos, size as u16)?;

        Ok(buffer.pos() - start_pos)
    }
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.\t{}\t{}\t{}\t{}",
            self.domain, self.ttl, self.class, self.rtype, self.rdata
        )
    }
}

/// How a response should be treated by whoever sent the query
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseClass {
    /// NOERROR, possibly with an empty answer
    Success,
    /// NXDOMAIN: the name does not exist, asking elsewhere will not help
    NegativeAnswer,
    /// Any other rcode; another nameserver may do better
    Failure(ResultCode),
}

/// Representation of a complete DNS packet
///
/// A DNS packet can be read and written in a single operation. Besides the
/// wire content it carries metadata filled in by the transport and the
/// resolver; that metadata is never encoded and is ignored by equality.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,

    /// Nameserver the response came from
    pub answer_from: Option<SocketAddr>,
    /// Size of the response on the wire
    pub answer_size: usize,
    pub tsig_state: TsigState,
    pub security_level: SecurityLevel,
    /// Set when the response was served from the cache
    pub cached: bool,

    #[serde(skip)]
    pub(crate) tsig_offset: Option<usize>,
}

impl PartialEq for DnsPacket {
    fn eq(&self, other: &DnsPacket) -> bool {
        self.header.id == other.header.id
            && self.header.flags() == other.header.flags()
            && self.header.rescode == other.header.rescode
            && self.questions == other.questions
            && self.answers == other.answers
            && self.authorities == other.authorities
            && self.resources == other.resources
    }
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    /// A recursive query for a single question with a random id
    pub fn query(name: &str, qtype: QueryType, qclass: DnsClass) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = random::<u16>();
        packet.header.recursion_desired = true;
        packet
            .questions
            .push(DnsQuestion::with_class(name.to_string(), qtype, qclass));
        packet
    }

    /// An empty response echoing this packet's id and question
    pub fn reply(&self) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = self.header.id;
        packet.header.opcode = self.header.opcode;
        packet.header.response = true;
        packet.header.recursion_desired = self.header.recursion_desired;
        packet.questions = self.questions.clone();
        packet
    }

    pub fn decode(bytes: &[u8]) -> Result<DnsPacket, DecodeError> {
        DnsPacket::decode_with(bytes, CodecRegistry::standard())
    }

    pub fn decode_with(bytes: &[u8], registry: &CodecRegistry) -> Result<DnsPacket, DecodeError> {
        let mut buffer = BytePacketBuffer::new(bytes);
        let mut packet = DnsPacket::from_buffer(&mut buffer, registry)?;
        packet.answer_size = bytes.len();

        if buffer.pos() < bytes.len() {
            log::debug!(
                "ignoring {} bytes after the end of message {}",
                bytes.len() - buffer.pos(),
                packet.header.id
            );
        }

        Ok(packet)
    }

    pub fn from_buffer<T: PacketBuffer>(
        buffer: &mut T,
        registry: &CodecRegistry,
    ) -> Result<DnsPacket, DecodeError> {
        let mut result = DnsPacket::new();
        if let Err(e) = result.header.read(buffer) {
            return Err(DecodeError::new(Section::Header, e.into(), result));
        }

        for _ in 0..result.header.questions {
            match DnsQuestion::read(buffer) {
                Ok(question) => result.questions.push(question),
                Err(e) => return Err(DecodeError::new(Section::Question, e.into(), result)),
            }
        }

        let sections = [
            (Section::Answer, result.header.answers),
            (Section::Authority, result.header.authoritative_entries),
            (Section::Additional, result.header.resource_entries),
        ];
        for (section, count) in sections {
            for _ in 0..count {
                let start = buffer.pos();
                let rec = match DnsRecord::read(buffer, registry) {
                    Ok(rec) => rec,
                    Err(e) => return Err(DecodeError::new(section, e, result)),
                };

                if rec.rtype == QueryType::Tsig {
                    if section != Section::Additional || result.tsig_offset.is_some() {
                        return Err(DecodeError::new(section, ProtocolError::TsigNotLast, result));
                    }
                    result.tsig_offset = Some(start);
                } else if result.tsig_offset.is_some() {
                    return Err(DecodeError::new(section, ProtocolError::TsigNotLast, result));
                }

                result.section_mut(section).push(rec);
            }
        }

        if let Some(edns) = result.edns() {
            if edns.extended_rcode != 0 {
                let low = result.header.rescode.to_num() & 0x0F;
                result.header.rescode =
                    ResultCode::from_num(((edns.extended_rcode as u16) << 4) | low);
            }
        }

        Ok(result)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.encode_with(EncodeOptions::default())
    }

    pub fn encode_with(&self, options: EncodeOptions) -> Result<Vec<u8>, EncodeError> {
        let mut buffer = VectorPacketBuffer::new();
        self.write(&mut buffer, options, CodecRegistry::standard())?;
        Ok(buffer.into_inner())
    }

    pub fn write<T: PacketBuffer>(
        &self,
        buffer: &mut T,
        options: EncodeOptions,
        registry: &CodecRegistry,
    ) -> Result<(), EncodeError> {
        let mut header = self.header.clone();
        header.questions = count(Section::Question, self.questions.len())?;
        header.answers = count(Section::Answer, self.answers.len())?;
        header.authoritative_entries = count(Section::Authority, self.authorities.len())?;
        header.resource_entries = count(Section::Additional, self.resources.len())?;

        header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer, options)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
        {
            rec.write(buffer, options, registry)?;
        }

        Ok(())
    }

    pub fn section(&self, section: Section) -> &[DnsRecord] {
        match section {
            Section::Answer => &self.answers,
            Section::Authority => &self.authorities,
            Section::Additional => &self.resources,
            Section::Header | Section::Question => &[],
        }
    }

    fn section_mut(&mut self, section: Section) -> &mut Vec<DnsRecord> {
        match section {
            Section::Answer => &mut self.answers,
            Section::Authority => &mut self.authorities,
            _ => &mut self.resources,
        }
    }

    /// Groups a section into RRSets
    pub fn rrsets(&self, section: Section) -> Vec<RRSet> {
        RRSet::group(self.section(section))
    }

    pub fn edns(&self) -> Option<EdnsRecord> {
        self.resources
            .iter()
            .find(|rec| rec.rtype == QueryType::Opt)
            .and_then(EdnsRecord::from_opt_record)
    }

    /// Replaces the OPT record. It is kept ahead of any TSIG record,
    /// which has to stay last.
    pub fn set_edns(&mut self, edns: Option<EdnsRecord>) {
        self.resources.retain(|rec| rec.rtype != QueryType::Opt);
        if let Some(mut edns) = edns {
            edns.extended_rcode = (self.header.rescode.to_num() >> 4) as u8;
            let pos = self
                .resources
                .iter()
                .position(|rec| rec.rtype == QueryType::Tsig)
                .unwrap_or(self.resources.len());
            self.resources.insert(pos, edns.to_opt_record());
        }
    }

    pub fn rcode(&self) -> ResultCode {
        self.header.rescode
    }

    /// Sets the full 12 bit rcode, spreading it over header and OPT record
    pub fn set_rcode(&mut self, rcode: ResultCode) {
        self.header.rescode = rcode;
        if let Some(edns) = self.edns() {
            self.set_edns(Some(edns));
        }
    }

    pub fn tsig(&self) -> Option<&DnsRecord> {
        self.resources
            .last()
            .filter(|rec| rec.rtype == QueryType::Tsig)
    }

    /// Does this response answer a query with the given id and question?
    ///
    /// A response without a question section is accepted for error rcodes,
    /// since servers refusing to parse a query often leave it out.
    pub fn matches_query(&self, id: u16, question: Option<&DnsQuestion>) -> bool {
        if !self.header.response || self.header.id != id {
            return false;
        }

        match (question, self.questions.first()) {
            (None, _) => true,
            (Some(expected), Some(actual)) => expected.matches(actual),
            (Some(_), None) => self.header.rescode != ResultCode::NOERROR,
        }
    }

    pub fn classify(&self) -> ResponseClass {
        match self.header.rescode {
            ResultCode::NOERROR => ResponseClass::Success,
            ResultCode::NXDOMAIN => ResponseClass::NegativeAnswer,
            rcode => ResponseClass::Failure(rcode),
        }
    }

    pub fn get_ttl_from_soa(&self) -> Option<u32> {
        self.authorities.iter().find_map(|rec| match rec.rdata {
            RData::Soa { minimum, .. } => Some(minimum.min(rec.ttl)),
            _ => None,
        })
    }
}

fn count(section: Section, len: usize) -> Result<u16, EncodeError> {
    if len > u16::MAX as usize {
        return Err(EncodeError::TooManyEntries {
            section,
            count: len,
        });
    }
    Ok(len as u16)
}

impl fmt::Display for DnsPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut header = self.header.clone();
        header.questions = self.questions.len() as u16;
        header.answers = self.answers.len() as u16;
        header.authoritative_entries = self.authorities.len() as u16;
        header.resource_entries = self.resources.len() as u16;
        writeln!(f, "{}", header)?;

        if let Some(edns) = self.edns() {
            writeln!(f, "\n;; OPT PSEUDOSECTION:")?;
            writeln!(
                f,
                "; EDNS: version: {}, flags:{}; udp: {}",
                edns.version,
                if edns.dnssec_ok { " do" } else { "" },
                edns.udp_size
            )?;
        }

        writeln!(f, "\n;; QUESTION SECTION:")?;
        for question in &self.questions {
            writeln!(f, "{}", question)?;
        }

        for (title, records) in [
            ("ANSWER", &self.answers),
            ("AUTHORITY", &self.authorities),
            ("ADDITIONAL", &self.resources),
        ] {
            let shown: Vec<&DnsRecord> = records
                .iter()
                .filter(|rec| rec.rtype != QueryType::Opt)
                .collect();
            if shown.is_empty() {
                continue;
            }
            writeln!(f, "\n;; {} SECTION:", title)?;
            for rec in shown {
                writeln!(f, "{}", rec)?;
            }
        }

        if let Some(server) = self.answer_from {
            writeln!(f, "\n;; SERVER: {}", server)?;
        }
        write!(f, ";; MSG SIZE  rcvd: {}", self.answer_size)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::tsig::TsigRdata;

    fn ns(domain: &str, host: &str) -> DnsRecord {
        DnsRecord::new(
            domain,
            QueryType::Ns,
            DnsClass::In,
            3600,
            RData::Ns(host.to_string()),
        )
    }

    #[test]
    fn test_packet() {
        let mut packet = DnsPacket::new();
        packet.header.id = 1337;
        packet.header.response = true;

        packet
            .questions
            .push(DnsQuestion::new("google.com".to_string(), QueryType::Ns));
        packet.answers.push(ns("google.com", "ns1.google.com"));
        packet.answers.push(ns("google.com", "ns2.google.com"));
        packet.answers.push(ns("google.com", "ns3.google.com"));
        packet.answers.push(ns("google.com", "ns4.google.com"));

        let bytes = packet.encode().unwrap();
        let parsed_packet = DnsPacket::decode(&bytes).unwrap();

        assert_eq!(packet, parsed_packet);
        assert_eq!(4, parsed_packet.header.answers);
        assert_eq!(bytes.len(), parsed_packet.answer_size);
    }

    #[test]
    fn test_compression_shrinks_output() {
        let mut packet = DnsPacket::query("google.com", QueryType::Ns, DnsClass::In);
        packet.answers.push(ns("google.com", "ns1.google.com"));
        packet.answers.push(ns("google.com", "ns2.google.com"));

        let compressed = packet.encode().unwrap();
        let plain = packet
            .encode_with(EncodeOptions {
                compress: false,
                lowercase: false,
            })
            .unwrap();

        assert!(compressed.len() < plain.len());
        assert_eq!(
            DnsPacket::decode(&compressed).unwrap(),
            DnsPacket::decode(&plain).unwrap()
        );
    }

    #[test]
    fn test_header_flags() {
        let mut header = DnsHeader::new();
        header.response = true;
        header.opcode = Opcode::Notify;
        header.authoritative_answer = true;
        header.recursion_desired = true;
        header.checking_disabled = true;
        header.rescode = ResultCode::REFUSED;

        assert_eq!(0x8000 | 0x2000 | 0x0400 | 0x0100 | 0x0010 | 0x0005, header.flags());
    }

    #[test]
    fn test_reserved_bit_is_dropped() {
        let data = [
            0x12, 0x34, 0x01, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let packet = DnsPacket::decode(&data).unwrap();
        assert_eq!(0x0100, packet.header.flags());
        assert!(packet.header.recursion_desired);
    }

    #[test]
    fn test_extended_rcode() {
        let mut packet = DnsPacket::new();
        packet.header.response = true;
        packet.set_edns(Some(EdnsRecord::new(1232)));
        packet.set_rcode(ResultCode::BADVERS);

        let bytes = packet.encode().unwrap();
        // the header only carries the low four bits
        assert_eq!(0, bytes[3] & 0x0F);

        let parsed = DnsPacket::decode(&bytes).unwrap();
        assert_eq!(ResultCode::BADVERS, parsed.rcode());
        assert_eq!(1, parsed.edns().unwrap().extended_rcode);
    }

    #[test]
    fn test_truncated_packet_keeps_header() {
        let mut packet = DnsPacket::query("example.com", QueryType::A, DnsClass::In);
        packet.header.id = 4242;
        packet.header.response = true;
        packet.header.truncated_message = true;
        packet.answers.push(DnsRecord::new(
            "example.com",
            QueryType::A,
            DnsClass::In,
            60,
            RData::A("10.0.0.1".parse().unwrap()),
        ));

        let bytes = packet.encode().unwrap();
        let err = DnsPacket::decode(&bytes[..bytes.len() - 2]).unwrap_err();

        assert_eq!(Section::Answer, err.section);
        assert_eq!(4242, err.partial.header.id);
        assert!(err.partial.header.truncated_message);
        assert_eq!(1, err.partial.questions.len());
    }

    #[test]
    fn test_rdata_trailing_bytes_rejected() {
        let mut packet = DnsPacket::new();
        packet.answers.push(DnsRecord::new(
            "example.com",
            QueryType::Ns,
            DnsClass::In,
            60,
            RData::Ns("ns.example.com".to_string()),
        ));
        let mut bytes = packet.encode().unwrap();

        // header, owner name, type/class/ttl; then claim one more byte of
        // rdata than the compressed name uses
        let len_pos = 12 + 13 + 8;
        assert_eq!(5, bytes[len_pos + 1]);
        bytes[len_pos + 1] += 1;
        bytes.push(0);

        let err = DnsPacket::decode(&bytes).unwrap_err();
        assert!(matches!(err.source, ProtocolError::TrailingRdata { .. }));
    }

    #[test]
    fn test_no_encoder_for_mismatched_rdata() {
        let mut packet = DnsPacket::new();
        packet.answers.push(DnsRecord::new(
            "example.com",
            QueryType::Mx,
            DnsClass::In,
            60,
            RData::A("10.0.0.1".parse().unwrap()),
        ));

        assert!(matches!(
            packet.encode(),
            Err(EncodeError::NoEncoder {
                rtype: QueryType::Mx,
                ..
            })
        ));
    }

    #[test]
    fn test_tsig_must_be_last() {
        let tsig = DnsRecord::new(
            "key",
            QueryType::Tsig,
            DnsClass::Any,
            0,
            RData::Tsig(TsigRdata {
                algorithm: "hmac-sha256".to_string(),
                time_signed: 0,
                fudge: 300,
                mac: vec![0; 32],
                original_id: 0,
                error: 0,
                other: Vec::new(),
            }),
        );

        let mut packet = DnsPacket::new();
        packet.resources.push(tsig);
        packet.set_edns(Some(EdnsRecord::default()));
        assert_eq!(QueryType::Opt, packet.resources[0].rtype);

        let bytes = packet.encode().unwrap();
        let parsed = DnsPacket::decode(&bytes).unwrap();
        assert!(parsed.tsig().is_some());
        assert!(parsed.tsig_offset.is_some());

        let mut misplaced = packet.clone();
        misplaced.resources.reverse();
        let bytes = misplaced.encode().unwrap();
        let err = DnsPacket::decode(&bytes).unwrap_err();
        assert!(matches!(err.source, ProtocolError::TsigNotLast));
    }

    #[test]
    fn test_matches_query() {
        let query = DnsPacket::query("Example.COM", QueryType::A, DnsClass::In);
        let mut response = query.reply();
        response.questions[0].name = "example.com".to_string();

        assert!(response.matches_query(query.header.id, query.questions.first()));
        assert!(!response.matches_query(query.header.id.wrapping_add(1), query.questions.first()));

        let other = DnsQuestion::new("example.org".to_string(), QueryType::A);
        assert!(!response.matches_query(query.header.id, Some(&other)));

        assert!(!query.matches_query(query.header.id, query.questions.first()));

        response.questions.clear();
        assert!(!response.matches_query(query.header.id, query.questions.first()));
        response.header.rescode = ResultCode::FORMERR;
        assert!(response.matches_query(query.header.id, query.questions.first()));
    }

    #[test]
    fn test_classify() {
        let mut packet = DnsPacket::new();
        assert_eq!(ResponseClass::Success, packet.classify());
        packet.header.rescode = ResultCode::NXDOMAIN;
        assert_eq!(ResponseClass::NegativeAnswer, packet.classify());
        packet.header.rescode = ResultCode::SERVFAIL;
        assert_eq!(
            ResponseClass::Failure(ResultCode::SERVFAIL),
            packet.classify()
        );
    }

    #[test]
    fn test_display() {
        let mut packet = DnsPacket::query("example.com", QueryType::A, DnsClass::In);
        packet.header.id = 7;
        packet.answers.push(DnsRecord::new(
            "example.com",
            QueryType::A,
            DnsClass::In,
            300,
            RData::A("93.184.216.34".parse().unwrap()),
        ));

        let text = packet.to_string();
        assert!(text.contains("status: NOERROR, id: 7"));
        assert!(text.contains(";example.com.\tIN\tA"));
        assert!(text.contains("example.com.\t300\tIN\tA\t93.184.216.34"));
    }
}
