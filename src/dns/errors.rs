//! Errors delivered to callers of the transport and the resolver

use std::io;
use std::time::Duration;

use derive_more::{Display, Error};

use crate::dns::multiplexer::QueryId;
use crate::dns::netutil::is_resource_exhaustion;
use crate::dns::protocol::{DecodeError, DnsPacket, EncodeError, ResponseClass, ResultCode};
use crate::dns::tsig::TsigError;

/// Outcome of a failed query.
///
/// Error rcodes carry the response that produced them, so callers can
/// still inspect its authority section (e.g. the SOA of an NXDOMAIN).
#[derive(Debug, Display, Error)]
pub enum ResolveError {
    #[display(fmt = "name does not exist (NXDOMAIN)")]
    NxDomain { response: Box<DnsPacket> },
    #[display(fmt = "server responded with {}", rcode)]
    ErrorRcode {
        rcode: ResultCode,
        response: Box<DnsPacket>,
    },
    #[display(fmt = "no response within {:?}", timeout)]
    PacketTimeout { timeout: Duration },
    #[display(fmt = "query timed out after {:?}", timeout)]
    QueryTimeout { timeout: Duration },
    Io(io::Error),
    #[display(fmt = "out of local resources: {}", _0)]
    ResourceExhausted(io::Error),
    Decode(DecodeError),
    Encode(EncodeError),
    Tsig(TsigError),
    #[display(fmt = "response truncated over UDP")]
    Truncated { response: Box<DnsPacket> },
    #[display(
        fmt = "message of {} bytes exceeds the {} byte UDP limit and TCP is disabled",
        size,
        limit
    )]
    MessageTooLarge { size: usize, limit: usize },
    #[display(fmt = "no nameservers configured")]
    NoNameservers,
    #[display(fmt = "query id {} is already in flight", id)]
    DuplicateQueryId { id: QueryId },
    #[display(fmt = "resolver is shutting down")]
    Shutdown,
}

/// Coarse classification of `ResolveError`, convenient for matching and
/// for reporting
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NxDomain,
    ServFail,
    Refused,
    NotImp,
    FormErr,
    OtherRcode,
    PacketTimeout,
    QueryTimeout,
    Io,
    ResourceExhausted,
    Decode,
    Encode,
    Tsig,
    Truncated,
    MessageTooLarge,
    NoNameservers,
    DuplicateQueryId,
    Shutdown,
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::NxDomain { .. } => ErrorKind::NxDomain,
            ResolveError::ErrorRcode { rcode, .. } => match rcode {
                ResultCode::SERVFAIL => ErrorKind::ServFail,
                ResultCode::REFUSED => ErrorKind::Refused,
                ResultCode::NOTIMP => ErrorKind::NotImp,
                ResultCode::FORMERR => ErrorKind::FormErr,
                _ => ErrorKind::OtherRcode,
            },
            ResolveError::PacketTimeout { .. } => ErrorKind::PacketTimeout,
            ResolveError::QueryTimeout { .. } => ErrorKind::QueryTimeout,
            ResolveError::Io(_) => ErrorKind::Io,
            ResolveError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            ResolveError::Decode(_) => ErrorKind::Decode,
            ResolveError::Encode(_) => ErrorKind::Encode,
            ResolveError::Tsig(_) => ErrorKind::Tsig,
            ResolveError::Truncated { .. } => ErrorKind::Truncated,
            ResolveError::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            ResolveError::NoNameservers => ErrorKind::NoNameservers,
            ResolveError::DuplicateQueryId { .. } => ErrorKind::DuplicateQueryId,
            ResolveError::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Turns an error rcode into an error, passing NOERROR responses through
    pub fn check_response(response: DnsPacket) -> Result<DnsPacket, ResolveError> {
        match response.classify() {
            ResponseClass::Success => Ok(response),
            ResponseClass::NegativeAnswer => Err(ResolveError::NxDomain {
                response: Box::new(response),
            }),
            ResponseClass::Failure(rcode) => Err(ResolveError::ErrorRcode {
                rcode,
                response: Box::new(response),
            }),
        }
    }

    pub fn is_resource_exhaustion(&self) -> bool {
        self.kind() == ErrorKind::ResourceExhausted
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PacketTimeout | ErrorKind::QueryTimeout
        )
    }

    /// The response behind the error, if the error came from one
    pub fn response(&self) -> Option<&DnsPacket> {
        match self {
            ResolveError::NxDomain { response }
            | ResolveError::ErrorRcode { response, .. }
            | ResolveError::Truncated { response } => Some(&**response),
            ResolveError::Decode(e) => Some(&*e.partial),
            _ => None,
        }
    }

    /// How much an error says about the query. When every nameserver has
    /// failed, the caller gets the most telling error seen: a server's
    /// answer beats a garbled packet, which beats a local I/O failure,
    /// which beats silence.
    pub fn severity(&self) -> u8 {
        match self.kind() {
            ErrorKind::NxDomain
            | ErrorKind::ServFail
            | ErrorKind::Refused
            | ErrorKind::NotImp
            | ErrorKind::FormErr
            | ErrorKind::OtherRcode
            | ErrorKind::Tsig => 4,
            ErrorKind::Decode | ErrorKind::Truncated => 3,
            ErrorKind::Io | ErrorKind::ResourceExhausted | ErrorKind::Encode => 2,
            ErrorKind::PacketTimeout | ErrorKind::QueryTimeout => 1,
            _ => 0,
        }
    }
}

impl From<io::Error> for ResolveError {
    fn from(err: io::Error) -> Self {
        if is_resource_exhaustion(&err) {
            ResolveError::ResourceExhausted(err)
        } else {
            ResolveError::Io(err)
        }
    }
}

impl From<DecodeError> for ResolveError {
    fn from(err: DecodeError) -> Self {
        ResolveError::Decode(err)
    }
}

impl From<EncodeError> for ResolveError {
    fn from(err: EncodeError) -> Self {
        ResolveError::Encode(err)
    }
}

impl From<TsigError> for ResolveError {
    fn from(err: TsigError) -> Self {
        match err {
            TsigError::Encode(e) => ResolveError::Encode(e),
            other => ResolveError::Tsig(other),
        }
    }
}
