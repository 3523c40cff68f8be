//! DNS Protocol Implementation
//!
//! # Module Structure
//!
//! * `buffer` - Low-level packet buffer operations
//! * `protocol` - DNS protocol definitions and packet handling
//! * `rdata` - Per-type record data codecs
//! * `multiplexer` - Event loop shared by all outstanding queries
//! * `transport` - Sending to a single nameserver
//! * `resolver` - Retry scheduling across nameservers
//! * `cache` - DNS response caching with TTL support

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// DNS query type and class definitions
pub mod query_type;

/// Record data types and the codec registry
pub mod rdata;

/// EDNS(0) OPT pseudo-record
pub mod edns;

/// Transaction signatures (RFC 8945)
pub mod tsig;

/// Resource record sets
pub mod rrset;

/// Response validation hook
pub mod validator;

/// DNS response caching with TTL support
pub mod cache;

/// Resolver configuration
pub mod config;

/// Errors reported to callers
pub mod errors;

/// Logging setup
pub mod logging;

/// Socket multiplexer event loop
pub mod multiplexer;

/// Single nameserver sender
pub mod transport;

/// Multi nameserver resolver
pub mod resolver;

/// Internal network utilities
mod netutil;
