//! dnsmux
//!
//! A DNS stub resolver engine: many concurrent queries share a single
//! socket multiplexing thread, and each query is sent to a list of
//! nameservers following a fan-out and backoff timeline.
//!
//! # Features
//!
//! * DNS wire format with name compression, EDNS and TSIG
//! * UDP and TCP transports with automatic TCP fallback on truncation
//! * One event loop thread for all outstanding queries
//! * Retry scheduling across nameservers with partial-failure handling
//! * Optional response cache and pluggable DNSSEC validation
//!
//! # Example
//!
//! ```rust,no_run
//! use dnsmux::dns::config::ResolverConfig;
//! use dnsmux::dns::protocol::{DnsClass, QueryType};
//! use dnsmux::dns::resolver::Resolver;
//!
//! let config = ResolverConfig::with_nameservers(vec!["192.0.2.53".parse().unwrap()]);
//! let resolver = Resolver::new(config).unwrap();
//! let response = resolver.query("example.com", QueryType::A, DnsClass::In).unwrap();
//! println!("{}", response);
//! ```

/// DNS protocol handling and resolution engine
pub mod dns;
