//! DNS Response Cache
//!
//! A thread-safe, TTL-aware store the resolver consults before sending a
//! query and feeds with every answer it gets.
//!
//! # Cache Structure
//!
//! The cache is organized by:
//! 1. Domain name (case-insensitive)
//! 2. Query type and class
//! 3. One RRSet or one negative entry, stamped with the time it was stored
//!
//! An RRSet lives as long as its lowest ttl. NXDOMAIN answers are kept for
//! the SOA minimum found in their authority section.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use dnsmux::dns::cache::SynchronizedCache;
//! # use dnsmux::dns::protocol::{DnsPacket, DnsQuestion, QueryType};
//! let cache = SynchronizedCache::new();
//! # let response = DnsPacket::new();
//!
//! // Store an answer
//! cache.store(&response).unwrap();
//!
//! // Lookup records
//! let question = DnsQuestion::new("example.com".to_string(), QueryType::A);
//! if let Some(packet) = cache.lookup(&question) {
//!     assert!(packet.cached);
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::*;
use derive_more::{Display, Error};
use serde_derive::{Deserialize, Serialize};

use crate::dns::protocol::{
    DnsPacket, DnsQuestion, QueryType, ResponseClass, ResultCode, Section,
};
use crate::dns::query_type::DnsClass;
use crate::dns::rrset::RRSet;

#[derive(Debug, Display, Error)]
pub enum CacheError {
    PoisonedLock,
}

type Result<T> = std::result::Result<T, CacheError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheState {
    PositiveCache,
    NegativeCache,
    NotCached,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CacheEntry {
    NoRecords {
        ttl: u32,
        timestamp: DateTime<Utc>,
    },
    Records {
        rrset: RRSet,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEntry {
    fn ttl(&self) -> u32 {
        match self {
            CacheEntry::NoRecords { ttl, .. } => *ttl,
            CacheEntry::Records { rrset, .. } => rrset.ttl,
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CacheEntry::NoRecords { timestamp, .. } | CacheEntry::Records { timestamp, .. } => {
                *timestamp
            }
        }
    }

    /// Seconds left before the entry expires, `None` once it has
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<u32> {
        let expires = self.timestamp() + Duration::seconds(self.ttl() as i64);
        if expires <= now {
            return None;
        }
        Some((expires - now).num_seconds().max(0) as u32)
    }
}

#[derive(Clone, Debug)]
pub struct DomainEntry {
    pub domain: String,
    pub record_types: HashMap<(QueryType, DnsClass), CacheEntry>,
    pub hits: u32,
    pub updates: u32,
}

impl DomainEntry {
    pub fn new(domain: String) -> DomainEntry {
        DomainEntry {
            domain,
            record_types: HashMap::new(),
            hits: 0,
            updates: 0,
        }
    }

    pub fn store_nxdomain(&mut self, qtype: QueryType, qclass: DnsClass, ttl: u32) {
        self.updates += 1;

        let entry = CacheEntry::NoRecords {
            ttl,
            timestamp: Utc::now(),
        };
        self.record_types.insert((qtype, qclass), entry);
    }

    /// Replaces whatever was known for the set's type and class
    pub fn store_rrset(&mut self, rrset: RRSet) {
        self.updates += 1;

        let key = (rrset.rtype, rrset.class);
        let entry = CacheEntry::Records {
            rrset,
            timestamp: Utc::now(),
        };
        self.record_types.insert(key, entry);
    }

    pub fn get_cache_state(&self, qtype: QueryType, qclass: DnsClass) -> CacheState {
        let now = Utc::now();
        match self.record_types.get(&(qtype, qclass)) {
            Some(entry) if entry.remaining(now).is_none() => CacheState::NotCached,
            Some(CacheEntry::Records { rrset, .. }) if rrset.is_empty() => CacheState::NotCached,
            Some(CacheEntry::Records { .. }) => CacheState::PositiveCache,
            Some(CacheEntry::NoRecords { .. }) => CacheState::NegativeCache,
            None => CacheState::NotCached,
        }
    }

    /// Builds an answer from a live entry, with ttls counting down from
    /// the moment the records were stored
    fn fill_queryresult(&self, qtype: QueryType, qclass: DnsClass, packet: &mut DnsPacket) {
        let now = Utc::now();
        let entry = match self.record_types.get(&(qtype, qclass)) {
            Some(entry) => entry,
            None => return,
        };
        let remaining = match entry.remaining(now) {
            Some(remaining) => remaining,
            None => return,
        };

        match entry {
            CacheEntry::Records { rrset, .. } => {
                for rec in rrset.records.iter().chain(rrset.sigs.iter()) {
                    let mut rec = rec.clone();
                    rec.ttl = remaining;
                    packet.answers.push(rec);
                }
            }
            CacheEntry::NoRecords { .. } => {
                packet.header.rescode = ResultCode::NXDOMAIN;
            }
        }
    }
}

#[derive(Default)]
pub struct Cache {
    domain_entries: BTreeMap<String, DomainEntry>,
    hits: u64,
    misses: u64,
}

fn cache_key(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

impl Cache {
    pub fn new() -> Cache {
        Cache::default()
    }

    fn get_cache_state(&self, qname: &str, qtype: QueryType, qclass: DnsClass) -> CacheState {
        match self.domain_entries.get(qname) {
            Some(x) => x.get_cache_state(qtype, qclass),
            None => CacheState::NotCached,
        }
    }

    pub fn lookup(&mut self, question: &DnsQuestion) -> Option<DnsPacket> {
        let qname = cache_key(&question.name);

        match self.get_cache_state(&qname, question.qtype, question.qclass) {
            CacheState::PositiveCache | CacheState::NegativeCache => {
                self.hits += 1;

                let mut qr = DnsPacket::new();
                qr.header.response = true;
                qr.header.recursion_desired = true;
                qr.header.recursion_available = true;
                qr.questions.push(question.clone());
                qr.cached = true;

                if let Some(domain_entry) = self.domain_entries.get_mut(&qname) {
                    domain_entry.hits += 1;
                    domain_entry.fill_queryresult(question.qtype, question.qclass, &mut qr);
                }

                Some(qr)
            }
            CacheState::NotCached => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn store_rrset(&mut self, rrset: RRSet) {
        let domain = cache_key(&rrset.domain);
        self.domain_entries
            .entry(domain.clone())
            .or_insert_with(|| DomainEntry::new(domain))
            .store_rrset(rrset);
    }

    pub fn store_nxdomain(&mut self, qname: &str, qtype: QueryType, qclass: DnsClass, ttl: u32) {
        let domain = cache_key(qname);
        self.domain_entries
            .entry(domain.clone())
            .or_insert_with(|| DomainEntry::new(domain))
            .store_nxdomain(qtype, qclass, ttl);
    }

    /// Stores the answer section of a successful response, or a negative
    /// entry for an NXDOMAIN carrying an SOA
    pub fn store(&mut self, response: &DnsPacket) {
        if response.cached || response.header.truncated_message {
            return;
        }

        match response.classify() {
            ResponseClass::Success => {
                for rrset in response.rrsets(Section::Answer) {
                    self.store_rrset(rrset);
                }
            }
            ResponseClass::NegativeAnswer => {
                if let (Some(question), Some(ttl)) =
                    (response.questions.first(), response.get_ttl_from_soa())
                {
                    self.store_nxdomain(&question.name, question.qtype, question.qclass, ttl);
                }
            }
            ResponseClass::Failure(_) => {}
        }
    }

    /// Drops every expired entry
    pub fn purge(&mut self) {
        let now = Utc::now();
        for domain_entry in self.domain_entries.values_mut() {
            domain_entry
                .record_types
                .retain(|_, entry| entry.remaining(now).is_some());
        }
        self.domain_entries
            .retain(|_, domain_entry| !domain_entry.record_types.is_empty());
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub hit_rate: f64,
    pub total_hits: u64,
    pub total_misses: u64,
}

#[derive(Default)]
pub struct SynchronizedCache {
    pub cache: RwLock<Cache>,
}

impl SynchronizedCache {
    pub fn new() -> SynchronizedCache {
        SynchronizedCache {
            cache: RwLock::new(Cache::new()),
        }
    }

    pub fn get_stats(&self) -> Result<CacheStats> {
        let cache = self.cache.read().map_err(|_| CacheError::PoisonedLock)?;

        let total = cache.hits + cache.misses;
        let hit_rate = if total > 0 {
            (cache.hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        Ok(CacheStats {
            total_entries: cache.domain_entries.len(),
            hit_rate,
            total_hits: cache.hits,
            total_misses: cache.misses,
        })
    }

    pub fn list(&self) -> Result<Vec<DomainEntry>> {
        let cache = self.cache.read().map_err(|_| CacheError::PoisonedLock)?;
        Ok(cache.domain_entries.values().cloned().collect())
    }

    pub fn lookup(&self, question: &DnsQuestion) -> Option<DnsPacket> {
        let mut cache = match self.cache.write() {
            Ok(x) => x,
            Err(_) => return None,
        };

        cache.lookup(question)
    }

    pub fn store(&self, response: &DnsPacket) -> Result<()> {
        let mut cache = self.cache.write().map_err(|_| CacheError::PoisonedLock)?;

        cache.store(response);

        Ok(())
    }

    pub fn purge(&self) -> Result<()> {
        let mut cache = self.cache.write().map_err(|_| CacheError::PoisonedLock)?;

        cache.purge();

        Ok(())
    }
}
