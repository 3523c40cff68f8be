//! resource record sets

use serde_derive::{Deserialize, Serialize};

use crate::dns::protocol::{names_equal, DnsRecord, RData};
use crate::dns::query_type::{DnsClass, QueryType};

/// All records sharing owner name, type and class, plus the RRSIGs that
/// cover them. Every member carries the same ttl: the lowest one seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RRSet {
    pub domain: String,
    pub rtype: QueryType,
    pub class: DnsClass,
    pub ttl: u32,
    pub records: Vec<DnsRecord>,
    pub sigs: Vec<DnsRecord>,
}

impl RRSet {
    pub fn new(record: DnsRecord) -> RRSet {
        let mut rrset = RRSet {
            domain: record.domain.clone(),
            rtype: covered_type(&record).unwrap_or(record.rtype),
            class: record.class,
            ttl: record.ttl,
            records: Vec::new(),
            sigs: Vec::new(),
        };
        rrset.push(record);
        rrset
    }

    /// Does the record belong to this set, either as a member or as one of
    /// its signatures?
    pub fn accepts(&self, record: &DnsRecord) -> bool {
        names_equal(&self.domain, &record.domain)
            && self.class == record.class
            && covered_type(record).unwrap_or(record.rtype) == self.rtype
    }

    /// Adds a record, returning false if it belongs to another set.
    /// Duplicates are dropped.
    pub fn add(&mut self, record: DnsRecord) -> bool {
        if !self.accepts(&record) {
            return false;
        }
        self.push(record);
        true
    }

    fn push(&mut self, record: DnsRecord) {
        if record.ttl < self.ttl {
            self.ttl = record.ttl;
            for rec in self.records.iter_mut().chain(self.sigs.iter_mut()) {
                rec.ttl = record.ttl;
            }
        }

        let mut record = record;
        record.ttl = self.ttl;

        let target = if record.rtype == QueryType::Rrsig {
            &mut self.sigs
        } else {
            &mut self.records
        };
        if !target.iter().any(|rec| rec.rdata == record.rdata) {
            target.push(record);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Groups records into sets, keeping the order in which each set first
    /// appears
    pub fn group(records: &[DnsRecord]) -> Vec<RRSet> {
        let mut sets: Vec<RRSet> = Vec::new();
        for record in records {
            if record.rtype.is_meta() {
                continue;
            }
            match sets.iter_mut().find(|set| set.accepts(record)) {
                Some(set) => set.push(record.clone()),
                None => sets.push(RRSet::new(record.clone())),
            }
        }
        sets
    }
}

/// The type an RRSIG covers, taken from the first two octets of its data
fn covered_type(record: &DnsRecord) -> Option<QueryType> {
    if record.rtype != QueryType::Rrsig {
        return None;
    }
    match &record.rdata {
        RData::Unknown(data) if data.len() >= 2 => {
            Some(QueryType::from_num(u16::from_be_bytes([data[0], data[1]])))
        }
        _ => None,
    }
}
