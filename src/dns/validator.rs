//! pluggable response validation
//!
//! DNSSEC validation itself lives outside this crate. The resolver hands
//! every successful response to a `Validator` and stores the verdict on the
//! response before delivering it.

use serde_derive::{Deserialize, Serialize};

use crate::dns::protocol::DnsPacket;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// No validator looked at the response
    #[default]
    Unchecked,
    Insecure,
    Secure,
    Bogus,
    Indeterminate,
}

pub trait Validator: Send + Sync {
    fn validate(&self, response: &DnsPacket) -> SecurityLevel;
}

/// Marks everything insecure
pub struct InsecureValidator;

impl Validator for InsecureValidator {
    fn validate(&self, _: &DnsPacket) -> SecurityLevel {
        SecurityLevel::Insecure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_validator() {
        let packet = DnsPacket::new();
        assert_eq!(SecurityLevel::Unchecked, packet.security_level);
        assert_eq!(SecurityLevel::Insecure, InsecureValidator.validate(&packet));
    }
}
