//! resolver configuration
//!
//! Plain values with sensible defaults. A configuration can be built in
//! code or read from TOML; turning a system resolver file into one is left
//! to the caller.

use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

use crate::dns::edns::LEGACY_UDP_SIZE;
use crate::dns::multiplexer::Protocol;
use crate::dns::transport::TransportConfig;
use crate::dns::tsig::{TsigAlgorithm, TsigError, TsigKey, DEFAULT_FUDGE};

#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    Io(io::Error),
    Toml(toml::de::Error),
    Tsig(TsigError),
    #[display(fmt = "invalid configuration: {}", reason)]
    #[from(ignore)]
    Invalid { reason: String },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Doubling the retry delay this often outgrows any timer
pub const MAX_RETRY_TIMES: u32 = 64;

/// Durations are written as (fractional) seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MultiplexerConfig {
    /// How often tick observers are called
    #[serde(with = "duration_secs")]
    pub tick_interval: Duration,
    /// Empty loop iterations before the event loop thread exits
    pub idle_iterations: u32,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        MultiplexerConfig {
            tick_interval: Duration::from_millis(100),
            idle_iterations: 50,
        }
    }
}

/// A TSIG key as written in a configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TsigConfig {
    pub name: String,
    #[serde(default = "default_tsig_algorithm")]
    pub algorithm: String,
    /// base64 encoded shared secret
    pub secret: String,
    #[serde(default = "default_fudge")]
    pub fudge: u16,
}

fn default_tsig_algorithm() -> String {
    TsigAlgorithm::HmacSha256.name().to_string()
}

fn default_fudge() -> u16 {
    DEFAULT_FUDGE
}

impl TsigConfig {
    pub fn key(&self) -> std::result::Result<TsigKey, TsigError> {
        let algorithm = self.algorithm.parse::<TsigAlgorithm>()?;
        Ok(TsigKey::from_base64(&self.name, algorithm, &self.secret)?.with_fudge(self.fudge))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    /// Nameservers in the order they are tried
    pub nameservers: Vec<IpAddr>,
    pub port: u16,
    /// Number of retry rounds
    pub retry_times: u32,
    /// Spacing of the first round, doubled for every later one
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    /// Hard deadline for a whole query; zero means none
    #[serde(with = "duration_secs")]
    pub query_timeout: Duration,
    /// How long a single packet waits for its response
    #[serde(with = "duration_secs")]
    pub packet_timeout: Duration,
    /// Send every query over TCP
    pub use_tcp: bool,
    /// Never fall back to TCP, not even for truncated answers
    pub no_tcp: bool,
    pub recurse: bool,
    /// Ask for DNSSEC records (sets the DO bit)
    pub dnssec: bool,
    /// Advertised EDNS payload size
    pub udp_size: u16,
    pub src_address: Option<IpAddr>,
    /// Zero lets the OS pick
    pub src_port: u16,
    /// Accept truncated UDP answers instead of retrying over TCP
    pub ignore_truncation: bool,
    pub do_caching: bool,
    /// Stop sending to a nameserver once one of its packets timed out
    pub drop_server_on_timeout: bool,
    pub tsig: Option<TsigConfig>,
    pub multiplexer: MultiplexerConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            nameservers: Vec::new(),
            port: 53,
            retry_times: 4,
            retry_delay: Duration::from_secs(5),
            query_timeout: Duration::from_secs(0),
            packet_timeout: Duration::from_secs(5),
            use_tcp: false,
            no_tcp: false,
            recurse: true,
            dnssec: false,
            udp_size: 1232,
            src_address: None,
            src_port: 0,
            ignore_truncation: false,
            do_caching: false,
            drop_server_on_timeout: true,
            tsig: None,
            multiplexer: MultiplexerConfig::default(),
        }
    }
}

impl ResolverConfig {
    pub fn with_nameservers(nameservers: Vec<IpAddr>) -> ResolverConfig {
        ResolverConfig {
            nameservers,
            ..ResolverConfig::default()
        }
    }

    pub fn from_toml_str(toml: &str) -> Result<ResolverConfig> {
        let config: ResolverConfig = toml::from_str(toml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<ResolverConfig> {
        ResolverConfig::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_times == 0 || self.retry_times > MAX_RETRY_TIMES {
            return Err(ConfigError::Invalid {
                reason: format!("retry_times must be between 1 and {}", MAX_RETRY_TIMES),
            });
        }
        if self.udp_size < LEGACY_UDP_SIZE {
            return Err(ConfigError::Invalid {
                reason: format!("udp_size must be at least {}", LEGACY_UDP_SIZE),
            });
        }
        if self.use_tcp && self.no_tcp {
            return Err(ConfigError::Invalid {
                reason: "use_tcp and no_tcp are mutually exclusive".to_string(),
            });
        }
        if self.multiplexer.tick_interval.is_zero() {
            return Err(ConfigError::Invalid {
                reason: "tick_interval must not be zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn tsig_key(&self) -> Result<Option<TsigKey>> {
        Ok(self.tsig.as_ref().map(TsigConfig::key).transpose()?)
    }

    /// One transport configuration per nameserver, in order
    pub fn transport_configs(&self) -> Result<Vec<TransportConfig>> {
        self.validate()?;
        let tsig = self.tsig_key()?;

        Ok(self
            .nameservers
            .iter()
            .map(|ip| TransportConfig {
                server: SocketAddr::new(*ip, self.port),
                protocol: if self.use_tcp {
                    Protocol::Tcp
                } else {
                    Protocol::Udp
                },
                packet_timeout: self.packet_timeout,
                src_address: self.src_address,
                src_port: self.src_port,
                udp_size: self.udp_size,
                tsig: tsig.clone(),
                recurse: self.recurse,
                dnssec: self.dnssec,
                ignore_truncation: self.ignore_truncation,
                no_tcp: self.no_tcp,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ResolverConfig::default();

        assert_eq!(4, config.retry_times);
        assert_eq!(Duration::from_secs(5), config.retry_delay);
        assert!(config.query_timeout.is_zero());
        assert_eq!(Duration::from_secs(5), config.packet_timeout);
        assert_eq!(1232, config.udp_size);
        assert_eq!(Duration::from_millis(100), config.multiplexer.tick_interval);
        assert!(config.recurse);
        assert!(config.drop_server_on_timeout);
    }

    #[test]
    fn test_from_toml() {
        let config = ResolverConfig::from_toml_str(
            r#"
            nameservers = ["192.0.2.1", "2001:db8::53"]
            port = 5353
            retry_times = 2
            retry_delay = 2.5
            packet_timeout = 1
            dnssec = true

            [tsig]
            name = "transfer.example."
            secret = "c2VjcmV0"

            [multiplexer]
            tick_interval = 0.05
            "#,
        )
        .unwrap();

        assert_eq!(2, config.nameservers.len());
        assert_eq!(5353, config.port);
        assert_eq!(Duration::from_millis(2500), config.retry_delay);
        assert_eq!(Duration::from_secs(1), config.packet_timeout);
        assert_eq!(Duration::from_millis(50), config.multiplexer.tick_interval);
        assert_eq!(50, config.multiplexer.idle_iterations);

        let key = config.tsig_key().unwrap().unwrap();
        assert_eq!("transfer.example", key.name);
        assert_eq!(TsigAlgorithm::HmacSha256, key.algorithm);

        let transports = config.transport_configs().unwrap();
        assert_eq!(2, transports.len());
        assert_eq!("192.0.2.1:5353".parse::<SocketAddr>().unwrap(), transports[0].server);
        assert!(transports[1].dnssec);
        assert!(transports[1].tsig.is_some());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = ResolverConfig::from_toml_str("retries = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_invalid_values() {
        let err = ResolverConfig::from_toml_str("retry_times = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = ResolverConfig::from_toml_str("retry_times = 70").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(ResolverConfig::from_toml_str("retry_times = 64").is_ok());

        let err = ResolverConfig::from_toml_str("udp_size = 100").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = ResolverConfig::from_toml_str("use_tcp = true\nno_tcp = true").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_bad_tsig_secret() {
        let config = ResolverConfig {
            tsig: Some(TsigConfig {
                name: "key".to_string(),
                algorithm: "hmac-md5.sig-alg.reg.int".to_string(),
                secret: "c2VjcmV0".to_string(),
                fudge: 300,
            }),
            ..ResolverConfig::default()
        };
        assert!(matches!(config.tsig_key(), Err(ConfigError::Tsig(_))));
    }
}
