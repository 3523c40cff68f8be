//! dnsq
//!
//! Command line front end for the resolver: sends one query to a list of
//! nameservers and prints the answer dig style or as JSON.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use dnsmux::dns::config::{ResolverConfig, TsigConfig};
use dnsmux::dns::logging::{init_logging, LogLevel, LoggerConfig};
use dnsmux::dns::protocol::{DnsClass, QueryType};
use dnsmux::dns::resolver::Resolver;

/// Query DNS nameservers
#[derive(Parser)]
#[command(name = "dnsq")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Name to look up
    name: String,

    /// Record type
    #[arg(default_value = "A")]
    qtype: QueryType,

    /// Record class
    #[arg(short = 'c', long, default_value = "IN")]
    class: DnsClass,

    /// Nameserver to ask, may be repeated
    #[arg(short = 's', long = "server", env = "DNSQ_SERVERS", value_delimiter = ',')]
    servers: Vec<IpAddr>,

    /// TOML configuration file; flags override its values
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Nameserver port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Use TCP for every query
    #[arg(long, conflicts_with = "no_tcp")]
    tcp: bool,

    /// Never fall back to TCP
    #[arg(long)]
    no_tcp: bool,

    /// Ask for DNSSEC records
    #[arg(long)]
    dnssec: bool,

    /// Clear the recursion desired flag
    #[arg(long)]
    norecurse: bool,

    /// Number of retry rounds
    #[arg(long)]
    retries: Option<u32>,

    /// Seconds between the first sends of two rounds
    #[arg(long)]
    retry_delay: Option<f64>,

    /// Seconds to wait for each packet
    #[arg(long)]
    timeout: Option<f64>,

    /// Overall deadline in seconds
    #[arg(long)]
    query_timeout: Option<f64>,

    /// TSIG key as [algorithm:]name:base64-secret
    #[arg(short = 'y', long, env = "DNSQ_TSIG_KEY")]
    key: Option<String>,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Log level
    #[arg(short = 'v', long, default_value = "warn")]
    log_level: LogLevel,

    /// Log as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(ValueEnum, Clone, Copy)]
enum OutputFormat {
    Text,
    Json,
}

fn parse_key(value: &str) -> Result<TsigConfig, String> {
    let parts: Vec<&str> = value.splitn(3, ':').collect();
    let (algorithm, name, secret) = match parts.as_slice() {
        [name, secret] => ("hmac-sha256", *name, *secret),
        [algorithm, name, secret] => (*algorithm, *name, *secret),
        _ => return Err(format!("malformed key `{}`", value)),
    };

    Ok(TsigConfig {
        name: name.to_string(),
        algorithm: algorithm.to_string(),
        secret: secret.to_string(),
        fudge: 300,
    })
}

fn secs(value: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(value).map_err(|e| format!("invalid duration {}: {}", value, e))
}

fn build_config(cli: &Cli) -> Result<ResolverConfig, String> {
    let mut config = match &cli.config {
        Some(path) => ResolverConfig::load(path).map_err(|e| format!("{}: {}", path.display(), e))?,
        None => ResolverConfig::default(),
    };

    if !cli.servers.is_empty() {
        config.nameservers = cli.servers.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.use_tcp |= cli.tcp;
    config.no_tcp |= cli.no_tcp;
    config.dnssec |= cli.dnssec;
    if cli.norecurse {
        config.recurse = false;
    }
    if let Some(retries) = cli.retries {
        config.retry_times = retries;
    }
    if let Some(delay) = cli.retry_delay {
        config.retry_delay = secs(delay)?;
    }
    if let Some(timeout) = cli.timeout {
        config.packet_timeout = secs(timeout)?;
    }
    if let Some(timeout) = cli.query_timeout {
        config.query_timeout = secs(timeout)?;
    }
    if let Some(key) = &cli.key {
        config.tsig = Some(parse_key(key)?);
    }

    if config.nameservers.is_empty() {
        return Err("no nameservers given, use --server or a config file".to_string());
    }
    config.validate().map_err(|e| e.to_string())?;

    Ok(config)
}

fn run(cli: Cli) -> Result<(), String> {
    let config = build_config(&cli)?;
    let resolver = Resolver::new(config).map_err(|e| e.to_string())?;

    let response = resolver
        .query(&cli.name, cli.qtype, cli.class)
        .map_err(|e| e.to_string())?;

    match cli.output {
        OutputFormat::Text => println!("{}", response),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&response).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
    }

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    init_logging(&LoggerConfig {
        level: cli.log_level,
        json_format: cli.log_json,
        console_output: true,
    });

    if let Err(e) = run(cli) {
        eprintln!("dnsq: {}", e);
        process::exit(1);
    }
}
