//! single nameserver sender
//!
//! A `Transport` knows how to talk to one nameserver: it builds the packet
//! (flags, EDNS, TSIG), opens a fresh socket for every send, writes the query
//! and leaves waiting for the answer to the multiplexer. Failing to open,
//! connect or write is reported to the caller right away.

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpStream, UdpSocket};
use rand::random;
use socket2::{Domain, Socket, Type};

use crate::dns::edns::{EdnsRecord, LEGACY_UDP_SIZE};
use crate::dns::errors::ResolveError;
use crate::dns::multiplexer::{
    Connection, Delivery, Multiplexer, Protocol, QueryId, Registration, SendId, TsigContext,
};
use crate::dns::netutil::frame_message;
use crate::dns::protocol::DnsPacket;
use crate::dns::tsig::{self, TsigKey};

type Result<T> = std::result::Result<T, ResolveError>;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub server: SocketAddr,
    /// Protocol to use when the query fits into a datagram
    pub protocol: Protocol,
    pub packet_timeout: Duration,
    pub src_address: Option<IpAddr>,
    /// Zero lets the OS pick
    pub src_port: u16,
    /// Advertised EDNS payload size
    pub udp_size: u16,
    pub tsig: Option<TsigKey>,
    /// Value of the RD flag on every query
    pub recurse: bool,
    pub dnssec: bool,
    pub ignore_truncation: bool,
    pub no_tcp: bool,
}

impl TransportConfig {
    pub fn new(server: SocketAddr) -> TransportConfig {
        TransportConfig {
            server,
            protocol: Protocol::Udp,
            packet_timeout: Duration::from_secs(5),
            src_address: None,
            src_port: 0,
            udp_size: 1232,
            tsig: None,
            recurse: true,
            dnssec: false,
            ignore_truncation: false,
            no_tcp: false,
        }
    }

    fn uses_edns(&self) -> bool {
        self.udp_size > LEGACY_UDP_SIZE || self.dnssec
    }

    /// Largest query that still goes out over UDP
    fn udp_limit(&self) -> usize {
        if self.uses_edns() {
            self.udp_size as usize
        } else {
            LEGACY_UDP_SIZE as usize
        }
    }
}

/// A query ready for the wire
#[derive(Clone, Debug)]
pub struct Prepared {
    pub packet: DnsPacket,
    pub bytes: Vec<u8>,
    pub tsig: Option<TsigContext>,
}

pub struct Transport {
    config: TransportConfig,
    mux: Arc<Multiplexer>,
}

impl Transport {
    pub fn new(config: TransportConfig, mux: Arc<Multiplexer>) -> Transport {
        Transport { config, mux }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn server(&self) -> SocketAddr {
        self.config.server
    }

    /// Builds the packet actually sent: fresh id, RD as configured, an OPT
    /// record when needed, and a TSIG signature when a key is configured
    pub fn prepare(&self, message: &DnsPacket) -> Result<Prepared> {
        let mut packet = message.clone();
        packet.header.id = random::<u16>();
        packet.header.response = false;
        packet.header.recursion_desired = self.config.recurse;

        if self.config.uses_edns() {
            let mut edns = packet
                .edns()
                .unwrap_or_else(|| EdnsRecord::new(self.config.udp_size));
            edns.udp_size = self.config.udp_size;
            edns.dnssec_ok |= self.config.dnssec;
            packet.set_edns(Some(edns));
        }

        match &self.config.tsig {
            Some(key) => {
                let signed = tsig::sign(&packet, key, None)?;
                Ok(Prepared {
                    packet: signed.packet,
                    bytes: signed.bytes,
                    tsig: Some(TsigContext {
                        key: key.clone(),
                        request_mac: signed.mac,
                    }),
                })
            }
            None => {
                let bytes = packet.encode()?;
                Ok(Prepared {
                    packet,
                    bytes,
                    tsig: None,
                })
            }
        }
    }

    /// Sends a query, using TCP when configured or when the query does not
    /// fit into a datagram. The outcome is posted to `destination`.
    pub fn send(
        &self,
        message: &DnsPacket,
        destination: &Sender<Delivery>,
        query: QueryId,
    ) -> Result<SendId> {
        let prepared = self.prepare(message)?;

        let protocol = match self.config.protocol {
            Protocol::Tcp => Protocol::Tcp,
            Protocol::Udp if prepared.bytes.len() <= self.config.udp_limit() => Protocol::Udp,
            Protocol::Udp if self.config.no_tcp => {
                return Err(ResolveError::MessageTooLarge {
                    size: prepared.bytes.len(),
                    limit: self.config.udp_limit(),
                })
            }
            Protocol::Udp => {
                log::debug!(
                    "query of {} bytes is too large for UDP, using TCP",
                    prepared.bytes.len()
                );
                Protocol::Tcp
            }
        };

        self.dispatch(prepared, protocol, destination, query)
    }

    /// Sends a query over TCP regardless of configuration, used to repeat a
    /// query whose UDP answer was truncated
    pub fn send_tcp(
        &self,
        message: &DnsPacket,
        destination: &Sender<Delivery>,
        query: QueryId,
    ) -> Result<SendId> {
        let prepared = self.prepare(message)?;
        self.dispatch(prepared, Protocol::Tcp, destination, query)
    }

    fn dispatch(
        &self,
        prepared: Prepared,
        protocol: Protocol,
        destination: &Sender<Delivery>,
        query: QueryId,
    ) -> Result<SendId> {
        let server = self.config.server;
        log::debug!(
            "sending query {} (id {}) to {} over {}",
            query,
            prepared.packet.header.id,
            server,
            protocol
        );

        let connection = match protocol {
            Protocol::Udp => {
                let socket = self.open_udp()?;
                socket.send(&prepared.bytes)?;
                Connection::Udp(socket)
            }
            Protocol::Tcp => {
                let frame = frame_message(&prepared.bytes)?;
                Connection::tcp(self.open_tcp(&frame)?)
            }
        };

        self.mux.register(Registration {
            query,
            expected_id: prepared.packet.header.id,
            question: prepared.packet.questions.first().cloned(),
            peer: server,
            connection,
            timeout: self.config.packet_timeout,
            tsig: prepared.tsig,
            // nowhere to go with a truncated answer without TCP
            ignore_truncation: self.config.ignore_truncation || self.config.no_tcp,
            destination: destination.clone(),
        })
    }

    fn bind_address(&self) -> SocketAddr {
        let ip = self.config.src_address.unwrap_or(match self.config.server {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        SocketAddr::new(ip, self.config.src_port)
    }

    fn open_udp(&self) -> io::Result<UdpSocket> {
        let server = self.config.server;
        let socket = Socket::new(Domain::for_address(server), Type::DGRAM, None)?;
        if self.config.src_port != 0 {
            socket.set_reuse_address(true)?;
        }
        socket.bind(&self.bind_address().into())?;
        socket.connect(&server.into())?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into()))
    }

    /// Connects and writes the framed query, each step bounded by the
    /// packet timeout, then hands back a non-blocking stream
    fn open_tcp(&self, frame: &[u8]) -> io::Result<TcpStream> {
        let server = self.config.server;
        let timeout = self.config.packet_timeout;
        let socket = Socket::new(Domain::for_address(server), Type::STREAM, None)?;
        if self.config.src_address.is_some() || self.config.src_port != 0 {
            if self.config.src_port != 0 {
                socket.set_reuse_address(true)?;
            }
            socket.bind(&self.bind_address().into())?;
        }
        socket.set_nodelay(true)?;

        if timeout.is_zero() {
            socket.connect(&server.into())?;
        } else {
            socket.connect_timeout(&server.into(), timeout)?;
            socket.set_write_timeout(Some(timeout))?;
        }
        (&socket).write_all(frame)?;
        socket.set_nonblocking(true)?;

        Ok(TcpStream::from_std(socket.into()))
    }

    /// Sends a query and waits for the answer, repeating it over TCP when
    /// the UDP answer comes back truncated. Error rcodes become errors.
    pub fn query(&self, message: &DnsPacket) -> Result<DnsPacket> {
        let (tx, rx) = channel();
        self.send(message, &tx, QueryId(0))?;

        let response = match wait(&rx) {
            Err(ResolveError::Truncated { .. }) => {
                log::info!("truncated response from {}, resending over TCP", self.server());
                self.send_tcp(message, &tx, QueryId(0))?;
                wait(&rx)?
            }
            other => other?,
        };

        ResolveError::check_response(response)
    }
}

fn wait(rx: &Receiver<Delivery>) -> Result<DnsPacket> {
    match rx.recv() {
        Ok(delivery) => delivery.result,
        Err(_) => Err(ResolveError::Shutdown),
    }
}
