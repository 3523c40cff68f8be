//! In-process nameservers for integration tests

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dnsmux::dns::config::ResolverConfig;
use dnsmux::dns::protocol::{DnsClass, DnsPacket, DnsRecord, QueryType, RData, ResultCode};
use dnsmux::dns::tsig::{self, TsigKey};

/// How a fake nameserver treats the queries it gets
#[derive(Clone)]
pub enum Behavior {
    /// Answers with one A record
    Answer(Ipv4Addr),
    /// Never answers
    Silent,
    /// Answers with an empty response carrying the rcode
    Rcode(ResultCode),
    /// Sets TC over UDP and answers in full over TCP
    TruncateUdp(Ipv4Addr),
    /// Sets TC over UDP on an answer cut off in the middle of its record,
    /// and answers in full over TCP
    TruncateUdpCut(Ipv4Addr),
    /// Answers with one A record after a pause
    Delayed(Duration, Ipv4Addr),
    /// Verifies the query signature and signs the answer
    Signed(TsigKey, Ipv4Addr),
    /// Answers with one A record, but leaves signed queries unsigned
    Unsigned(Ipv4Addr),
}

pub struct FakeNameserver {
    pub addr: SocketAddr,
    pub udp_queries: Arc<AtomicUsize>,
    pub tcp_queries: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
}

impl Drop for FakeNameserver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl FakeNameserver {
    pub fn queries(&self) -> usize {
        self.udp_queries.load(Ordering::SeqCst) + self.tcp_queries.load(Ordering::SeqCst)
    }
}

fn respond(behavior: &Behavior, bytes: &[u8], over_udp: bool) -> Option<Vec<u8>> {
    let mut query = DnsPacket::decode(bytes).ok()?;

    let answer = |addr: Ipv4Addr, query: &DnsPacket| {
        let mut response = query.reply();
        response.header.recursion_available = true;
        response.answers.push(DnsRecord::new(
            &query.questions[0].name,
            QueryType::A,
            DnsClass::In,
            300,
            RData::A(addr),
        ));
        response
    };

    let response = match behavior {
        Behavior::Silent => return None,
        Behavior::Answer(addr) | Behavior::Unsigned(addr) => answer(*addr, &query),
        Behavior::Rcode(rcode) => {
            let mut response = query.reply();
            response.header.rescode = *rcode;
            response
        }
        Behavior::TruncateUdp(addr) => {
            if over_udp {
                let mut response = query.reply();
                response.header.truncated_message = true;
                response
            } else {
                answer(*addr, &query)
            }
        }
        Behavior::TruncateUdpCut(addr) => {
            let response = answer(*addr, &query);
            if !over_udp {
                return response.encode().ok();
            }
            let mut truncated = response;
            truncated.header.truncated_message = true;
            let mut bytes = truncated.encode().ok()?;
            // drop the tail of the A record's address
            bytes.truncate(bytes.len() - 2);
            return Some(bytes);
        }
        Behavior::Delayed(delay, addr) => {
            thread::sleep(*delay);
            answer(*addr, &query)
        }
        Behavior::Signed(key, addr) => {
            let mac = tsig::verify(bytes, &mut query, key, None).ok()?;
            let response = answer(*addr, &query);
            return tsig::sign(&response, key, Some(mac.as_slice())).ok().map(|signed| signed.bytes);
        }
    };

    response.encode().ok()
}

fn serve_udp(socket: UdpSocket, behavior: Behavior, count: Arc<AtomicUsize>, stop: Arc<AtomicBool>) {
    socket
        .set_read_timeout(Some(Duration::from_millis(20)))
        .unwrap();
    let mut buf = [0; 65535];
    while !stop.load(Ordering::SeqCst) {
        let (len, client) = match socket.recv_from(&mut buf) {
            Ok(x) => x,
            Err(_) => continue,
        };
        count.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = respond(&behavior, &buf[..len], true) {
            let _ = socket.send_to(&response, client);
        }
    }
}

fn handle_tcp(mut stream: TcpStream, behavior: Behavior) {
    let mut len_buf = [0; 2];
    if stream.read_exact(&mut len_buf).is_err() {
        return;
    }
    let mut query = vec![0; u16::from_be_bytes(len_buf) as usize];
    if stream.read_exact(&mut query).is_err() {
        return;
    }

    match respond(&behavior, &query, false) {
        Some(response) => {
            let mut frame = (response.len() as u16).to_be_bytes().to_vec();
            frame.extend_from_slice(&response);
            let _ = stream.write_all(&frame);
        }
        // hold the connection open so the client has to time out
        None => thread::sleep(Duration::from_secs(10)),
    }
}

fn serve_tcp(
    listener: TcpListener,
    behavior: Behavior,
    count: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
) {
    listener.set_nonblocking(true).unwrap();
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                count.fetch_add(1, Ordering::SeqCst);
                stream.set_nonblocking(false).unwrap();
                let behavior = behavior.clone();
                thread::spawn(move || handle_tcp(stream, behavior));
            }
            Err(_) => thread::sleep(Duration::from_millis(5)),
        }
    }
}

fn start(ip: Ipv4Addr, port: u16, behavior: Behavior) -> std::io::Result<FakeNameserver> {
    let addr = SocketAddr::new(IpAddr::V4(ip), port);
    let udp = UdpSocket::bind(addr)?;
    let addr = udp.local_addr()?;
    let tcp = TcpListener::bind(addr)?;

    let server = FakeNameserver {
        addr,
        udp_queries: Arc::new(AtomicUsize::new(0)),
        tcp_queries: Arc::new(AtomicUsize::new(0)),
        stop: Arc::new(AtomicBool::new(false)),
    };

    {
        let behavior = behavior.clone();
        let count = server.udp_queries.clone();
        let stop = server.stop.clone();
        thread::spawn(move || serve_udp(udp, behavior, count, stop));
    }
    {
        let count = server.tcp_queries.clone();
        let stop = server.stop.clone();
        thread::spawn(move || serve_tcp(tcp, behavior, count, stop));
    }

    Ok(server)
}

/// Starts one nameserver per behavior, on 127.0.0.1, 127.0.0.2, ... all
/// sharing one port, since a resolver uses the same port for every
/// nameserver
pub fn nameservers(behaviors: Vec<Behavior>) -> Vec<FakeNameserver> {
    'attempt: for _ in 0..20 {
        let mut servers: Vec<FakeNameserver> = Vec::new();
        for (i, behavior) in behaviors.iter().enumerate() {
            let ip = Ipv4Addr::new(127, 0, 0, i as u8 + 1);
            let port = servers.first().map(|s| s.addr.port()).unwrap_or(0);
            match start(ip, port, behavior.clone()) {
                Ok(server) => servers.push(server),
                Err(_) => continue 'attempt,
            }
        }
        return servers;
    }
    panic!("could not find a free port for the fake nameservers");
}

/// A configuration pointing at the fake nameservers, with short timers
pub fn config_for(servers: &[FakeNameserver]) -> ResolverConfig {
    let mut config =
        ResolverConfig::with_nameservers(servers.iter().map(|s| s.addr.ip()).collect());
    config.port = servers.first().map(|s| s.addr.port()).unwrap_or(53);
    config.retry_times = 2;
    config.retry_delay = Duration::from_millis(400);
    config.packet_timeout = Duration::from_secs(2);
    config.multiplexer.tick_interval = Duration::from_millis(20);
    config
}
