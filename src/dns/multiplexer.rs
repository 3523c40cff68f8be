//! socket multiplexer
//!
//! One event loop thread waits on every socket with a query in flight,
//! matches responses to the registration that owns the socket, fires packet
//! timeouts and drives periodic ticks for components that need polling.
//! Senders open, connect and write their own sockets and only hand them over
//! here, so the loop only ever reads.
//!
//! The loop thread is started on first use and exits again after a number of
//! idle iterations. It never calls out (deliveries, observers) while holding
//! the state lock, and it is the only thread that ever removes a
//! registration; other threads can add registrations or mark them cancelled.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};
use std::thread::{self, Builder, JoinHandle};
use std::time::{Duration, Instant};

use derive_more::Display;
use mio::event::Source;
use mio::net::{TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};

use crate::dns::config::MultiplexerConfig;
use crate::dns::errors::ResolveError;
use crate::dns::netutil::split_frames;
use crate::dns::protocol::{DnsPacket, DnsQuestion, Section};
use crate::dns::tsig::{self, TsigKey};

const WAKER: Token = Token(usize::MAX);
const RECV_BUFFER_SIZE: usize = 65535;

/// Caller chosen id of a logical query
#[derive(
    Copy, Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct QueryId(pub u64);

/// Handle of one registered socket
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendId(u64);

impl SendId {
    fn token(self) -> Token {
        Token(self.0 as usize)
    }
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[display(fmt = "udp")]
    Udp,
    #[display(fmt = "tcp")]
    Tcp,
}

/// The outcome of one registration, posted to its destination
#[derive(Debug)]
pub struct Delivery {
    pub query: QueryId,
    pub send: SendId,
    pub result: Result<DnsPacket, ResolveError>,
}

/// Called from the loop thread once per tick and after every batch of
/// deliveries
pub trait TickObserver: Send + Sync {
    fn tick(&self);
}

/// What is needed to verify a signed response
#[derive(Clone, Debug)]
pub struct TsigContext {
    pub key: TsigKey,
    pub request_mac: Vec<u8>,
}

/// A connected socket waiting for one response. The query has already been
/// written to it.
pub enum Connection {
    Udp(UdpSocket),
    Tcp {
        stream: TcpStream,
        /// Bytes read so far, responses are length-prefixed
        incoming: Vec<u8>,
    },
}

impl Connection {
    pub fn tcp(stream: TcpStream) -> Connection {
        Connection::Tcp {
            stream,
            incoming: Vec::new(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Connection::Udp(_) => Protocol::Udp,
            Connection::Tcp { .. } => Protocol::Tcp,
        }
    }

    fn source(&mut self) -> &mut dyn Source {
        match self {
            Connection::Udp(socket) => socket,
            Connection::Tcp { stream, .. } => stream,
        }
    }

}

pub struct Registration {
    pub query: QueryId,
    /// Header id the response has to carry
    pub expected_id: u16,
    /// Question the response has to echo, if any
    pub question: Option<DnsQuestion>,
    pub peer: SocketAddr,
    pub connection: Connection,
    pub timeout: Duration,
    pub tsig: Option<TsigContext>,
    /// Hand out truncated UDP responses instead of reporting them
    pub ignore_truncation: bool,
    pub destination: Sender<Delivery>,
}

struct Entry {
    registration: Registration,
    deadline: Instant,
    cancelled: bool,
}

/// The parts of a registration needed to judge a response, copied out so
/// the judging happens without the lock
struct Matcher {
    expected_id: u16,
    question: Option<DnsQuestion>,
    peer: SocketAddr,
    protocol: Protocol,
    tsig: Option<TsigContext>,
    ignore_truncation: bool,
}

impl Matcher {
    fn new(registration: &Registration) -> Matcher {
        Matcher {
            expected_id: registration.expected_id,
            question: registration.question.clone(),
            peer: registration.peer,
            protocol: registration.connection.protocol(),
            tsig: registration.tsig.clone(),
            ignore_truncation: registration.ignore_truncation,
        }
    }

    /// Decides what a received message means for the registration. `None`
    /// is a stray packet which leaves the registration waiting.
    fn examine(&self, bytes: &[u8]) -> Option<Result<DnsPacket, ResolveError>> {
        let truncation_matters = self.protocol == Protocol::Udp && !self.ignore_truncation;

        let mut packet = match DnsPacket::decode(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                let header = &err.partial.header;
                let ours = err.section != Section::Header
                    && header.response
                    && header.id == self.expected_id;

                if !ours && self.protocol == Protocol::Udp {
                    log::warn!("ignoring malformed packet from {}: {}", self.peer, err);
                    return None;
                }
                if ours && header.truncated_message && truncation_matters {
                    let mut response = err.partial;
                    response.answer_from = Some(self.peer);
                    return Some(Err(ResolveError::Truncated { response }));
                }
                return Some(Err(err.into()));
            }
        };

        if !packet.matches_query(self.expected_id, self.question.as_ref()) {
            log::warn!(
                "stray packet {} from {}, expected id {}",
                packet.header.id,
                self.peer,
                self.expected_id
            );
            return None;
        }
        packet.answer_from = Some(self.peer);

        if packet.header.truncated_message && truncation_matters {
            return Some(Err(ResolveError::Truncated {
                response: Box::new(packet),
            }));
        }

        if let Some(tsig) = &self.tsig {
            let request_mac = Some(tsig.request_mac.as_slice());
            if let Err(e) = tsig::verify(bytes, &mut packet, &tsig.key, request_mac) {
                log::warn!("TSIG verification of response from {} failed: {}", self.peer, e);
                return Some(Err(e.into()));
            }
        }

        Some(Ok(packet))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Status {
    /// No loop thread; the next registration starts one
    Idle,
    Running,
    Stopping,
    /// Stopped explicitly; registrations are refused until `start`
    Stopped,
}

struct Inner {
    status: Status,
    entries: HashMap<Token, Entry>,
    /// Registrations the loop has not added to its poll yet
    added: Vec<Token>,
    observers: Vec<Weak<dyn TickObserver>>,
    waker: Option<Arc<Waker>>,
    thread: Option<JoinHandle<()>>,
    next_send: u64,
}

impl Inner {
    fn wake(&self) {
        if let Some(waker) = &self.waker {
            if let Err(e) = waker.wake() {
                log::warn!("failed to wake multiplexer loop: {}", e);
            }
        }
    }

    fn live_observers(&mut self) -> Vec<Arc<dyn TickObserver>> {
        self.observers.retain(|observer| observer.strong_count() > 0);
        self.observers.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Shared by every transport and resolver that sends through it
pub struct Multiplexer {
    config: MultiplexerConfig,
    inner: Arc<Mutex<Inner>>,
}

impl Multiplexer {
    pub fn new(config: MultiplexerConfig) -> Multiplexer {
        Multiplexer {
            config,
            inner: Arc::new(Mutex::new(Inner {
                status: Status::Idle,
                entries: HashMap::new(),
                added: Vec::new(),
                observers: Vec::new(),
                waker: None,
                thread: None,
                next_send: 1,
            })),
        }
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Starts the loop thread, lifting an earlier `stop`
    pub fn start(&self) -> Result<(), ResolveError> {
        let mut inner = self.inner.lock();
        match inner.status {
            Status::Running => Ok(()),
            Status::Stopping => Err(ResolveError::Shutdown),
            Status::Idle | Status::Stopped => self.spawn(&mut inner),
        }
    }

    /// Stops the loop thread. Every live registration that was not
    /// cancelled receives `ResolveError::Shutdown`, and observers get a
    /// final tick.
    pub fn stop(&self) {
        let handle = {
            let mut inner = self.inner.lock();
            match inner.status {
                Status::Running => {
                    inner.status = Status::Stopping;
                    inner.wake();
                }
                Status::Idle => inner.status = Status::Stopped,
                Status::Stopping | Status::Stopped => {}
            }
            inner.thread.take()
        };

        if let Some(handle) = handle {
            // stop may be called by an observer, on the loop thread itself
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!("multiplexer loop thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().status == Status::Running
    }

    /// Number of registrations still waiting, cancelled ones included
    pub fn pending_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Hands a socket over to the loop. Exactly one delivery will be posted
    /// for it unless it is cancelled first.
    pub fn register(&self, registration: Registration) -> Result<SendId, ResolveError> {
        let mut inner = self.inner.lock();
        match inner.status {
            Status::Stopping | Status::Stopped => return Err(ResolveError::Shutdown),
            Status::Idle => self.spawn(&mut inner)?,
            Status::Running => {}
        }

        let send = SendId(inner.next_send);
        inner.next_send += 1;

        log::debug!(
            "registering send {} of query {} to {} over {}",
            send,
            registration.query,
            registration.peer,
            registration.connection.protocol()
        );

        let deadline = Instant::now() + registration.timeout;
        inner.entries.insert(
            send.token(),
            Entry {
                registration,
                deadline,
                cancelled: false,
            },
        );
        inner.added.push(send.token());
        inner.wake();

        Ok(send)
    }

    /// Marks a registration as no longer wanted. Its socket is still read or
    /// timed out by the loop, but nothing is delivered.
    pub fn cancel(&self, send: SendId) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&send.token()) {
            entry.cancelled = true;
        }
    }

    /// Observers keep the loop alive for as long as they are
    pub fn add_observer(&self, observer: Weak<dyn TickObserver>) -> Result<(), ResolveError> {
        let mut inner = self.inner.lock();
        if !inner.observers.iter().any(|o| Weak::ptr_eq(o, &observer)) {
            inner.observers.push(observer);
        }
        match inner.status {
            Status::Stopping | Status::Stopped => Err(ResolveError::Shutdown),
            Status::Idle => self.spawn(&mut inner),
            Status::Running => Ok(()),
        }
    }

    pub fn remove_observer(&self, observer: &Weak<dyn TickObserver>) {
        self.inner
            .lock()
            .observers
            .retain(|o| !Weak::ptr_eq(o, observer));
    }

    fn spawn(&self, inner: &mut Inner) -> Result<(), ResolveError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let event_loop = EventLoop {
            shared: self.inner.clone(),
            poll,
            events: Events::with_capacity(256),
            buf: vec![0; RECV_BUFFER_SIZE],
            tick_interval: self.config.tick_interval,
            idle_iterations: self.config.idle_iterations,
            next_tick: Instant::now() + self.config.tick_interval,
            idle: 0,
        };

        let handle = Builder::new()
            .name("dnsmux-loop".into())
            .spawn(move || event_loop.run())?;

        inner.waker = Some(waker);
        inner.thread = Some(handle);
        inner.status = Status::Running;
        log::debug!("multiplexer loop started");

        Ok(())
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}

type Outbox = Vec<(Sender<Delivery>, Delivery)>;

fn post(outbox: Outbox) -> usize {
    let count = outbox.len();
    for (destination, delivery) in outbox {
        if destination.send(delivery).is_err() {
            log::debug!("delivery dropped, receiver is gone");
        }
    }
    count
}

/// Removes a registration and closes its socket, queueing a delivery unless
/// it was cancelled
fn finish(
    inner: &mut Inner,
    registry: &Registry,
    token: Token,
    result: Result<DnsPacket, ResolveError>,
    outbox: &mut Outbox,
) {
    let mut entry = match inner.entries.remove(&token) {
        Some(entry) => entry,
        None => return,
    };
    inner.added.retain(|t| *t != token);

    if let Err(e) = registry.deregister(entry.registration.connection.source()) {
        log::trace!("deregistering {:?}: {}", token, e);
    }

    if entry.cancelled {
        log::trace!("discarding result of cancelled send {:?}", token);
        return;
    }

    outbox.push((
        entry.registration.destination.clone(),
        Delivery {
            query: entry.registration.query,
            send: SendId(token.0 as u64),
            result,
        },
    ));
}

/// Everything a ready socket had to offer
#[derive(Default)]
struct Received {
    messages: Vec<Vec<u8>>,
    error: Option<io::Error>,
}

fn service(connection: &mut Connection, buf: &mut [u8]) -> Received {
    let mut received = Received::default();

    match connection {
        Connection::Udp(socket) => loop {
            match socket.recv(buf) {
                Ok(len) => received.messages.push(buf[..len].to_vec()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    received.error = Some(e);
                    break;
                }
            }
        },
        Connection::Tcp { stream, incoming } => {
            let mut closed = false;
            loop {
                match stream.read(buf) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(len) => incoming.extend_from_slice(&buf[..len]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        received.error = Some(e);
                        break;
                    }
                }
            }

            received.messages = split_frames(incoming);
            if closed && received.messages.is_empty() && received.error.is_none() {
                received.error = Some(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before a response arrived",
                ));
            }
        }
    }

    received
}

struct EventLoop {
    shared: Arc<Mutex<Inner>>,
    poll: Poll,
    events: Events,
    buf: Vec<u8>,
    tick_interval: Duration,
    idle_iterations: u32,
    next_tick: Instant,
    idle: u32,
}

impl EventLoop {
    fn run(mut self) {
        while let Some(bound) = self.prepare() {
            if let Err(e) = self.poll.poll(&mut self.events, Some(bound)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::error!("multiplexer poll failed: {}", e);
                }
            }

            let delivered = self.handle_events() + self.expire();

            let now = Instant::now();
            if delivered > 0 || now >= self.next_tick {
                self.next_tick = now + self.tick_interval;
                self.tick();
            }

            if self.should_exit() {
                log::debug!("multiplexer loop idle, exiting");
                return;
            }
        }
    }

    /// Adds new registrations to the poll and works out how long the next
    /// wait may take. `None` means the loop has been told to stop.
    fn prepare(&mut self) -> Option<Duration> {
        let mut outbox = Outbox::new();
        let bound = {
            let mut inner = self.shared.lock();
            if inner.status == Status::Stopping {
                drop(inner);
                self.shutdown();
                return None;
            }

            let registry = self.poll.registry();
            let added: Vec<Token> = inner.added.drain(..).collect();
            for token in added {
                let failed = match inner.entries.get_mut(&token) {
                    Some(entry) => registry
                        .register(entry.registration.connection.source(), token, Interest::READABLE)
                        .err(),
                    None => None,
                };
                if let Some(e) = failed {
                    finish(&mut inner, registry, token, Err(e.into()), &mut outbox);
                }
            }

            let now = Instant::now();
            let tick = self.next_tick.saturating_duration_since(now);
            inner
                .entries
                .values()
                .map(|entry| entry.deadline.saturating_duration_since(now))
                .fold(tick, Duration::min)
        };
        post(outbox);

        Some(bound)
    }

    fn handle_events(&mut self) -> usize {
        let ready: Vec<Token> = self
            .events
            .iter()
            .map(|event| event.token())
            .filter(|token| *token != WAKER)
            .collect();
        if ready.is_empty() {
            return 0;
        }

        let mut arrivals = Vec::new();
        {
            let mut inner = self.shared.lock();
            for token in ready {
                if let Some(entry) = inner.entries.get_mut(&token) {
                    let received = service(&mut entry.registration.connection, &mut self.buf);
                    if !received.messages.is_empty() || received.error.is_some() {
                        arrivals.push((token, Matcher::new(&entry.registration), received));
                    }
                }
            }
        }

        // entries are only removed by this thread, so they are all still
        // there once the lock is taken again
        let mut results = Vec::new();
        for (token, matcher, received) in arrivals {
            let answer = received
                .messages
                .iter()
                .find_map(|bytes| matcher.examine(bytes));
            let result = match (answer, received.error) {
                (Some(result), _) => result,
                (None, Some(e)) => Err(e.into()),
                (None, None) => continue,
            };
            results.push((token, result));
        }

        let mut outbox = Outbox::new();
        {
            let mut inner = self.shared.lock();
            let registry = self.poll.registry();
            for (token, result) in results {
                finish(&mut inner, registry, token, result, &mut outbox);
            }
        }
        post(outbox)
    }

    fn expire(&mut self) -> usize {
        let mut outbox = Outbox::new();
        {
            let mut inner = self.shared.lock();
            let now = Instant::now();
            let expired: Vec<(Token, Duration)> = inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(token, entry)| (*token, entry.registration.timeout))
                .collect();

            let registry = self.poll.registry();
            for (token, timeout) in expired {
                log::debug!("send {:?} timed out after {:?}", token, timeout);
                finish(
                    &mut inner,
                    registry,
                    token,
                    Err(ResolveError::PacketTimeout { timeout }),
                    &mut outbox,
                );
            }
        }
        post(outbox)
    }

    fn tick(&self) {
        let observers = self.shared.lock().live_observers();
        for observer in observers {
            observer.tick();
        }
    }

    fn should_exit(&mut self) -> bool {
        let mut inner = self.shared.lock();
        if inner.entries.is_empty() && inner.added.is_empty() && inner.live_observers().is_empty()
        {
            self.idle += 1;
        } else {
            self.idle = 0;
        }

        if self.idle < self.idle_iterations || inner.status != Status::Running {
            return false;
        }

        inner.status = Status::Idle;
        inner.waker = None;
        inner.thread = None;
        true
    }

    fn shutdown(&mut self) {
        let mut outbox = Outbox::new();
        {
            let mut inner = self.shared.lock();
            let registry = self.poll.registry();
            let tokens: Vec<Token> = inner.entries.keys().copied().collect();
            for token in tokens {
                finish(
                    &mut inner,
                    registry,
                    token,
                    Err(ResolveError::Shutdown),
                    &mut outbox,
                );
            }
            inner.added.clear();
            inner.waker = None;
            inner.status = Status::Stopped;
        }
        post(outbox);
        self.tick();
        log::debug!("multiplexer loop stopped");
    }
}
