//! multi nameserver resolver
//!
//! Every logical query gets a timeline of sends computed up front: the
//! first round spreads the nameservers over `retry_delay`, later rounds
//! start after an exponentially growing delay and spread the nameservers
//! again. The scheduler is ticked by the multiplexer, fires the sends that
//! have come due and collects their outcomes until one of them settles the
//! query.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use derive_more::Display;
use parking_lot::Mutex;

use crate::dns::cache::SynchronizedCache;
use crate::dns::config::{ConfigError, ResolverConfig};
use crate::dns::errors::{ErrorKind, ResolveError};
use crate::dns::multiplexer::{Delivery, Multiplexer, Protocol, QueryId, SendId, TickObserver};
use crate::dns::protocol::{DnsPacket, ResponseClass};
use crate::dns::query_type::{DnsClass, QueryType};
use crate::dns::transport::Transport;
use crate::dns::validator::Validator;

type Result<T> = std::result::Result<T, ResolveError>;

/// Final outcome of a logical query
#[derive(Debug)]
pub struct Response {
    pub id: QueryId,
    pub result: Result<DnsPacket>,
}

/// One planned send of a query to a nameserver
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScheduledSend {
    pub at: Instant,
    /// Index into the nameserver list
    pub server: usize,
    pub round: u32,
}

/// Plans every send of a query starting at `start`, ordered by time.
///
/// Round 0 sends to nameserver `i` at `i * retry_delay / n`. Round `r`
/// starts at `retry_delay * 2^r` and spreads the nameservers by the
/// original `retry_delay / n`, not by the doubled delay. Rounds that would
/// start beyond the range of `Instant` are left out.
pub fn generate_timeouts(
    start: Instant,
    servers: usize,
    retry_times: u32,
    retry_delay: Duration,
) -> Vec<ScheduledSend> {
    let mut timeouts = Vec::new();
    if servers == 0 {
        return timeouts;
    }

    let mut round_delay = Some(retry_delay);
    'rounds: for round in 0..retry_times {
        let round_start = match round {
            0 => Some(start),
            _ => {
                round_delay = round_delay.and_then(|delay| delay.checked_mul(2));
                round_delay.and_then(|delay| start.checked_add(delay))
            }
        };
        let round_start = match round_start {
            Some(round_start) => round_start,
            None => break,
        };

        for server in 0..servers {
            let offset = retry_delay.mul_f64(server as f64 / servers as f64);
            match round_start.checked_add(offset) {
                Some(at) => timeouts.push(ScheduledSend { at, server, round }),
                None => break 'rounds,
            }
        }
    }

    timeouts.sort_by_key(|send| (send.at, send.server));
    timeouts
}

/// Where a logical query stands
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum QueryPhase {
    #[display(fmt = "scheduled")]
    Scheduled,
    #[display(fmt = "sending round {}", _0)]
    Sending(u32),
    #[display(fmt = "awaiting any answer")]
    AwaitingAny,
    #[display(fmt = "retrying")]
    Retrying,
}

struct Outstanding {
    server: usize,
    protocol: Protocol,
}

struct PendingQuery {
    id: QueryId,
    message: DnsPacket,
    destination: Sender<Response>,
    schedule: VecDeque<ScheduledSend>,
    outstanding: HashMap<SendId, Outstanding>,
    dropped: Vec<bool>,
    deadline: Option<Instant>,
    best_error: Option<ResolveError>,
    phase: QueryPhase,
    round: u32,
}

impl PendingQuery {
    fn set_phase(&mut self, phase: QueryPhase) {
        if self.phase != phase {
            log::trace!("query {}: {} -> {}", self.id, self.phase, phase);
            self.phase = phase;
        }
    }

    fn drop_server(&mut self, server: usize) {
        if !self.dropped[server] {
            log::debug!("query {}: dropping nameserver {}", self.id, server);
            self.dropped[server] = true;
        }
        let dropped = &self.dropped;
        self.schedule.retain(|send| !dropped[send.server]);
    }

    /// Keeps the most telling error; later errors win ties
    fn note_error(&mut self, err: ResolveError) {
        let better = match &self.best_error {
            Some(best) => err.severity() >= best.severity(),
            None => true,
        };
        if better {
            self.best_error = Some(err);
        }
    }

    fn exhausted(&self) -> bool {
        self.outstanding.is_empty() && self.schedule.is_empty()
    }
}

struct Scheduler {
    transports: Vec<Transport>,
    mux: Arc<Multiplexer>,
    retry_times: u32,
    retry_delay: Duration,
    query_timeout: Duration,
    drop_server_on_timeout: bool,
    no_tcp: bool,
    validator: Option<Arc<dyn Validator>>,
    cache: Option<Arc<SynchronizedCache>>,
    deliveries_tx: Sender<Delivery>,
    deliveries_rx: Mutex<Receiver<Delivery>>,
    queries: Mutex<HashMap<QueryId, PendingQuery>>,
    next_id: AtomicU64,
    me: Weak<Scheduler>,
}

type Outbox = Vec<(Sender<Response>, Response)>;

fn post(outbox: Outbox) {
    for (destination, response) in outbox {
        if destination.send(response).is_err() {
            log::debug!("response dropped, receiver is gone");
        }
    }
}

impl Scheduler {
    fn observer(&self) -> Weak<dyn TickObserver> {
        self.me.clone()
    }

    fn generate_timeouts(&self, start: Instant) -> Vec<ScheduledSend> {
        generate_timeouts(start, self.transports.len(), self.retry_times, self.retry_delay)
    }

    fn send_async(
        &self,
        message: &DnsPacket,
        destination: &Sender<Response>,
        id: Option<QueryId>,
    ) -> Result<QueryId> {
        let mut outbox = Outbox::new();
        let id = {
            let mut queries = self.queries.lock();
            let id = match id {
                Some(id) if queries.contains_key(&id) => {
                    return Err(ResolveError::DuplicateQueryId { id })
                }
                Some(id) => id,
                // skip ids a caller picked for a query still in progress
                None => loop {
                    let id = QueryId(self.next_id.fetch_add(1, Ordering::Relaxed));
                    if !queries.contains_key(&id) {
                        break id;
                    }
                },
            };

            if let Some(result) = self.lookup_cache(message) {
                log::debug!("query {} answered from cache", id);
                outbox.push((destination.clone(), Response { id, result }));
            } else if self.transports.is_empty() {
                outbox.push((
                    destination.clone(),
                    Response {
                        id,
                        result: Err(ResolveError::NoNameservers),
                    },
                ));
            } else {
                let start = Instant::now();
                let mut query = PendingQuery {
                    id,
                    message: message.clone(),
                    destination: destination.clone(),
                    schedule: self.generate_timeouts(start).into(),
                    outstanding: HashMap::new(),
                    dropped: vec![false; self.transports.len()],
                    // a deadline beyond the range of Instant never fires
                    deadline: if self.query_timeout.is_zero() {
                        None
                    } else {
                        start.checked_add(self.query_timeout)
                    },
                    best_error: None,
                    phase: QueryPhase::Scheduled,
                    round: 0,
                };

                let first = queries.is_empty();
                if first {
                    if let Err(e) = self.mux.add_observer(self.observer()) {
                        query.note_error(e);
                        query.schedule.clear();
                    }
                }

                match self.advance(&mut query, start) {
                    Some(result) => outbox.push(self.finalize(query, result)),
                    None => {
                        queries.insert(id, query);
                    }
                }

                if queries.is_empty() && first {
                    self.mux.remove_observer(&self.observer());
                }
            }
            id
        };
        post(outbox);

        Ok(id)
    }

    fn lookup_cache(&self, message: &DnsPacket) -> Option<Result<DnsPacket>> {
        let cache = self.cache.as_ref()?;
        let question = message.questions.first()?;
        let mut packet = cache.lookup(question)?;
        packet.header.id = message.header.id;
        Some(ResolveError::check_response(packet))
    }

    /// Fires the sends that are due and decides whether the query is
    /// over. Returns the final result if it is.
    fn advance(&self, query: &mut PendingQuery, now: Instant) -> Option<Result<DnsPacket>> {
        if let Some(deadline) = query.deadline {
            if now >= deadline {
                log::debug!("query {} hit its deadline", query.id);
                return Some(Err(ResolveError::QueryTimeout {
                    timeout: self.query_timeout,
                }));
            }
        }

        while let Some(next) = query.schedule.front().copied() {
            if next.at > now {
                break;
            }
            query.schedule.pop_front();
            if query.dropped[next.server] {
                continue;
            }

            query.round = next.round;
            query.set_phase(QueryPhase::Sending(next.round));
            if let Some(result) = self.fire(query, next.server, Protocol::Udp) {
                return Some(result);
            }
        }

        if query.exhausted() {
            return Some(Err(query
                .best_error
                .take()
                .unwrap_or(ResolveError::NoNameservers)));
        }

        match query.schedule.front() {
            Some(next) if next.round > query.round && query.outstanding.is_empty() => {
                query.set_phase(QueryPhase::Retrying)
            }
            _ => query.set_phase(QueryPhase::AwaitingAny),
        }

        None
    }

    /// Sends the query to one nameserver. A failure to send counts like a
    /// failed answer from that nameserver.
    fn fire(
        &self,
        query: &mut PendingQuery,
        server: usize,
        protocol: Protocol,
    ) -> Option<Result<DnsPacket>> {
        let transport = &self.transports[server];
        let sent = match protocol {
            Protocol::Udp => transport.send(&query.message, &self.deliveries_tx, query.id),
            Protocol::Tcp => transport.send_tcp(&query.message, &self.deliveries_tx, query.id),
        };

        match sent {
            Ok(send) => {
                query
                    .outstanding
                    .insert(send, Outstanding { server, protocol });
                None
            }
            Err(e) => {
                log::warn!(
                    "query {}: sending to {} failed: {}",
                    query.id,
                    transport.server(),
                    e
                );
                self.server_failed(query, server, e)
            }
        }
    }

    /// Applies what one nameserver's failure means for the query
    fn server_failed(
        &self,
        query: &mut PendingQuery,
        server: usize,
        err: ResolveError,
    ) -> Option<Result<DnsPacket>> {
        match err.kind() {
            ErrorKind::NxDomain | ErrorKind::Shutdown => return Some(Err(err)),
            // process wide, not the nameserver's fault
            ErrorKind::ResourceExhausted => {}
            ErrorKind::PacketTimeout if !self.drop_server_on_timeout => {}
            _ => query.drop_server(server),
        }
        query.note_error(err);
        None
    }

    fn handle_delivery(
        &self,
        query: &mut PendingQuery,
        send: SendId,
        result: Result<DnsPacket>,
    ) -> Option<Result<DnsPacket>> {
        let outstanding = query.outstanding.remove(&send)?;

        match result {
            Ok(packet) => match packet.classify() {
                ResponseClass::Success => Some(Ok(packet)),
                _ => match ResolveError::check_response(packet) {
                    Err(err) => self.server_failed(query, outstanding.server, err),
                    Ok(packet) => Some(Ok(packet)),
                },
            },
            Err(ResolveError::Truncated { response })
                if outstanding.protocol == Protocol::Udp && !self.no_tcp =>
            {
                log::debug!(
                    "query {}: truncated answer from {}, resending over TCP",
                    query.id,
                    self.transports[outstanding.server].server()
                );
                query.note_error(ResolveError::Truncated { response });
                self.fire(query, outstanding.server, Protocol::Tcp)
            }
            Err(err) => {
                log::debug!(
                    "query {}: nameserver {} failed: {}",
                    query.id,
                    self.transports[outstanding.server].server(),
                    err
                );
                self.server_failed(query, outstanding.server, err)
            }
        }
    }

    /// Cancels whatever is still in flight and builds the response for the
    /// caller
    fn finalize(&self, query: PendingQuery, result: Result<DnsPacket>) -> (Sender<Response>, Response) {
        for send in query.outstanding.keys() {
            self.mux.cancel(*send);
        }

        let result = result.map(|mut packet| {
            if let Some(validator) = &self.validator {
                packet.security_level = validator.validate(&packet);
            }
            packet
        });

        if let Some(cache) = &self.cache {
            let stored = match &result {
                Ok(packet) => cache.store(packet),
                Err(ResolveError::NxDomain { response }) => cache.store(response),
                Err(_) => Ok(()),
            };
            if let Err(e) = stored {
                log::warn!("failed to cache answer: {}", e);
            }
        }

        match &result {
            Ok(packet) => log::debug!(
                "query {} resolved by {:?}",
                query.id,
                packet.answer_from
            ),
            Err(e) => log::debug!("query {} failed: {}", query.id, e),
        }

        (
            query.destination,
            Response {
                id: query.id,
                result,
            },
        )
    }

    fn process(&self) {
        let mut outbox = Outbox::new();
        {
            let mut queries = self.queries.lock();

            // the deadline is hard: an answer that is only picked up once it
            // has passed does not count
            let now = Instant::now();
            let overdue: Vec<QueryId> = queries
                .values()
                .filter(|query| query.deadline.map_or(false, |deadline| now >= deadline))
                .map(|query| query.id)
                .collect();
            for id in overdue {
                if let Some(query) = queries.remove(&id) {
                    log::debug!("query {} hit its deadline", id);
                    let timeout = ResolveError::QueryTimeout {
                        timeout: self.query_timeout,
                    };
                    outbox.push(self.finalize(query, Err(timeout)));
                }
            }

            let deliveries: Vec<Delivery> = self.deliveries_rx.lock().try_iter().collect();
            for delivery in deliveries {
                let outcome = match queries.get_mut(&delivery.query) {
                    Some(query) => self.handle_delivery(query, delivery.send, delivery.result),
                    None => {
                        log::trace!("late delivery for query {}", delivery.query);
                        continue;
                    }
                };
                if let Some(result) = outcome {
                    if let Some(query) = queries.remove(&delivery.query) {
                        outbox.push(self.finalize(query, result));
                    }
                }
            }

            let now = Instant::now();
            let finished: Vec<(QueryId, Result<DnsPacket>)> = queries
                .values_mut()
                .filter_map(|query| self.advance(query, now).map(|result| (query.id, result)))
                .collect();
            for (id, result) in finished {
                if let Some(query) = queries.remove(&id) {
                    outbox.push(self.finalize(query, result));
                }
            }

            if queries.is_empty() {
                self.mux.remove_observer(&self.observer());
            }
        }
        post(outbox);
    }

    fn phase(&self, id: QueryId) -> Option<QueryPhase> {
        self.queries.lock().get(&id).map(|query| query.phase)
    }

    fn close(&self) {
        let mut outbox = Outbox::new();
        {
            let mut queries = self.queries.lock();
            for (_, query) in queries.drain() {
                outbox.push(self.finalize(query, Err(ResolveError::Shutdown)));
            }
            self.mux.remove_observer(&self.observer());
        }
        post(outbox);
    }
}

impl TickObserver for Scheduler {
    fn tick(&self) {
        self.process();
    }
}

pub struct ResolverBuilder {
    config: ResolverConfig,
    mux: Option<Arc<Multiplexer>>,
    validator: Option<Arc<dyn Validator>>,
    cache: Option<Arc<SynchronizedCache>>,
}

impl ResolverBuilder {
    /// Sends through a multiplexer shared with other resolvers
    pub fn multiplexer(mut self, mux: Arc<Multiplexer>) -> ResolverBuilder {
        self.mux = Some(mux);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> ResolverBuilder {
        self.validator = Some(validator);
        self
    }

    pub fn cache(mut self, cache: Arc<SynchronizedCache>) -> ResolverBuilder {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> std::result::Result<Resolver, ConfigError> {
        let config = self.config;
        let mux = self
            .mux
            .unwrap_or_else(|| Arc::new(Multiplexer::new(config.multiplexer.clone())));
        let cache = match self.cache {
            Some(cache) => Some(cache),
            None if config.do_caching => Some(Arc::new(SynchronizedCache::new())),
            None => None,
        };

        let transports = config
            .transport_configs()?
            .into_iter()
            .map(|transport| Transport::new(transport, mux.clone()))
            .collect();

        let (deliveries_tx, deliveries_rx) = channel();
        let scheduler = Arc::new_cyclic(|me| Scheduler {
            transports,
            mux: mux.clone(),
            retry_times: config.retry_times,
            retry_delay: config.retry_delay,
            query_timeout: config.query_timeout,
            drop_server_on_timeout: config.drop_server_on_timeout,
            no_tcp: config.no_tcp,
            validator: self.validator,
            cache,
            deliveries_tx,
            deliveries_rx: Mutex::new(deliveries_rx),
            queries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            me: me.clone(),
        });

        Ok(Resolver {
            config,
            mux,
            scheduler,
        })
    }
}

/// Sends queries to a list of nameservers, retrying as configured
pub struct Resolver {
    config: ResolverConfig,
    mux: Arc<Multiplexer>,
    scheduler: Arc<Scheduler>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> std::result::Result<Resolver, ConfigError> {
        Resolver::builder(config).build()
    }

    pub fn with_multiplexer(
        config: ResolverConfig,
        mux: Arc<Multiplexer>,
    ) -> std::result::Result<Resolver, ConfigError> {
        Resolver::builder(config).multiplexer(mux).build()
    }

    pub fn builder(config: ResolverConfig) -> ResolverBuilder {
        ResolverBuilder {
            config,
            mux: None,
            validator: None,
            cache: None,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    pub fn cache(&self) -> Option<&Arc<SynchronizedCache>> {
        self.scheduler.cache.as_ref()
    }

    /// The send timeline a query started at `start` would follow
    pub fn generate_timeouts(&self, start: Instant) -> Vec<ScheduledSend> {
        self.scheduler.generate_timeouts(start)
    }

    /// Starts resolving `message` and returns at once. Exactly one
    /// `Response` carrying the returned id will be posted to `destination`.
    ///
    /// Fails only when `id` is already in use by a query in progress.
    pub fn send_async(
        &self,
        message: &DnsPacket,
        destination: &Sender<Response>,
        id: Option<QueryId>,
    ) -> Result<QueryId> {
        self.scheduler.send_async(message, destination, id)
    }

    /// Resolves `message`, blocking until the final result
    pub fn send_message(&self, message: &DnsPacket) -> Result<DnsPacket> {
        let (tx, rx) = channel();
        let id = self.send_async(message, &tx, None)?;

        match rx.recv() {
            Ok(response) if response.id == id => response.result,
            Ok(response) => {
                log::error!("expected response for query {}, got {}", id, response.id);
                Err(ResolveError::Shutdown)
            }
            Err(_) => Err(ResolveError::Shutdown),
        }
    }

    pub fn query(&self, name: &str, qtype: QueryType, qclass: DnsClass) -> Result<DnsPacket> {
        self.send_message(&DnsPacket::query(name, qtype, qclass))
    }

    /// Where a query in progress stands, `None` once it is over
    pub fn phase(&self, id: QueryId) -> Option<QueryPhase> {
        self.scheduler.phase(id)
    }

    /// Abandons every query in progress; each one receives
    /// `ResolveError::Shutdown`
    pub fn close(&self) {
        self.scheduler.close();
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::net::{IpAddr, UdpSocket};

    fn offsets(start: Instant, timeouts: &[ScheduledSend]) -> Vec<(f64, usize, u32)> {
        timeouts
            .iter()
            .map(|send| {
                (
                    (send.at - start).as_secs_f64(),
                    send.server,
                    send.round,
                )
            })
            .collect()
    }

    #[test]
    fn test_fan_out_spacing() {
        let start = Instant::now();
        let timeouts = generate_timeouts(start, 2, 3, Duration::from_secs(5));

        assert_eq!(
            vec![
                (0.0, 0, 0),
                (2.5, 1, 0),
                (10.0, 0, 1),
                (12.5, 1, 1),
                (20.0, 0, 2),
                (22.5, 1, 2),
            ],
            offsets(start, &timeouts)
        );
    }

    #[test]
    fn test_later_rounds_keep_original_spacing() {
        let start = Instant::now();
        let timeouts = generate_timeouts(start, 4, 3, Duration::from_secs(4));

        let round2: Vec<f64> = offsets(start, &timeouts)
            .into_iter()
            .filter(|(_, _, round)| *round == 2)
            .map(|(at, _, _)| at)
            .collect();
        assert_eq!(vec![16.0, 17.0, 18.0, 19.0], round2);
    }

    #[test]
    fn test_schedule_edges() {
        let start = Instant::now();
        assert!(generate_timeouts(start, 0, 4, Duration::from_secs(5)).is_empty());

        let single = generate_timeouts(start, 1, 1, Duration::from_secs(5));
        assert_eq!(vec![(0.0, 0, 0)], offsets(start, &single));
    }

    #[test]
    fn test_schedule_ends_where_time_runs_out() {
        let start = Instant::now();
        let timeouts = generate_timeouts(start, 2, 70, Duration::from_secs(5));

        // how far an Instant reaches depends on the platform
        assert!(timeouts.len() >= 2 * 20);
        assert!(timeouts.len() < 2 * 70);
        assert!(timeouts.windows(2).all(|pair| pair[0].at <= pair[1].at));
        assert_eq!((0.0, 0, 0), offsets(start, &timeouts[..1])[0]);
    }

    /// A silent nameserver on the loopback and a resolver pointing at it
    fn silent_resolver(configure: impl FnOnce(&mut ResolverConfig)) -> (Resolver, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let mut config = ResolverConfig::with_nameservers(vec![addr.ip()]);
        config.port = addr.port();
        configure(&mut config);
        (Resolver::new(config).unwrap(), server)
    }

    #[test]
    fn test_unreachable_query_deadline_is_ignored() {
        let (resolver, _server) = silent_resolver(|config| {
            config.retry_times = 64;
            config.query_timeout = Duration::MAX;
        });

        let (tx, rx) = channel();
        let query = DnsPacket::query("example.com", QueryType::A, DnsClass::In);
        let id = resolver.send_async(&query, &tx, None).unwrap();
        assert!(resolver.phase(id).is_some());

        resolver.close();
        let response = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(response.result, Err(ResolveError::Shutdown)));
    }

    #[test]
    fn test_generated_ids_skip_ids_in_use() {
        let (resolver, _server) = silent_resolver(|_| {});

        let (tx, _rx) = channel();
        let query = DnsPacket::query("example.com", QueryType::A, DnsClass::In);
        // the first generated id would be 1
        resolver.send_async(&query, &tx, Some(QueryId(1))).unwrap();

        let id = resolver.send_async(&query, &tx, None).unwrap();
        assert_ne!(QueryId(1), id);
        assert!(resolver.phase(id).is_some());
        resolver.close();
    }

    /// A query planned against two nameservers that are never contacted
    fn planned(resolver: &Resolver) -> PendingQuery {
        let (destination, _) = channel();
        PendingQuery {
            id: QueryId(1),
            message: DnsPacket::query("example.com", QueryType::A, DnsClass::In),
            destination,
            schedule: resolver.generate_timeouts(Instant::now()).into(),
            outstanding: HashMap::new(),
            dropped: vec![false; 2],
            deadline: None,
            best_error: None,
            phase: QueryPhase::Scheduled,
            round: 0,
        }
    }

    fn two_nameservers() -> Resolver {
        let mut config = ResolverConfig::with_nameservers(vec![
            IpAddr::from([192, 0, 2, 1]),
            IpAddr::from([192, 0, 2, 2]),
        ]);
        config.retry_times = 3;
        Resolver::new(config).unwrap()
    }

    #[test]
    fn test_resource_exhaustion_keeps_the_nameserver() {
        let resolver = two_nameservers();
        let mut query = planned(&resolver);

        let err = ResolveError::from(io::Error::from_raw_os_error(libc::EMFILE));
        assert_eq!(ErrorKind::ResourceExhausted, err.kind());
        assert!(resolver.scheduler.server_failed(&mut query, 0, err).is_none());

        assert!(!query.dropped[0]);
        assert_eq!(3, query.schedule.iter().filter(|send| send.server == 0).count());
        assert_eq!(
            Some(ErrorKind::ResourceExhausted),
            query.best_error.as_ref().map(ResolveError::kind)
        );
    }

    #[test]
    fn test_io_error_drops_the_nameserver() {
        let resolver = two_nameservers();
        let mut query = planned(&resolver);

        let err = ResolveError::from(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert_eq!(ErrorKind::Io, err.kind());
        assert!(resolver.scheduler.server_failed(&mut query, 0, err).is_none());

        assert!(query.dropped[0]);
        assert!(!query.dropped[1]);
        assert_eq!(3, query.schedule.len());
        assert!(query.schedule.iter().all(|send| send.server == 1));
    }

    #[test]
    fn test_no_nameservers() {
        let resolver = Resolver::new(ResolverConfig::default()).unwrap();
        let err = resolver
            .query("example.com", QueryType::A, DnsClass::In)
            .unwrap_err();
        assert_eq!(ErrorKind::NoNameservers, err.kind());
    }

    #[test]
    fn test_duplicate_query_id() {
        // a server that never answers keeps the first query pending
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let mut config = ResolverConfig::with_nameservers(vec![addr.ip()]);
        config.port = addr.port();
        config.retry_times = 1;
        config.packet_timeout = Duration::from_secs(5);
        let resolver = Resolver::new(config).unwrap();

        let (tx, rx) = channel();
        let query = DnsPacket::query("example.com", QueryType::A, DnsClass::In);
        let id = resolver.send_async(&query, &tx, Some(QueryId(42))).unwrap();
        assert_eq!(QueryId(42), id);
        assert!(resolver.phase(id).is_some());

        let err = resolver
            .send_async(&query, &tx, Some(QueryId(42)))
            .unwrap_err();
        assert_eq!(ErrorKind::DuplicateQueryId, err.kind());

        resolver.close();
        let response = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(QueryId(42), response.id);
        assert!(matches!(response.result, Err(ResolveError::Shutdown)));
        assert!(resolver.phase(id).is_none());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_shared_multiplexer_refuses_after_stop() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();

        let mux = Arc::new(Multiplexer::new(Default::default()));
        let mut config = ResolverConfig::with_nameservers(vec![addr.ip()]);
        config.port = addr.port();
        let resolver = Resolver::with_multiplexer(config, mux.clone()).unwrap();

        mux.stop();
        let err = resolver
            .query("example.com", QueryType::A, DnsClass::In)
            .unwrap_err();
        assert_eq!(ErrorKind::Shutdown, err.kind());
    }
}
