//! The client engine: one per connection, driven by its host.
//!
//! The engine performs no I/O of its own and never blocks. The host owns the
//! socket and calls in on three kinds of events:
//!
//! - bytes arrived: [`RpcEngine::feed`]
//! - the socket can take more bytes: [`RpcEngine::on_writable`]
//! - the poll interval elapsed: [`RpcEngine::tick`]
//!
//! plus the connection events (`on_connected`, `on_connect_failed`,
//! `on_disconnected`). Every call submitted gets exactly one outcome through
//! its [`Completion`]: the decoded reply, or the reason it will never get one.
//!
//! A call lives in exactly one place at a time: the outbound queue until it
//! has been written in full, then the correlation table until its reply
//! arrives, it times out, or the connection is replaced.

use std::io::{self, Cursor, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, error, trace, warn};

use super::auth::{AuthUnix, CredentialCache};
use super::connection::{ConnectionManager, ConnectionState, ReconnectStep, Transport};
use super::correlation::CorrelationTable;
use super::error::{AuthError, CallError, CallResult, FramingError, RejectReason, RpcError};
use super::framer::Framer;
use super::outbound::OutboundQueue;
use super::pdu::{CallHandle, Completion, PendingReply, Pdu};
use super::stats::RpcStats;
use super::supervisor::{Supervisor, TickReport};
use super::xid::initial_xid;
use crate::config::{ReconnectPolicy, RpcConfig};
use crate::protocol::xdr::rpc::{
    accept_body, call_message, rejected_reply, reply_body, rpc_body, rpc_msg,
};
use crate::protocol::xdr::{deserialize, Serialize};

/// Client-side ONC RPC engine for one logical connection.
#[derive(Debug)]
pub struct RpcEngine {
    config: RpcConfig,
    identity: AuthUnix,
    connection: ConnectionManager,
    framer: Framer,
    outbound: OutboundQueue,
    table: CorrelationTable,
    credentials: CredentialCache,
    stats: RpcStats,
    next_xid: u32,
    next_seq: u64,
    last_response: Option<Instant>,
}

impl RpcEngine {
    pub fn new(config: RpcConfig) -> Self {
        Self::with_xid(config, initial_xid())
    }

    /// Engine whose first call travels under `first_xid`.
    pub fn with_xid(config: RpcConfig, first_xid: u32) -> Self {
        let identity = AuthUnix::new(
            config.machine_name.clone(),
            config.uid,
            config.gid,
            config.groups.clone(),
        );
        Self {
            identity,
            connection: ConnectionManager::new(config.auto_reconnect),
            framer: Framer::new(config.max_message_size),
            outbound: OutboundQueue::new(),
            table: CorrelationTable::new(config.hash_size),
            credentials: CredentialCache::new(),
            stats: RpcStats::default(),
            next_xid: first_xid,
            next_seq: 0,
            last_response: None,
            config,
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn transport(&self) -> Transport {
        self.connection.transport()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.connection.peer()
    }

    pub fn stats(&self) -> RpcStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = RpcStats::default();
    }

    /// Calls waiting to be written.
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// Calls written and waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    pub fn pending(&self) -> usize {
        self.queued() + self.in_flight()
    }

    /// Waiting calls per correlation bucket.
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.table.bucket_sizes()
    }

    /// When the last reply matching a call arrived.
    pub fn last_response(&self) -> Option<Instant> {
        self.last_response
    }

    /// Identity attached to calls submitted without one.
    pub fn identity(&self) -> &AuthUnix {
        &self.identity
    }

    /// How many times a credential had to be encoded.
    pub fn credential_builds(&self) -> u64 {
        self.credentials.builds()
    }

    /// Starts connecting to `peer`. The host opens the socket and reports
    /// back through [`on_connected`](Self::on_connected) or
    /// [`on_connect_failed`](Self::on_connect_failed).
    pub fn connect(&mut self, peer: SocketAddr, transport: Transport) -> Result<(), RpcError> {
        self.connection.begin_connect(peer, transport)
    }

    /// The socket is up. Calls that were sent on the previous connection and
    /// never answered go back to the head of the queue, oldest first.
    pub fn on_connected(&mut self, now: Instant) -> Result<(), RpcError> {
        self.connection.on_connected()?;
        self.framer.reset();
        self.outbound.reset_progress();

        let mut unanswered = self.table.drain_all();
        if !unanswered.is_empty() {
            debug!("requeueing {} unanswered calls", unanswered.len());
            for pdu in &mut unanswered {
                pdu.requeue(now);
            }
            self.stats.retransmitted += unanswered.len() as u64;
            self.outbound.requeue_front(unanswered);
        }
        Ok(())
    }

    pub fn on_connect_failed(&mut self, err: &io::Error) -> ReconnectStep {
        warn!("connect to {:?} failed: {}", self.peer(), err);
        self.handle_loss()
    }

    pub fn on_disconnected(&mut self) -> ReconnectStep {
        warn!("connection to {:?} lost", self.peer());
        self.handle_loss()
    }

    /// Drops a live connection as if it had failed.
    pub fn force_reconnect(&mut self) -> Result<ReconnectStep, RpcError> {
        match self.state() {
            ConnectionState::Connected => Ok(self.handle_loss()),
            state => Err(RpcError::InvalidState { state }),
        }
    }

    /// Fails every pending call with [`CallError::ConnectionLost`] and goes
    /// back to `Disconnected`.
    pub fn close(&mut self) {
        self.connection.close();
        self.framer.reset();
        self.fail_all(CallError::ConnectionLost);
    }

    fn handle_loss(&mut self) -> ReconnectStep {
        self.framer.reset();
        self.outbound.reset_progress();
        let step = self.connection.on_lost();
        match step {
            ReconnectStep::Retry(_) => self.stats.reconnects += 1,
            ReconnectStep::GiveUp => self.fail_all(CallError::ConnectionLost),
        }
        step
    }

    fn fail_all(&mut self, err: CallError) {
        let mut failed = self.table.drain_all();
        failed.extend(self.outbound.drain_all());
        if !failed.is_empty() {
            debug!("failing {} pending calls: {}", failed.len(), err);
        }
        for mut pdu in failed {
            pdu.complete(Err(err.clone()));
        }
    }

    /// Queues a call. `args` are the XDR-encoded procedure arguments; `auth`
    /// overrides the engine identity for this call only.
    ///
    /// A credential that cannot be encoded fails this call at once with
    /// [`CallError::Auth`]; nothing is queued.
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &mut self,
        prog: u32,
        vers: u32,
        proc: u32,
        args: &[u8],
        auth: Option<&AuthUnix>,
        completion: Completion,
        now: Instant,
    ) -> CallHandle {
        let xid = self.allocate_xid();
        let handle = CallHandle::new(xid);

        let credential = match auth {
            Some(identity) => self.credentials.get(identity),
            None => self.credentials.get(&self.identity),
        };
        let credential = match credential {
            Ok(credential) => credential,
            Err(e) => {
                warn!("xid {}: {}", xid, e);
                completion.complete(Err(CallError::Auth(e)));
                return handle;
            }
        };

        let mut message = Vec::with_capacity(64 + credential.body.len() + args.len());
        if let Err(e) = call_message(xid, prog, vers, proc, credential).serialize(&mut message) {
            completion.complete(Err(CallError::Auth(AuthError::Encode(e.to_string()))));
            return handle;
        }
        message.extend_from_slice(args);
        self.log_pdu("queued", xid, prog, proc, message.len());

        let seq = self.next_seq;
        self.next_seq += 1;
        self.outbound.push_back(Pdu::new(xid, seq, message, completion, now));
        handle
    }

    /// [`submit`](Self::submit) with a channel completion.
    pub fn submit_with_reply(
        &mut self,
        prog: u32,
        vers: u32,
        proc: u32,
        args: &[u8],
        auth: Option<&AuthUnix>,
        now: Instant,
    ) -> (CallHandle, PendingReply) {
        let (completion, reply) = Completion::channel();
        (self.submit(prog, vers, proc, args, auth, completion, now), reply)
    }

    fn allocate_xid(&mut self) -> u32 {
        loop {
            let xid = self.next_xid;
            self.next_xid = self.next_xid.wrapping_add(1);
            if !self.table.contains(xid) && !self.outbound.contains(xid) {
                return xid;
            }
        }
    }

    /// Completes the call with [`CallError::Cancelled`]. Returns false if the
    /// call already had its outcome.
    ///
    /// A call half written to the stream keeps its bytes until they are out,
    /// but its caller hears of the cancellation at once.
    pub fn cancel(&mut self, handle: CallHandle) -> bool {
        let xid = handle.xid();
        if let Some(mut pdu) = self.table.take(xid).or_else(|| self.outbound.remove(xid)) {
            debug!("xid {} cancelled", xid);
            return pdu.complete(Err(CallError::Cancelled));
        }
        match self.outbound.get_mut(xid) {
            Some(pdu) => {
                debug!("xid {} cancelled while being written", xid);
                pdu.complete(Err(CallError::Cancelled))
            }
            None => false,
        }
    }

    /// Whether the host should wait for the socket to become writable.
    pub fn wants_write(&self) -> bool {
        self.state() == ConnectionState::Connected && !self.outbound.is_empty()
    }

    /// Writes queued calls into `out` until it would block or the queue is
    /// empty. Returns how many calls went out in full.
    pub fn on_writable<W: Write>(&mut self, out: &mut W, now: Instant) -> Result<usize, RpcError> {
        if self.state() != ConnectionState::Connected {
            return Err(RpcError::InvalidState { state: self.state() });
        }

        let transport = self.transport();
        let mut sent = 0;
        loop {
            match self.outbound.write_head(out, transport) {
                Ok(Some(mut pdu)) => {
                    self.stats.requests_sent += 1;
                    sent += 1;
                    if pdu.is_abandoned() {
                        trace!("xid {} written after its caller gave up", pdu.xid);
                        continue;
                    }
                    self.log_pdu("sent", pdu.xid, 0, 0, pdu.message.len());
                    pdu.sent_at = Some(now);
                    self.table.insert(pdu);
                }
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(RpcError::Connection(e)),
            }
        }
        Ok(sent)
    }

    /// Hands received bytes to the engine. On TCP they are a slice of the
    /// stream; on UDP they must be one whole datagram. Returns how many
    /// complete messages they finished.
    ///
    /// A framing error fails every pending call with [`CallError::Framing`]
    /// and leaves the engine `Disconnected`, ready for a fresh connect.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> Result<usize, RpcError> {
        if self.transport() == Transport::Udp {
            if bytes.len() < 4 {
                debug!("discarding {} byte datagram", bytes.len());
                return Ok(0);
            }
            self.dispatch(bytes.to_vec(), now);
            return Ok(1);
        }

        let mut messages = Vec::new();
        let framed = self.framer.feed(bytes, |message| messages.push(message));
        let count = messages.len();
        for message in messages {
            self.dispatch(message, now);
        }

        if let Err(e) = framed {
            error!("closing connection to {:?}: {}", self.peer(), e);
            self.connection.close();
            self.framer.reset();
            self.fail_all(CallError::Framing(e.clone()));
            return Err(RpcError::Framing(e));
        }
        Ok(count)
    }

    fn dispatch(&mut self, message: Vec<u8>, now: Instant) {
        let xid = BigEndian::read_u32(&message[..4]);
        self.log_pdu("received", xid, 0, 0, message.len());

        if let Some(mut pdu) = self.table.take(xid).or_else(|| self.outbound.remove(xid)) {
            self.stats.responses_received += 1;
            self.last_response = Some(now);
            pdu.complete(decode_reply(message));
        } else if let Some(pdu) = self.outbound.get_mut(xid).filter(|p| !p.is_abandoned()) {
            self.stats.responses_received += 1;
            self.last_response = Some(now);
            pdu.complete(decode_reply(message));
        } else {
            debug!("no pending call for xid {}, discarding reply", xid);
        }
    }

    /// Runs the timeout scan. A major timeout on a TCP connection drops it
    /// when the reconnect policy allows reconnecting.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let supervisor = Supervisor { timeout: self.config.timeout, retrans: self.config.retrans };
        let mut report = supervisor.scan(&mut self.table, &mut self.outbound, &mut self.stats, now);

        if report.major_timeouts > 0
            && self.transport() == Transport::Tcp
            && self.connection.policy() != ReconnectPolicy::Never
            && self.state() == ConnectionState::Connected
        {
            warn!("major timeout on {:?}, forcing reconnect", self.peer());
            report.reconnect = Some(self.handle_loss());
        }
        report
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    pub fn set_retrans(&mut self, retrans: u32) {
        self.config.retrans = retrans;
    }

    pub fn set_auto_reconnect(&mut self, policy: impl Into<ReconnectPolicy>) {
        let policy = policy.into();
        self.config.auto_reconnect = policy;
        self.connection.set_policy(policy);
    }

    /// Rehashes waiting calls into `buckets` buckets.
    pub fn set_hash_size(&mut self, buckets: usize) -> Result<(), RpcError> {
        if buckets == 0 {
            return Err(RpcError::InvalidBucketCount);
        }
        if self.framer.is_mid_message() {
            return Err(RpcError::ReassemblyInProgress);
        }
        self.table.resize(buckets);
        self.config.hash_size = buckets;
        Ok(())
    }

    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.config.max_message_size = max_message_size;
        self.framer.set_max_message_size(max_message_size);
    }

    pub fn set_uid(&mut self, uid: u32) {
        self.config.uid = uid;
        self.identity.uid = uid;
    }

    pub fn set_gid(&mut self, gid: u32) {
        self.config.gid = gid;
        self.identity.gid = gid;
    }

    pub fn set_groups(&mut self, groups: Vec<u32>) {
        self.config.groups = groups.clone();
        self.identity.groups = groups;
    }

    pub fn set_machine_name(&mut self, machine_name: impl Into<String>) {
        let machine_name = machine_name.into();
        self.config.machine_name = machine_name.clone();
        self.identity.machine_name = machine_name;
    }

    pub fn set_debug(&mut self, level: u32) {
        self.config.debug = level;
    }

    fn log_pdu(&self, what: &str, xid: u32, prog: u32, proc: u32, len: usize) {
        if self.config.debug >= 2 {
            debug!(xid, prog, proc, len, "pdu {}", what);
        } else {
            trace!(xid, prog, proc, len, "pdu {}", what);
        }
    }
}

impl Drop for RpcEngine {
    fn drop(&mut self) {
        self.fail_all(CallError::ConnectionLost);
    }
}

/// Classifies a complete reply message. On success the bytes after the reply
/// header, i.e. the procedure results, are returned.
pub fn decode_reply(mut message: Vec<u8>) -> CallResult {
    let mut cursor = Cursor::new(&message[..]);
    let msg: rpc_msg = deserialize(&mut cursor)
        .map_err(|e| FramingError::MalformedReply(e.to_string()))?;
    let header_len = cursor.position() as usize;

    let reply = match msg.body {
        rpc_body::REPLY(reply) => reply,
        rpc_body::CALL(_) => {
            return Err(FramingError::MalformedReply(format!(
                "xid {} is a call, not a reply",
                msg.xid
            ))
            .into())
        }
    };

    match reply {
        reply_body::MSG_ACCEPTED(accepted) => match accepted.reply_data {
            accept_body::SUCCESS => {
                message.drain(..header_len);
                Ok(message)
            }
            accept_body::PROG_UNAVAIL => Err(RejectReason::ProgramUnavailable.into()),
            accept_body::PROG_MISMATCH(info) => Err(RejectReason::ProgramMismatch(info).into()),
            accept_body::PROC_UNAVAIL => Err(RejectReason::ProcedureUnavailable.into()),
            accept_body::GARBAGE_ARGS => Err(RejectReason::GarbageArgs.into()),
        },
        reply_body::MSG_DENIED(rejected_reply::RPC_MISMATCH(info)) => {
            Err(RejectReason::RpcMismatch(info).into())
        }
        reply_body::MSG_DENIED(rejected_reply::AUTH_ERROR(stat)) => {
            Err(AuthError::Rejected(stat).into())
        }
    }
}
