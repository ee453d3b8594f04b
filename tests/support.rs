#![allow(dead_code)]

use std::io::{self, Cursor, Write};
use std::net::SocketAddr;
use std::time::Duration;

use nfs_mamont_rpc::protocol::rpc::{write_record, Framer, Transport};
use nfs_mamont_rpc::xdr::rpc::{
    accept_body, accepted_reply, auth_stat, call_body, opaque_auth, rejected_reply, reply_body,
    rpc_body, rpc_msg, success_reply_message,
};
use nfs_mamont_rpc::xdr::{deserialize, Serialize};
use nfs_mamont_rpc::{ReconnectPolicy, RpcConfig, RpcEngine};

pub const PEER: &str = "127.0.0.1:2049";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub fn peer() -> SocketAddr {
    PEER.parse().expect("peer address")
}

pub fn test_config() -> RpcConfig {
    RpcConfig {
        timeout: Duration::from_secs(1),
        machine_name: "test-host".to_string(),
        uid: 1000,
        gid: 1000,
        groups: vec![10, 20],
        ..RpcConfig::default()
    }
}

/// Engine already connected over `transport`, numbering calls from
/// `first_xid`.
pub fn connected_engine(config: RpcConfig, first_xid: u32, transport: Transport) -> RpcEngine {
    init_logging();
    let mut engine = RpcEngine::with_xid(config, first_xid);
    engine.connect(peer(), transport).expect("connect");
    engine.on_connected(std::time::Instant::now()).expect("on_connected");
    engine
}

pub fn tcp_engine(first_xid: u32) -> RpcEngine {
    connected_engine(test_config(), first_xid, Transport::Tcp)
}

pub fn with_policy(policy: ReconnectPolicy) -> RpcConfig {
    RpcConfig { auto_reconnect: policy, ..test_config() }
}

fn encode(msg: &rpc_msg, results: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    msg.serialize(&mut buf).expect("serialize reply");
    buf.extend_from_slice(results);
    buf
}

/// Successful reply carrying `results`, without record marking.
pub fn reply_message(xid: u32, results: &[u8]) -> Vec<u8> {
    encode(&success_reply_message(xid), results)
}

pub fn accepted_message(xid: u32, reply_data: accept_body) -> Vec<u8> {
    let reply = reply_body::MSG_ACCEPTED(accepted_reply { verf: opaque_auth::default(), reply_data });
    encode(&rpc_msg { xid, body: rpc_body::REPLY(reply) }, &[])
}

pub fn auth_error_message(xid: u32, stat: auth_stat) -> Vec<u8> {
    let reply = reply_body::MSG_DENIED(rejected_reply::AUTH_ERROR(stat));
    encode(&rpc_msg { xid, body: rpc_body::REPLY(reply) }, &[])
}

/// `message` as a single record-marked fragment.
pub fn record(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    write_record(message, usize::MAX, &mut out);
    out
}

pub fn tcp_reply(xid: u32, results: &[u8]) -> Vec<u8> {
    record(&reply_message(xid, results))
}

/// A call as seen by a server.
#[derive(Debug)]
pub struct SeenCall {
    pub xid: u32,
    pub call: call_body,
    pub args: Vec<u8>,
}

pub fn parse_call(message: &[u8]) -> SeenCall {
    let mut cursor = Cursor::new(message);
    let msg: rpc_msg = deserialize(&mut cursor).expect("decode call");
    let call = match msg.body {
        rpc_body::CALL(call) => call,
        rpc_body::REPLY(_) => panic!("expected a call"),
    };
    let args = message[cursor.position() as usize..].to_vec();
    SeenCall { xid: msg.xid, call, args }
}

/// Splits record-marked bytes written by the engine into calls.
pub fn parse_calls(wire: &[u8]) -> Vec<SeenCall> {
    let mut framer = Framer::new(usize::MAX);
    let mut messages = Vec::new();
    framer.feed(wire, |m| messages.push(m)).expect("well formed stream");
    assert!(!framer.is_mid_message(), "stream ends mid-message");
    messages.iter().map(|m| parse_call(m)).collect()
}

/// Socket stand-in accepting at most `budget` bytes per `on_writable` round,
/// then reporting `WouldBlock`.
#[derive(Default)]
pub struct ThrottledWriter {
    pub written: Vec<u8>,
    pub budget: usize,
}

impl ThrottledWriter {
    pub fn new(budget: usize) -> Self {
        Self { written: Vec::new(), budget }
    }

    pub fn refill(&mut self, budget: usize) {
        self.budget = budget;
    }
}

impl Write for ThrottledWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.budget);
        self.written.extend_from_slice(&buf[..n]);
        self.budget -= n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
