//! Client side of ONC RPC version 2 (RFC 5531) over TCP or UDP.
//!
//! The center of this module is [`RpcEngine`], a non-blocking state machine
//! that owns everything one connection needs and nothing it does not:
//!
//! 1. AUTH_UNIX credentials, encoded once per identity ([`auth`])
//! 2. Record marking and reassembly of the inbound stream ([`framer`])
//! 3. The FIFO of calls waiting for the socket, with resumable partial writes
//! 4. The bucketed table matching replies to calls by transaction id
//! 5. Timeouts, retransmissions and major timeouts, checked on every tick
//! 6. Connection lifecycle and the reconnect policy ([`connection`])
//!
//! The engine never touches a socket. A host (see `crate::client` for the
//! tokio one) reads and writes and tells the engine what happened. Each
//! engine belongs to one thread of control; sharing one needs external
//! locking.

pub mod auth;
pub mod connection;
mod correlation;
mod engine;
pub mod error;
pub mod framer;
mod outbound;
mod pdu;
mod stats;
mod supervisor;
mod xid;

pub use auth::{AuthUnix, CredentialCache};
pub use connection::{ConnectionState, ReconnectStep, Transport};
pub use engine::{decode_reply, RpcEngine};
pub use error::{AuthError, CallError, CallResult, FramingError, RejectReason, RpcError};
pub use framer::{write_record, Framer, FramerState};
pub use pdu::{CallHandle, Completion, PendingReply};
pub use stats::RpcStats;
pub use supervisor::TickReport;
pub use xid::XID_SALT_STRIDE;
