//! NFS Mamont RPC - the client transport of ONC RPC for NFS version 3
//!
//! This library sends RPC calls (RFC 5531) over TCP or UDP and hands back
//! their replies. It is the layer an NFS v3 or MOUNT client sits on: the
//! caller supplies XDR-encoded procedure arguments and gets XDR-encoded
//! results, or the reason there will be none.
//!
//! ## Main Components
//!
//! - `protocol::rpc`: [`RpcEngine`], a non-blocking state machine that
//!   frames, correlates, times out, retransmits and reconnects. It does no
//!   I/O itself; whoever owns the socket drives it.
//!
//! - `client`: [`RpcClient`], a tokio host for the engine that owns a TCP
//!   stream or UDP socket and serves it from a background task.
//!
//! - `config`: [`RpcConfig`] with defaults, the NFS preset and mount option
//!   parsing (`timeo`, `retrans`, `autoreconnect`, ...).
//!
//! - `protocol::xdr`: the XDR codec and the RPC message model, plus program
//!   and procedure numbers of NFS v3 and MOUNT v3.
//!
//! ## Guarantees
//!
//! Every submitted call completes exactly once: with the reply, or with a
//! timeout, connection loss, cancellation, authentication or framing error.
//!
//! ## Standards Compliance
//!
//! - RFC 5531: RPC: Remote Procedure Call Protocol Specification Version 2
//! - RFC 4506: XDR: External Data Representation Standard
//! - RFC 1813: NFS Version 3 Protocol Specification (program numbers only)

pub mod client;
pub mod config;
pub mod protocol;

pub use client::{RpcCaller, RpcClient};
pub use config::{ReconnectPolicy, RpcConfig};
pub use protocol::rpc::RpcEngine;
pub use protocol::xdr;
