//! Protocol module implements the client side of ONC RPC as used by NFS v3.
//!
//! It contains two components:
//!
//! - `xdr`: External Data Representation (XDR) for serialization and
//!   deserialization of RPC headers according to RFC 4506.
//!
//! - `rpc`: the RPC client engine: record marking, call correlation,
//!   timeouts and retransmission, reconnects and AUTH_UNIX credentials as
//!   defined in RFC 5531.

pub mod rpc;
pub mod xdr;
