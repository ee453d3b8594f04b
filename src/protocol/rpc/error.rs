//! Error taxonomy of the RPC client engine.
//!
//! Two scopes exist. [`RpcError`] is returned by engine entry points and
//! concerns the whole connection (socket failures, broken framing, calls made
//! in the wrong state). [`CallError`] is the terminal outcome of one call and
//! is only ever delivered through that call's completion.

use std::io;

use thiserror::Error;

use super::connection::ConnectionState;
use crate::protocol::xdr::rpc::{auth_stat, mismatch_info, MAX_AUTH_GROUPS, MAX_MACHINE_NAME_LEN};

/// Result delivered to the completion of every submitted call, exactly once.
pub type CallResult = Result<Vec<u8>, CallError>;

/// Engine-level failure.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The socket failed. The host should report it through
    /// `on_disconnected` so the reconnect policy can run.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// The inbound stream could not be framed. Every pending call has
    /// already been failed; the engine is reusable after a fresh connect.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// The operation does not apply in the current connection state.
    #[error("operation not valid while {state:?}")]
    InvalidState {
        /// State the engine was in.
        state: ConnectionState,
    },

    /// A correlation table needs at least one bucket.
    #[error("correlation bucket count must be at least 1")]
    InvalidBucketCount,

    /// Buckets cannot be rehashed while fragments of a reply are buffered.
    #[error("cannot resize correlation buckets while a message is being reassembled")]
    ReassemblyInProgress,
}

/// Inbound stream framing failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// A record marker declared more bytes than a message may hold.
    #[error("RPC record length {length} exceeds max {max}")]
    RecordTooLarge {
        /// Bytes of the message so far plus the declared fragment length.
        length: usize,
        /// Configured maximum message size.
        max: usize,
    },

    /// A complete message too short to carry a transaction id.
    #[error("RPC message of {0} bytes has no transaction id")]
    ShortMessage(usize),

    /// The reply header after the xid could not be decoded.
    #[error("malformed RPC reply: {0}")]
    MalformedReply(String),
}

/// Credential construction failure, or a server-side authentication refusal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("machine name of {0} bytes exceeds {MAX_MACHINE_NAME_LEN}")]
    MachineNameTooLong(usize),

    #[error("{0} supplementary groups exceed {MAX_AUTH_GROUPS}")]
    TooManyGroups(usize),

    #[error("cannot encode credential: {0}")]
    Encode(String),

    #[error("server rejected credentials: {0:?}")]
    Rejected(auth_stat),
}

/// Why a server refused to run an otherwise delivered call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("program unavailable")]
    ProgramUnavailable,

    #[error("program version mismatch (supported {}..={})", .0.low, .0.high)]
    ProgramMismatch(mismatch_info),

    #[error("procedure unavailable")]
    ProcedureUnavailable,

    #[error("server could not decode arguments")]
    GarbageArgs,

    #[error("RPC version mismatch (supported {}..={})", .0.low, .0.high)]
    RpcMismatch(mismatch_info),
}

/// Terminal failure of a single call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// No reply after the whole retransmission budget (major timeout).
    #[error("call timed out")]
    Timeout,

    /// The connection went away and was not re-established.
    #[error("connection lost")]
    ConnectionLost,

    /// The caller cancelled the call.
    #[error("call cancelled")]
    Cancelled,

    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("call rejected: {0}")]
    Rejected(#[from] RejectReason),
}
