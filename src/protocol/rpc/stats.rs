/// Cumulative counters of one engine.
///
/// Counters only grow. They survive reconnects and are cleared only by
/// `RpcEngine::reset_stats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcStats {
    /// Calls fully written to the socket, retransmissions included
    pub requests_sent: u64,
    /// Replies that matched a pending call
    pub responses_received: u64,
    /// Sent calls that outlived the timeout
    pub timed_out: u64,
    /// Calls that outlived the timeout before being sent
    pub timed_out_in_outqueue: u64,
    /// Calls failed after their last retransmission timed out
    pub major_timed_out: u64,
    /// Calls put back in the queue for another transmission
    pub retransmitted: u64,
    /// Reconnect attempts
    pub reconnects: u64,
}
