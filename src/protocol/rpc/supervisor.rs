//! Timeout and retransmission scan, run on every engine tick.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::connection::ReconnectStep;
use super::correlation::CorrelationTable;
use super::error::CallError;
use super::outbound::OutboundQueue;
use super::stats::RpcStats;

/// What one tick did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sent calls found past the timeout
    pub timed_out: usize,
    /// Of those, calls queued again for retransmission
    pub retransmitted: usize,
    /// Of those, calls failed with [`CallError::Timeout`]
    pub major_timeouts: usize,
    /// Unsent calls newly found past the timeout
    pub queue_timeouts: u64,
    /// Set when a major timeout forced the connection down
    pub reconnect: Option<ReconnectStep>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Supervisor {
    pub timeout: Duration,
    pub retrans: u32,
}

impl Supervisor {
    /// Moves overdue calls back to the queue or fails them, oldest first.
    /// Retransmissions keep their xid and go ahead of everything not yet
    /// sent.
    pub fn scan(
        &self,
        table: &mut CorrelationTable,
        queue: &mut OutboundQueue,
        stats: &mut RpcStats,
        now: Instant,
    ) -> TickReport {
        let mut report = TickReport::default();

        let expired = table.take_expired(now, self.timeout);
        let mut retry = Vec::new();
        for mut pdu in expired {
            report.timed_out += 1;
            stats.timed_out += 1;
            if pdu.retries < self.retrans {
                pdu.retries += 1;
                debug!("xid {} timed out, retransmission {}/{}", pdu.xid, pdu.retries, self.retrans);
                pdu.requeue(now);
                retry.push(pdu);
                report.retransmitted += 1;
                stats.retransmitted += 1;
            } else {
                warn!("xid {} major timeout after {} retransmissions", pdu.xid, pdu.retries);
                stats.major_timed_out += 1;
                report.major_timeouts += 1;
                pdu.complete(Err(CallError::Timeout));
            }
        }
        queue.requeue_front(retry);

        report.queue_timeouts = queue.count_timeouts(now, self.timeout);
        if report.queue_timeouts > 0 {
            debug!("{} calls timed out waiting in the outbound queue", report.queue_timeouts);
            stats.timed_out_in_outqueue += report.queue_timeouts;
        }
        report
    }
}
