//! Registry of calls that were sent and await a reply.
//!
//! Calls are spread over N buckets by `xid mod N`. The bucket only narrows
//! the search: distinct xids may share one, so lookups always compare the
//! full xid.

use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::trace;

use super::pdu::Pdu;

type Bucket = SmallVec<[Pdu; 2]>;

#[derive(Debug)]
pub(crate) struct CorrelationTable {
    buckets: Vec<Bucket>,
    len: usize,
}

impl CorrelationTable {
    /// `bucket_count` must be at least 1.
    pub fn new(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        Self { buckets: (0..bucket_count).map(|_| Bucket::new()).collect(), len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn index(&self, xid: u32) -> usize {
        xid as usize % self.buckets.len()
    }

    /// Sizes of every bucket, in bucket order.
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(|b| b.len()).collect()
    }

    pub fn insert(&mut self, pdu: Pdu) {
        let index = self.index(pdu.xid);
        trace!("xid {} waits in bucket {}", pdu.xid, index);
        self.buckets[index].push(pdu);
        self.len += 1;
    }

    pub fn contains(&self, xid: u32) -> bool {
        self.buckets[self.index(xid)].iter().any(|p| p.xid == xid)
    }

    pub fn take(&mut self, xid: u32) -> Option<Pdu> {
        let index = self.index(xid);
        let bucket = &mut self.buckets[index];
        let pos = bucket.iter().position(|p| p.xid == xid)?;
        self.len -= 1;
        Some(bucket.remove(pos))
    }

    /// Rehashes every waiting call into `bucket_count` new buckets.
    pub fn resize(&mut self, bucket_count: usize) {
        let bucket_count = bucket_count.max(1);
        let old = std::mem::replace(
            &mut self.buckets,
            (0..bucket_count).map(|_| Bucket::new()).collect(),
        );
        self.len = 0;
        for pdu in old.into_iter().flatten() {
            self.insert(pdu);
        }
    }

    /// Removes every call sent at least `timeout` before `now`, oldest
    /// submission first.
    pub fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<Pdu> {
        let mut expired = Vec::new();
        for bucket in &mut self.buckets {
            let mut i = 0;
            while i < bucket.len() {
                let sent_at = bucket[i].sent_at.unwrap_or(bucket[i].enqueued_at);
                if now.saturating_duration_since(sent_at) >= timeout {
                    expired.push(bucket.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        self.len -= expired.len();
        expired.sort_by_key(|p| p.seq);
        expired
    }

    /// Empties the table, oldest submission first.
    pub fn drain_all(&mut self) -> Vec<Pdu> {
        let mut all: Vec<Pdu> = self.buckets.iter_mut().flat_map(|b| b.drain(..)).collect();
        self.len = 0;
        all.sort_by_key(|p| p.seq);
        all
    }
}
