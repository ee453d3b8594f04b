//! FIFO of calls waiting for the socket.
//!
//! The head of the queue may be partly written: a non-blocking write can
//! accept any prefix of it. The queue remembers how many bytes of the head
//! went out and resumes from there on the next writable event; the message
//! is never serialized again. Nothing may be placed in front of a partly
//! written head, since its remaining bytes must follow on the stream.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::time::{Duration, Instant};

use tracing::trace;

use super::connection::Transport;
use super::framer::{record_marker, MARKER_LEN};
use super::pdu::Pdu;
use crate::protocol::xdr::utils::padding_len;

#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    queue: VecDeque<Pdu>,
    /// Bytes of the head already handed to the socket.
    head_written: usize,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn head_in_progress(&self) -> bool {
        self.head_written > 0
    }

    pub fn contains(&self, xid: u32) -> bool {
        self.queue.iter().any(|p| p.xid == xid)
    }

    pub fn push_back(&mut self, pdu: Pdu) {
        self.queue.push_back(pdu);
    }

    /// Puts `pdu` at the front, behind a partly written head.
    pub fn reinject_front(&mut self, pdu: Pdu) {
        if self.head_in_progress() {
            self.queue.insert(1, pdu);
        } else {
            self.queue.push_front(pdu);
        }
    }

    /// Puts `pdus` at the front in their given order.
    pub fn requeue_front(&mut self, pdus: Vec<Pdu>) {
        for pdu in pdus.into_iter().rev() {
            self.reinject_front(pdu);
        }
    }

    /// Removes the call with `xid` unless it is the partly written head.
    pub fn remove(&mut self, xid: u32) -> Option<Pdu> {
        let pos = self.queue.iter().position(|p| p.xid == xid)?;
        if pos == 0 && self.head_in_progress() {
            return None;
        }
        self.queue.remove(pos)
    }

    pub fn get_mut(&mut self, xid: u32) -> Option<&mut Pdu> {
        self.queue.iter_mut().find(|p| p.xid == xid)
    }

    /// Writes as much of the head as `out` accepts. Returns the head once all
    /// of it went out; a would-block error leaves the progress recorded.
    pub fn write_head<W: Write>(
        &mut self,
        out: &mut W,
        transport: Transport,
    ) -> io::Result<Option<Pdu>> {
        let Some(head) = self.queue.front() else {
            return Ok(None);
        };

        match transport {
            Transport::Udp => {
                let n = out.write(&head.message)?;
                if n != head.message.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("datagram truncated to {} of {} bytes", n, head.message.len()),
                    ));
                }
            }
            Transport::Tcp => {
                let len = head.message.len();
                let marker = record_marker(len, true);
                let padding = [0u8; 3];
                let padding = &padding[..padding_len(len)];
                let total = MARKER_LEN + len + padding.len();

                while self.head_written < total {
                    let offset = self.head_written;
                    let chunk = if offset < MARKER_LEN {
                        &marker[offset..]
                    } else if offset < MARKER_LEN + len {
                        &head.message[offset - MARKER_LEN..]
                    } else {
                        &padding[offset - MARKER_LEN - len..]
                    };
                    match out.write(chunk) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => {
                            self.head_written += n;
                            trace!("xid {}: wrote {}/{} bytes", head.xid, self.head_written, total);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        self.head_written = 0;
        Ok(self.queue.pop_front())
    }

    /// Forgets write progress after the stream went away. A head whose caller
    /// already has an outcome is dropped; it only stayed to finish its bytes.
    pub fn reset_progress(&mut self) {
        self.head_written = 0;
        if self.queue.front().is_some_and(Pdu::is_abandoned) {
            self.queue.pop_front();
        }
    }

    /// Marks calls that have waited `timeout` or more since entering the
    /// queue. Each stay in the queue is counted once.
    pub fn count_timeouts(&mut self, now: Instant, timeout: Duration) -> u64 {
        let mut count = 0;
        for pdu in self.queue.iter_mut() {
            if !pdu.queue_timeout_counted
                && !pdu.is_abandoned()
                && now.saturating_duration_since(pdu.enqueued_at) >= timeout
            {
                pdu.queue_timeout_counted = true;
                count += 1;
            }
        }
        count
    }

    pub fn drain_all(&mut self) -> Vec<Pdu> {
        self.head_written = 0;
        self.queue.drain(..).collect()
    }
}
