//! Record Marking (RFC 5531 section 11) for RPC messages on a byte stream.
//!
//! On TCP every message travels as one or more fragments, each preceded by a
//! 4-byte big-endian marker: the highest bit flags the last fragment of the
//! message, the lower 31 bits give the fragment length.
//!
//! The inbound side is a [`Framer`]: a state machine fed whatever the socket
//! returned, however small. It keeps exactly the state of the step it is in
//! (a partly read marker, a partly read fragment, or padding still to skip)
//! and picks up where it left off on the next call. Complete messages are
//! handed out in arrival order.
//!
//! A message whose total length is not a multiple of four is followed by
//! zero padding up to the next boundary, which the framer skips before
//! reading the next marker. Intermediate fragments are never padded.

use std::cmp::min;

use tracing::{error, trace};

use super::error::FramingError;
use crate::protocol::xdr::utils::padding_len;

/// Size of a record marker.
pub const MARKER_LEN: usize = 4;

/// Marker bit flagging the last fragment of a message.
pub const LAST_FRAGMENT: u32 = 1 << 31;

/// Largest length a single marker can declare.
pub const MAX_FRAGMENT_SIZE: usize = (1 << 31) - 1;

/// Encodes a record marker. `length` must not exceed [`MAX_FRAGMENT_SIZE`].
pub fn record_marker(length: usize, last: bool) -> [u8; MARKER_LEN] {
    let length = length as u32 & !LAST_FRAGMENT;
    let header = if last { length | LAST_FRAGMENT } else { length };
    header.to_be_bytes()
}

/// Splits a record marker into fragment length and last-fragment flag.
pub fn parse_record_marker(header: [u8; MARKER_LEN]) -> (usize, bool) {
    let header = u32::from_be_bytes(header);
    ((header & !LAST_FRAGMENT) as usize, header & LAST_FRAGMENT != 0)
}

/// Appends `message` to `out` as record-marked fragments of at most
/// `max_fragment` bytes, followed by alignment padding if the message needs
/// it.
pub fn write_record(message: &[u8], max_fragment: usize, out: &mut Vec<u8>) {
    let max_fragment = max_fragment.clamp(1, MAX_FRAGMENT_SIZE);

    if message.is_empty() {
        out.extend_from_slice(&record_marker(0, true));
        return;
    }

    let mut offset = 0;
    while offset < message.len() {
        let fragment_size = min(message.len() - offset, max_fragment);
        let is_last = offset + fragment_size >= message.len();

        trace!("Writing fragment length:{}, last:{}", fragment_size, is_last);
        out.extend_from_slice(&record_marker(fragment_size, is_last));
        out.extend_from_slice(&message[offset..offset + fragment_size]);

        offset += fragment_size;
    }
    out.resize(out.len() + padding_len(message.len()), 0);
}

/// Step the inbound framer is in, carrying only what that step needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramerState {
    /// Collecting the 4-byte marker of the next fragment.
    ReadMarker { header: [u8; MARKER_LEN], filled: usize },
    /// Collecting the body of the current fragment.
    ReadFragmentPayload { fragment: Vec<u8>, remaining: usize, last: bool },
    /// Skipping alignment bytes after a complete message.
    ReadPadding { remaining: usize },
}

impl FramerState {
    fn marker() -> Self {
        FramerState::ReadMarker { header: [0; MARKER_LEN], filled: 0 }
    }
}

/// Resumable reassembler turning a TCP byte stream into RPC messages.
#[derive(Debug)]
pub struct Framer {
    state: FramerState,
    /// Completed fragments of the message being reassembled, in order.
    fragments: Vec<Vec<u8>>,
    /// Total bytes held in `fragments`.
    buffered: usize,
    max_message_size: usize,
}

impl Framer {
    pub fn new(max_message_size: usize) -> Self {
        Self { state: FramerState::marker(), fragments: Vec::new(), buffered: 0, max_message_size }
    }

    pub fn state(&self) -> &FramerState {
        &self.state
    }

    /// Number of completed fragments of a message still missing its last one.
    pub fn pending_fragments(&self) -> usize {
        self.fragments.len()
    }

    /// True while part of a message has been received but not all of it.
    pub fn is_mid_message(&self) -> bool {
        if !self.fragments.is_empty() {
            return true;
        }
        match self.state {
            FramerState::ReadMarker { filled, .. } => filled > 0,
            FramerState::ReadFragmentPayload { .. } => true,
            FramerState::ReadPadding { .. } => false,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.max_message_size = max_message_size;
    }

    /// Drops any partial message and waits for a fresh marker.
    pub fn reset(&mut self) {
        self.state = FramerState::marker();
        self.fragments = Vec::new();
        self.buffered = 0;
    }

    /// Consumes `input`, calling `on_message` for every message completed by
    /// it. Messages completed before a framing error are still delivered.
    ///
    /// On error the framer is left reset; the stream itself is beyond repair.
    pub fn feed<F>(&mut self, mut input: &[u8], mut on_message: F) -> Result<(), FramingError>
    where
        F: FnMut(Vec<u8>),
    {
        while !input.is_empty() {
            match &mut self.state {
                FramerState::ReadMarker { header, filled } => {
                    let n = min(MARKER_LEN - *filled, input.len());
                    header[*filled..*filled + n].copy_from_slice(&input[..n]);
                    *filled += n;
                    input = &input[n..];
                    if *filled < MARKER_LEN {
                        continue;
                    }

                    let (length, last) = parse_record_marker(*header);
                    trace!("Reading fragment length:{}, last:{}", length, is_last = last);
                    let total = self.buffered.saturating_add(length);
                    if total > self.max_message_size {
                        error!("RPC record length {} exceeds max {}", total, self.max_message_size);
                        let max = self.max_message_size;
                        self.reset();
                        return Err(FramingError::RecordTooLarge { length: total, max });
                    }

                    self.state = FramerState::ReadFragmentPayload {
                        fragment: Vec::with_capacity(length),
                        remaining: length,
                        last,
                    };
                    if length == 0 {
                        self.finish_fragment(&mut on_message)?;
                    }
                }
                FramerState::ReadFragmentPayload { fragment, remaining, .. } => {
                    let n = min(*remaining, input.len());
                    fragment.extend_from_slice(&input[..n]);
                    *remaining -= n;
                    input = &input[n..];
                    if *remaining == 0 {
                        self.finish_fragment(&mut on_message)?;
                    }
                }
                FramerState::ReadPadding { remaining } => {
                    let n = min(*remaining, input.len());
                    *remaining -= n;
                    input = &input[n..];
                    if *remaining == 0 {
                        self.state = FramerState::marker();
                    }
                }
            }
        }
        Ok(())
    }

    fn finish_fragment<F>(&mut self, on_message: &mut F) -> Result<(), FramingError>
    where
        F: FnMut(Vec<u8>),
    {
        let FramerState::ReadFragmentPayload { fragment, last, .. } =
            std::mem::replace(&mut self.state, FramerState::marker())
        else {
            return Ok(());
        };

        self.buffered += fragment.len();
        self.fragments.push(fragment);
        if !last {
            return Ok(());
        }

        let fragments = std::mem::take(&mut self.fragments);
        self.buffered = 0;
        let message = if fragments.len() == 1 {
            fragments.into_iter().next().unwrap_or_default()
        } else {
            fragments.concat()
        };
        trace!("Finishing message of {} bytes", message.len());

        if message.len() < 4 {
            error!("RPC message of {} bytes has no transaction id", message.len());
            return Err(FramingError::ShortMessage(message.len()));
        }

        let padding = padding_len(message.len());
        if padding > 0 {
            self.state = FramerState::ReadPadding { remaining: padding };
        }
        on_message(message);
        Ok(())
    }
}
