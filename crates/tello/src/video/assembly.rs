//! Access-unit reassembly from video datagrams.
//!
//! The assembler never hands on a partial unit. When it detects a gap it
//! drops what it has, counts one loss, and skips datagrams until the next
//! unit boundary, so the decoder only ever sees complete access units.
//!
//! Two framings are supported; see [`VideoFraming`].

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::debug;

use super::h264;

/// Largest access unit accepted before it is treated as corrupt.
pub const MAX_UNIT_BYTES: usize = 512 * 1024;

/// How the device splits an access unit over datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFraming {
    /// The text SDK stream: raw Annex-B in datagrams of `max_fragment` bytes,
    /// the last (short) datagram closing the unit. A datagram opening with a
    /// start code while a unit is open means the closing datagram was lost.
    Sdk { max_fragment: usize },
    /// A two-byte header per datagram: `[frame number, segment | 0x80 on
    /// the last segment]`, followed by payload.
    Indexed,
}

impl Default for VideoFraming {
    fn default() -> Self {
        VideoFraming::Sdk { max_fragment: 1460 }
    }
}

/// Position in the current unit, for the indexed framing.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    frame: u8,
    next_segment: u8,
}

/// Accumulates datagrams into complete access units.
#[derive(Debug)]
pub struct FrameAssembler {
    framing: VideoFraming,
    timeout: Duration,
    buf: BytesMut,
    started_at: Option<Instant>,
    cursor: Option<Cursor>,
    /// Skipping the remainder of a lost unit.
    resync: bool,
    /// Frame number being skipped, for the indexed framing.
    skipping_frame: Option<u8>,
    losses: u64,
}

impl FrameAssembler {
    pub fn new(framing: VideoFraming, timeout: Duration) -> Self {
        FrameAssembler {
            framing,
            timeout,
            buf: BytesMut::new(),
            started_at: None,
            cursor: None,
            resync: false,
            skipping_frame: None,
            losses: 0,
        }
    }

    /// Access units dropped so far.
    pub fn losses(&self) -> u64 {
        self.losses
    }

    /// Whether a unit is partially assembled.
    pub fn is_assembling(&self) -> bool {
        !self.buf.is_empty() || self.cursor.is_some()
    }

    /// Feed one datagram. Returns a unit when this datagram completes one.
    pub fn push(&mut self, datagram: &[u8], now: Instant) -> Option<Bytes> {
        self.expire(now);
        match self.framing {
            VideoFraming::Sdk { max_fragment } => self.push_sdk(datagram, max_fragment, now),
            VideoFraming::Indexed => self.push_indexed(datagram, now),
        }
    }

    /// Drop a unit that has been assembling for longer than the timeout.
    pub fn expire(&mut self, now: Instant) {
        let Some(started) = self.started_at else {
            return;
        };
        if now.saturating_duration_since(started) > self.timeout {
            debug!(bytes = self.buf.len(), "access unit timed out");
            if let Some(c) = self.cursor {
                self.skipping_frame = Some(c.frame);
            }
            self.lose();
            // The rest of that unit, if it ever arrives, is orphaned.
            self.resync = true;
        }
    }

    fn lose(&mut self) {
        self.losses += 1;
        self.reset();
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.started_at = None;
        self.cursor = None;
    }

    fn append(&mut self, payload: &[u8], now: Instant) -> bool {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.buf.extend_from_slice(payload);
        if self.buf.len() > MAX_UNIT_BYTES {
            debug!(bytes = self.buf.len(), "access unit overflow");
            self.lose();
            return false;
        }
        true
    }

    fn take(&mut self) -> Bytes {
        let unit = self.buf.split().freeze();
        self.reset();
        unit
    }

    fn push_sdk(&mut self, datagram: &[u8], max_fragment: usize, now: Instant) -> Option<Bytes> {
        if datagram.is_empty() {
            return None;
        }
        let closes_unit = datagram.len() < max_fragment;

        if !self.buf.is_empty() && h264::starts_with_start_code(datagram) {
            // The short datagram that closed the unit in progress was lost.
            debug!(bytes = self.buf.len(), "new unit began before the previous one closed");
            self.lose();
        }

        if self.buf.is_empty() {
            if self.resync && !h264::starts_with_start_code(datagram) {
                // Still inside an orphaned unit.
                if closes_unit {
                    self.resync = false;
                }
                return None;
            }
            self.resync = false;

            if !h264::starts_with_start_code(datagram) {
                debug!(len = datagram.len(), "unit does not begin with a start code");
                self.losses += 1;
                self.resync = !closes_unit;
                return None;
            }
        }

        if !self.append(datagram, now) {
            self.resync = !closes_unit;
            return None;
        }
        if closes_unit {
            return Some(self.take());
        }
        None
    }

    fn push_indexed(&mut self, datagram: &[u8], now: Instant) -> Option<Bytes> {
        let [frame, segment_byte, payload @ ..] = datagram else {
            debug!(len = datagram.len(), "video datagram shorter than its header");
            if self.is_assembling() {
                self.lose();
            }
            return None;
        };
        let (frame, segment_byte) = (*frame, *segment_byte);
        let segment = segment_byte & 0x7F;
        let last = segment_byte & 0x80 != 0;

        if segment == 0 {
            if self.is_assembling() {
                debug!(frame, "new unit began before the previous one completed");
                self.lose();
            }
            self.skipping_frame = None;
            self.cursor = Some(Cursor {
                frame,
                next_segment: 1,
            });
        } else {
            match self.cursor {
                Some(c) if c.frame == frame && c.next_segment == segment => {
                    self.cursor = Some(Cursor {
                        frame,
                        next_segment: segment.wrapping_add(1),
                    });
                }
                Some(c) => {
                    debug!(
                        frame,
                        segment,
                        expected_frame = c.frame,
                        expected_segment = c.next_segment,
                        "video segment gap"
                    );
                    self.lose();
                    self.skipping_frame = Some(frame);
                    return None;
                }
                None => {
                    // Middle of a unit whose start we never saw.
                    if self.skipping_frame != Some(frame) {
                        self.losses += 1;
                        self.skipping_frame = Some(frame);
                    }
                    return None;
                }
            }
        }

        if !self.append(payload, now) {
            self.skipping_frame = Some(frame);
            return None;
        }
        if last {
            return Some(self.take());
        }
        None
    }
}
