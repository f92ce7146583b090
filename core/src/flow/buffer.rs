//! Outbound ACL buffer
//!
//! A frame queued on a link or channel. When the scheduler hands it to the
//! transport it stamps how many MTU-sized segments of the remaining payload
//! this burst covers; the transport emits exactly those segments and, if
//! the frame is not finished, returns the buffer through the
//! segments-transmitted notification.

use crate::channel::ChannelId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundBuffer {
    payload: Vec<u8>,
    /// Bytes released by earlier bursts
    offset: usize,
    segment_len: usize,
    /// Segments in the current burst
    segments: u16,
    /// Channel the frame came from (`None` for link-level frames)
    pub channel: Option<ChannelId>,
}

impl OutboundBuffer {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            offset: 0,
            segment_len: 0,
            segments: 0,
            channel: None,
        }
    }

    pub fn for_channel(payload: Vec<u8>, channel: ChannelId) -> Self {
        Self {
            channel: Some(channel),
            ..Self::new(payload)
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Bytes not yet released to the transport
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.payload.len() && self.segments == 0
    }

    /// Segments the remaining payload needs at `mtu` (at least one, so empty
    /// frames still go out)
    pub fn segments_needed(&self, mtu: u16) -> u16 {
        let mtu = usize::from(mtu.max(1));
        let needed = self.remaining().div_ceil(mtu).max(1);
        u16::try_from(needed).unwrap_or(u16::MAX)
    }

    /// Segment count of the burst currently in flight
    pub fn segments(&self) -> u16 {
        self.segments
    }

    pub(crate) fn stamp(&mut self, segments: u16, mtu: u16) {
        self.segments = segments;
        self.segment_len = usize::from(mtu.max(1));
    }

    /// The segments of the current burst, in order
    pub fn burst(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let end = self.burst_end();
        let len = self.segment_len.max(1);
        let slice = &self.payload[self.offset..end];
        let empty = slice.is_empty() && self.segments > 0;
        slice
            .chunks(len)
            .chain(empty.then_some(&[][..]))
    }

    fn burst_end(&self) -> usize {
        let burst = usize::from(self.segments) * self.segment_len;
        (self.offset + burst).min(self.payload.len())
    }

    /// Mark the current burst as handed to the controller
    pub fn mark_transmitted(&mut self) {
        self.offset = self.burst_end();
        self.segments = 0;
    }
}
