//! Link Pool
//!
//! Fixed-capacity set of link control blocks addressed by slot. At most one
//! in-use LCB exists per (remote address, transport).

use crate::channel::ChannelId;
use crate::flow::buffer::OutboundBuffer;
use crate::link::types::{
    BdAddr, HciHandle, HciStatus, LinkId, LinkPriority, LinkRole, LinkState, PingResult,
    TransportKind,
};
use std::collections::VecDeque;
use std::fmt;

/// Completion callback of an outstanding ping
pub struct PingCallback(Box<dyn FnOnce(PingResult) + Send>);

impl PingCallback {
    pub fn new(callback: impl FnOnce(PingResult) + Send + 'static) -> Self {
        Self(Box::new(callback))
    }

    pub fn complete(self, result: PingResult) {
        (self.0)(result)
    }
}

impl fmt::Debug for PingCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PingCallback")
    }
}

/// A ping outcome held back until the dispatch lock is released
#[derive(Debug)]
pub struct PingCompletion {
    callback: PingCallback,
    result: PingResult,
}

impl PingCompletion {
    pub fn new(callback: PingCallback, result: PingResult) -> Self {
        Self { callback, result }
    }

    pub fn result(&self) -> PingResult {
        self.result
    }

    pub fn run(self) {
        self.callback.complete(self.result)
    }
}

/// Link control block: bookkeeping for one physical link
#[derive(Debug)]
pub struct LinkControlBlock {
    pub id: LinkId,
    pub remote: BdAddr,
    pub transport: TransportKind,
    /// Valid only while connected (or tearing a connection down)
    pub handle: Option<HciHandle>,
    pub state: LinkState,
    pub role: LinkRole,
    pub priority: LinkPriority,
    /// Private allotment; 0 means the link shares the round-robin pool
    pub xmit_quota: u16,
    pub sent_not_acked: u16,
    pub partial_segment_in_flight: bool,
    pub disc_reason: HciStatus,
    /// Link-level frames, served ahead of channel queues
    pub link_queue: VecDeque<OutboundBuffer>,
    /// Attached channels in attach order
    pub channels: Vec<ChannelId>,
    /// Next channel to serve
    pub channel_cursor: usize,
    pub fixed_channels: Vec<Option<ChannelId>>,
    /// Channel that raced a reconnect against this link's teardown
    pub pending_channel: Option<ChannelId>,
    pub ping: Option<PingCallback>,
    /// Link exists for dedicated bonding
    pub is_bonding: bool,
    pub awaiting_info_rsp: bool,
    created_seq: u64,
}

impl LinkControlBlock {
    fn new(
        id: LinkId,
        remote: BdAddr,
        transport: TransportKind,
        fixed_slots: usize,
        created_seq: u64,
    ) -> Self {
        Self {
            id,
            remote,
            transport,
            handle: None,
            state: LinkState::Connecting,
            role: LinkRole::Central,
            priority: LinkPriority::Normal,
            xmit_quota: 0,
            sent_not_acked: 0,
            partial_segment_in_flight: false,
            disc_reason: HciStatus::SUCCESS,
            link_queue: VecDeque::new(),
            channels: Vec::new(),
            channel_cursor: 0,
            fixed_channels: vec![None; fixed_slots],
            pending_channel: None,
            ping: None,
            is_bonding: false,
            awaiting_info_rsp: false,
            created_seq,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn is_round_robin(&self) -> bool {
        self.xmit_quota == 0
    }

    pub fn has_channels(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Private quota left before the link must wait for acknowledgements
    pub fn spare_quota(&self) -> u16 {
        self.xmit_quota.saturating_sub(self.sent_not_acked)
    }

    pub fn detach(&mut self, cid: ChannelId) -> bool {
        let before = self.channels.len();
        self.channels.retain(|c| *c != cid);
        for fixed in self.fixed_channels.iter_mut() {
            if *fixed == Some(cid) {
                *fixed = None;
            }
        }
        if self.pending_channel == Some(cid) {
            self.pending_channel = None;
        }
        if self.channel_cursor >= self.channels.len() {
            self.channel_cursor = 0;
        }
        self.channels.len() != before
    }
}

#[derive(Debug)]
pub struct LinkPool {
    slots: Vec<Option<LinkControlBlock>>,
    generations: Vec<u32>,
    fixed_slots: usize,
    seq: u64,
}

impl LinkPool {
    pub fn new(capacity: usize, fixed_slots: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            generations: vec![0; capacity],
            fixed_slots,
            seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot for `remote`; `None` when the pool is full
    pub fn allocate(&mut self, remote: BdAddr, transport: TransportKind) -> Option<LinkId> {
        let slot = self.slots.iter().position(Option::is_none)?;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.seq += 1;
        let id = LinkId {
            slot,
            generation: self.generations[slot],
        };
        self.slots[slot] = Some(LinkControlBlock::new(
            id,
            remote,
            transport,
            self.fixed_slots,
            self.seq,
        ));
        Some(id)
    }

    pub fn release(&mut self, id: LinkId) -> Option<LinkControlBlock> {
        self.get(id)?;
        self.slots[id.slot].take()
    }

    pub fn get(&self, id: LinkId) -> Option<&LinkControlBlock> {
        self.slots
            .get(id.slot)?
            .as_ref()
            .filter(|lcb| lcb.id.generation == id.generation)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut LinkControlBlock> {
        self.slots
            .get_mut(id.slot)?
            .as_mut()
            .filter(|lcb| lcb.id.generation == id.generation)
    }

    /// Whatever currently occupies `slot`
    pub fn at_slot(&self, slot: usize) -> Option<&LinkControlBlock> {
        self.slots.get(slot)?.as_ref()
    }

    pub fn find_by_addr(&self, remote: BdAddr, transport: TransportKind) -> Option<LinkId> {
        self.iter()
            .find(|lcb| lcb.remote == remote && lcb.transport == transport)
            .map(|lcb| lcb.id)
    }

    pub fn find_by_handle(&self, handle: HciHandle) -> Option<LinkId> {
        self.iter()
            .find(|lcb| lcb.handle == Some(handle))
            .map(|lcb| lcb.id)
    }

    /// Oldest link in `state`
    pub fn find_oldest_in_state(&self, state: LinkState) -> Option<LinkId> {
        self.iter()
            .filter(|lcb| lcb.state == state)
            .min_by_key(|lcb| lcb.created_seq)
            .map(|lcb| lcb.id)
    }

    pub fn any_in_state(&self, state: LinkState) -> bool {
        self.iter().any(|lcb| lcb.state == state)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LinkControlBlock> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LinkControlBlock> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    /// Ids of every in-use link, in slot order
    pub fn ids(&self) -> Vec<LinkId> {
        self.iter().map(|lcb| lcb.id).collect()
    }

    pub fn in_use(&self) -> usize {
        self.iter().count()
    }
}
