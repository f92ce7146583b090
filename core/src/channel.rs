//! Channel Registry
//!
//! Logical-channel records (CCBs) live in a fixed-capacity pool addressed by
//! [`ChannelId`]. The channel layer creates and removes them; the link
//! manager only walks a link's attached channels, dispatches events to them
//! through [`ChannelLayer`] and drains their outbound queues.

use crate::flow::buffer::OutboundBuffer;
use crate::link::types::{BdAddr, HciStatus, LinkId, TransportKind};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Stable reference to a channel pool slot (see [`LinkId`] for the
/// generation scheme)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub slot: usize,
    pub generation: u32,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ccb#{}.{}", self.slot, self.generation)
    }
}

/// Data-rate hint configured on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataRate {
    NoTraffic,
    Low,
    #[default]
    Medium,
    High,
}

impl DataRate {
    pub fn weight(self) -> u32 {
        match self {
            DataRate::NoTraffic => 0,
            DataRate::Low => 1,
            DataRate::Medium => 2,
            DataRate::High => 3,
        }
    }
}

/// Events the link manager feeds into a channel's state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelEvent {
    /// The physical link came up
    LowerConnectConfirmed,
    /// The physical link could not be established
    LowerConnectConfirmNegative { status: HciStatus },
    /// The physical link went away (`None` when dropped by a local timeout)
    LowerDisconnectIndication { reason: Option<HciStatus> },
    SecurityComplete,
    SecurityCompleteNegative { status: u8 },
    QosViolation,
    /// Peer information exchange finished (or timed out)
    InfoResponse,
    /// A channel-level timer armed by the link manager expired
    Timeout,
}

impl fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEvent::LowerConnectConfirmed => write!(f, "LowerConnectConfirmed"),
            ChannelEvent::LowerConnectConfirmNegative { status } => {
                write!(f, "LowerConnectConfirmNegative({})", status)
            }
            ChannelEvent::LowerDisconnectIndication { reason } => match reason {
                Some(reason) => write!(f, "LowerDisconnectIndication({})", reason),
                None => write!(f, "LowerDisconnectIndication"),
            },
            ChannelEvent::SecurityComplete => write!(f, "SecurityComplete"),
            ChannelEvent::SecurityCompleteNegative { status } => {
                write!(f, "SecurityCompleteNegative({})", status)
            }
            ChannelEvent::QosViolation => write!(f, "QosViolation"),
            ChannelEvent::InfoResponse => write!(f, "InfoResponse"),
            ChannelEvent::Timeout => write!(f, "Timeout"),
        }
    }
}

/// What the channel state machine decided after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelVerdict {
    /// Channel stays attached to its link
    Retain,
    /// Channel removed itself; the link manager drops it from the link and
    /// frees its pool slot
    Detach,
}

/// The per-channel signaling state machine (external collaborator)
///
/// Upcalls run inside the dispatch context with the manager borrowed.
/// They answer through their return values (a [`ChannelVerdict`], frames to
/// queue); anything else must be posted to the [`crate::LinkDispatcher`]
/// from outside the upcall.
#[cfg_attr(test, mockall::automock)]
pub trait ChannelLayer: Send {
    /// Execute `event` on channel `cid`
    fn dispatch(&mut self, cid: ChannelId, local_cid: u16, event: ChannelEvent) -> ChannelVerdict;

    /// A fixed channel bound to a link lost that link
    fn fixed_channel_disconnected(
        &mut self,
        fixed_cid: u16,
        remote: BdAddr,
        reason: HciStatus,
        transport: TransportKind,
    );

    /// Congestion flag of `cid` flipped. Frames returned here are queued on
    /// the channel but not sent until the next completion event.
    fn congestion_changed(&mut self, cid: ChannelId, congested: bool) -> Vec<OutboundBuffer>;
}

/// Channel control block
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub local_cid: u16,
    /// Owning link
    pub link: LinkId,
    pub queue: VecDeque<OutboundBuffer>,
    pub tx_rate: DataRate,
    pub rx_rate: DataRate,
    /// Outbound frames this channel may hold before it reports congestion
    pub buffer_quota: u32,
    pub congested: bool,
    /// Registered for QoS violation indications
    pub qos_interest: bool,
    /// Channel state machine is waiting on the security manager
    pub awaiting_security: bool,
}

impl ChannelRecord {
    pub fn new(local_cid: u16, link: LinkId) -> Self {
        Self {
            local_cid,
            link,
            queue: VecDeque::new(),
            tx_rate: DataRate::default(),
            rx_rate: DataRate::default(),
            buffer_quota: 0,
            congested: false,
            qos_interest: false,
            awaiting_security: false,
        }
    }

    pub fn with_rates(mut self, tx_rate: DataRate, rx_rate: DataRate) -> Self {
        self.tx_rate = tx_rate;
        self.rx_rate = rx_rate;
        self
    }

    pub fn with_qos_interest(mut self, interested: bool) -> Self {
        self.qos_interest = interested;
        self
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Re-evaluate congestion; returns the new flag when it changed
    pub fn update_congestion(&mut self) -> Option<bool> {
        let congested = self.queue.len() as u32 > self.buffer_quota;
        if congested != self.congested {
            self.congested = congested;
            Some(congested)
        } else {
            None
        }
    }
}

/// Fixed-capacity pool of channel records
#[derive(Debug)]
pub struct ChannelPool {
    slots: Vec<Option<ChannelRecord>>,
    generations: Vec<u32>,
}

impl ChannelPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            generations: vec![0; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn allocate(&mut self, record: ChannelRecord) -> Option<ChannelId> {
        let slot = self.slots.iter().position(Option::is_none)?;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.slots[slot] = Some(record);
        Some(ChannelId {
            slot,
            generation: self.generations[slot],
        })
    }

    pub fn release(&mut self, id: ChannelId) -> Option<ChannelRecord> {
        if !self.contains(id) {
            return None;
        }
        self.slots[id.slot].take()
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.generations.get(id.slot) == Some(&id.generation)
            && matches!(self.slots.get(id.slot), Some(Some(_)))
    }

    pub fn get(&self, id: ChannelId) -> Option<&ChannelRecord> {
        if self.generations.get(id.slot) != Some(&id.generation) {
            return None;
        }
        self.slots.get(id.slot)?.as_ref()
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut ChannelRecord> {
        if self.generations.get(id.slot) != Some(&id.generation) {
            return None;
        }
        self.slots.get_mut(id.slot)?.as_mut()
    }

    /// Iterate over every in-use record
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ChannelId, &mut ChannelRecord)> {
        let generations = &self.generations;
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(move |(slot, record)| {
                record.as_mut().map(|record| {
                    (
                        ChannelId {
                            slot,
                            generation: generations[slot],
                        },
                        record,
                    )
                })
            })
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
