//! Global Flow State
//!
//! One [`TransportFlow`] per transport kind: the controller window, the
//! shared round-robin pool and the allocator's link counts. Every
//! subtractive update clamps at zero so duplicated or reordered controller
//! reports cannot drive a counter negative.

use crate::config::TransportDescriptor;
use crate::link::types::TransportKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportFlow {
    pub transport: TransportKind,
    /// Largest single ACL packet payload
    pub mtu: u16,
    /// Buffers the controller reported in total
    pub total_buffers: u16,
    /// Buffers the controller can accept right now
    pub window: u16,
    /// Shared budget for links without a private quota
    pub rr_quota: u16,
    /// Outstanding buffers charged to the shared budget
    pub rr_unacked: u16,
    /// A round-robin link queued data while the shared pool was exhausted
    pub check_round_robin: bool,
    pub high_priority_links: u16,
    pub normal_priority_links: u16,
}

impl TransportFlow {
    pub fn new(transport: TransportKind, desc: TransportDescriptor) -> Self {
        Self {
            transport,
            mtu: desc.mtu,
            total_buffers: desc.buffers,
            window: desc.buffers,
            rr_quota: 0,
            rr_unacked: 0,
            check_round_robin: false,
            high_priority_links: 0,
            normal_priority_links: 0,
        }
    }

    /// Controller reported its buffer count
    pub fn set_total_buffers(&mut self, buffers: u16) {
        self.total_buffers = buffers;
        self.window = buffers;
    }

    pub fn active_links(&self) -> u16 {
        self.high_priority_links + self.normal_priority_links
    }

    pub fn has_window(&self) -> bool {
        self.window > 0
    }

    pub fn rr_has_headroom(&self) -> bool {
        self.rr_unacked < self.rr_quota
    }

    /// Round-robin links of this transport may send
    pub fn rr_can_send(&self) -> bool {
        self.has_window() && self.rr_has_headroom()
    }

    pub fn consume_window(&mut self, n: u16) {
        self.window = self.window.saturating_sub(n);
    }

    /// Give `n` buffers back to the window, never above the controller total
    pub fn restore_window(&mut self, n: u16) {
        self.window = self.window.saturating_add(n).min(self.total_buffers);
    }

    pub fn charge_rr(&mut self, n: u16) {
        self.rr_unacked = self.rr_unacked.saturating_add(n);
    }

    pub fn release_rr(&mut self, n: u16) {
        self.rr_unacked = self.rr_unacked.saturating_sub(n);
    }

    /// No active links: full window, empty shared pool
    pub fn reset(&mut self) {
        self.window = self.total_buffers;
        self.rr_quota = 0;
        self.rr_unacked = 0;
        self.check_round_robin = false;
    }
}

/// Per-transport flow state table
#[derive(Debug, Clone)]
pub struct FlowTable {
    flows: [TransportFlow; 2],
}

impl FlowTable {
    pub fn new(classic: TransportDescriptor, low_energy: TransportDescriptor) -> Self {
        Self {
            flows: [
                TransportFlow::new(TransportKind::Classic, classic),
                TransportFlow::new(TransportKind::LowEnergy, low_energy),
            ],
        }
    }

    pub fn get(&self, transport: TransportKind) -> &TransportFlow {
        &self.flows[transport.index()]
    }

    pub fn get_mut(&mut self, transport: TransportKind) -> &mut TransportFlow {
        &mut self.flows[transport.index()]
    }
}
