//! Completion accounting
//!
//! The controller reports buffers it has released (number-of-completed-
//! packets) and the transport hands back frames it only partly emitted.
//! Both free up room, so both end in a pump.

use crate::flow::buffer::OutboundBuffer;
use crate::link::manager::LinkManager;
use crate::link::types::{HciHandle, LinkPriority};
use crate::LinkError;
use tracing::{debug, trace, warn};

impl LinkManager {
    /// Controller released `count` buffers sent on `handle`
    pub fn on_completed_packets(&mut self, handle: HciHandle, count: u16) -> Result<(), LinkError> {
        let Some(id) = self.links.find_by_handle(handle) else {
            debug!("Completed packets for unknown handle {}", handle);
            return Err(LinkError::UnknownHandle(handle));
        };
        let Some(lcb) = self.links.get_mut(id) else {
            return Err(LinkError::UnknownHandle(handle));
        };

        let flow = self.flows.get_mut(lcb.transport);
        flow.restore_window(count);
        if lcb.is_round_robin() {
            flow.release_rr(count);
        }
        lcb.sent_not_acked = lcb.sent_not_acked.saturating_sub(count);
        trace!(
            "{} acked {} (window {}, unacked {}, rr {}/{})",
            handle,
            count,
            flow.window,
            lcb.sent_not_acked,
            flow.rr_unacked,
            flow.rr_quota
        );
        let transport = lcb.transport;
        let high_priority = lcb.priority == LinkPriority::High;

        self.check_send_packets(Some(id), false);

        // a high-priority ack may be the only event that frees room for
        // round-robin links waiting on the shared pool
        let flow = self.flows.get(transport);
        if high_priority && flow.check_round_robin && flow.rr_has_headroom() {
            self.check_send_packets(None, false);
        }
        Ok(())
    }

    /// A full number-of-completed-packets report
    pub fn on_completed_packets_report(&mut self, entries: &[(HciHandle, u16)]) {
        for (handle, count) in entries {
            if let Err(e) = self.on_completed_packets(*handle, *count) {
                debug!("Completed packets entry skipped: {}", e);
            }
        }
    }

    /// The transport emitted the stamped burst of `buffer`; any remainder
    /// goes back to the head of the link queue
    pub fn on_segments_transmitted(
        &mut self,
        handle: HciHandle,
        mut buffer: OutboundBuffer,
    ) -> Result<(), LinkError> {
        let Some(id) = self.links.find_by_handle(handle) else {
            warn!("Segments returned for unknown handle {}, discarding", handle);
            return Err(LinkError::UnknownHandle(handle));
        };
        let Some(lcb) = self.links.get_mut(id) else {
            return Err(LinkError::UnknownHandle(handle));
        };
        if !lcb.is_connected() {
            debug!("{} not connected, discarding returned segments", id);
            return Err(LinkError::NotConnected(lcb.remote));
        }

        if buffer.segments() > 0 {
            buffer.mark_transmitted();
        }
        if !buffer.is_complete() {
            lcb.link_queue.push_front(buffer);
        }
        lcb.partial_segment_in_flight = false;
        self.check_send_packets(Some(id), false);
        Ok(())
    }
}
