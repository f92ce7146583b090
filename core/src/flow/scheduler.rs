//! Egress scheduler
//!
//! Moves queued frames to the lower transport while the controller window
//! and the relevant quota allow it. Links with a private quota drain their
//! own queues; round-robin links share the transport's pool and are served
//! one frame at a time from a rotating cursor.

use crate::channel::ChannelId;
use crate::flow::buffer::OutboundBuffer;
use crate::link::manager::LinkManager;
use crate::link::timer::TimerKey;
use crate::link::types::{LinkId, TransportKind};
use crate::LinkError;
use tracing::{debug, error, trace, warn};

/// Scheduler state carried between pump calls
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    /// Slot of the round-robin link served last
    pub last_serviced: Option<usize>,
}

impl LinkManager {
    /// Queue a link-level frame and pump the link
    pub fn send_link_frame(
        &mut self,
        link: LinkId,
        buffer: OutboundBuffer,
    ) -> Result<(), LinkError> {
        self.enqueue_link_frame(link, buffer)?;
        self.check_send_packets(Some(link), false);
        Ok(())
    }

    /// Queue a link-level frame and attempt exactly one send
    pub fn send_single(&mut self, link: LinkId, buffer: OutboundBuffer) -> Result<(), LinkError> {
        self.enqueue_link_frame(link, buffer)?;
        self.check_send_packets(Some(link), true);
        Ok(())
    }

    fn enqueue_link_frame(
        &mut self,
        link: LinkId,
        buffer: OutboundBuffer,
    ) -> Result<(), LinkError> {
        let lcb = self
            .links
            .get_mut(link)
            .ok_or_else(|| LinkError::UnknownLink(link.to_string()))?;
        lcb.link_queue.push_back(buffer);
        if lcb.is_round_robin() {
            self.flows.get_mut(lcb.transport).check_round_robin = true;
        }
        Ok(())
    }

    /// Queue a frame on channel `cid` and pump its link
    pub fn send_channel_frame(
        &mut self,
        cid: ChannelId,
        mut buffer: OutboundBuffer,
    ) -> Result<(), LinkError> {
        let channel = self
            .channels
            .get_mut(cid)
            .ok_or(LinkError::UnknownChannel(cid))?;
        buffer.channel = Some(cid);
        channel.queue.push_back(buffer);
        let link = channel.link;
        if let Some(congested) = channel.update_congestion() {
            self.notify_congestion(cid, congested);
        }

        if let Some(lcb) = self.links.get(link) {
            if lcb.is_round_robin() {
                self.flows.get_mut(lcb.transport).check_round_robin = true;
            }
        }
        self.check_send_packets(Some(link), false);
        Ok(())
    }

    /// Core pump. `link` selects the link to serve (its round-robin peers
    /// when it has no private quota); `None` walks every round-robin link.
    pub(crate) fn check_send_packets(&mut self, link: Option<LinkId>, single_write: bool) {
        match link {
            Some(id) => match self.links.get(id).map(|l| l.is_round_robin()) {
                Some(false) => self.service_private(id, single_write),
                Some(true) => self.service_round_robin(Some(id), single_write),
                None => debug!("Pump for released {}", id),
            },
            None => self.service_round_robin(None, false),
        }
    }

    /// A queued frame cannot move while the device manager is changing
    /// the link's power mode
    fn power_hold(&self, id: LinkId) -> bool {
        let Some(lcb) = self.links.get(id) else {
            return true;
        };
        let has_data = !lcb.link_queue.is_empty()
            || lcb
                .channels
                .iter()
                .any(|cid| self.channels.get(*cid).is_some_and(|c| c.has_pending()));
        has_data && self.device.power_mode_pending(lcb.remote)
    }

    fn service_private(&mut self, id: LinkId, single_write: bool) {
        let Some(lcb) = self.links.get(id) else {
            return;
        };
        if lcb.partial_segment_in_flight || !lcb.is_connected() {
            return;
        }
        if self.power_hold(id) {
            debug!("{} held for power mode change", id);
            return;
        }

        let mut sent = 0;
        while self.can_send_private(id) {
            let Some(buffer) = self.links.get_mut(id).and_then(|l| l.link_queue.pop_front()) else {
                break;
            };
            self.send_to_lower(id, buffer);
            sent += 1;
            if single_write {
                break;
            }
        }

        if !single_write {
            while self.can_send_private(id) {
                let Some(buffer) = self.next_channel_buffer(id) else {
                    break;
                };
                self.send_to_lower(id, buffer);
                sent += 1;
            }
        }
        trace!("{} sent {} frames", id, sent);

        if let Some(lcb) = self.links.get(id) {
            if !lcb.link_queue.is_empty() && lcb.spare_quota() > 0 {
                let flow_control = self.config.timeouts.flow_control();
                self.timers.arm(TimerKey::Link(id), flow_control);
            }
        }
    }

    fn can_send_private(&self, id: LinkId) -> bool {
        self.links.get(id).is_some_and(|lcb| {
            !lcb.partial_segment_in_flight
                && lcb.spare_quota() > 0
                && self.flows.get(lcb.transport).has_window()
        })
    }

    /// Serve round-robin links one frame at a time, rotating until nothing
    /// more can move
    fn service_round_robin(&mut self, start: Option<LinkId>, single_write: bool) {
        let capacity = self.links.capacity();
        if capacity == 0 {
            return;
        }
        // an explicit single write starts at its own link; everything else
        // continues the rotation
        let first = match start {
            Some(id) if single_write => id.slot,
            _ => self.scheduler.last_serviced.map_or(0, |slot| slot + 1),
        };

        let mut slot = first % capacity;
        let mut idle = 0;
        let mut visited = 0;
        while idle < capacity {
            if single_write && visited == capacity {
                break;
            }
            visited += 1;

            match self.serve_round_robin_slot(slot, single_write) {
                Some(true) => {
                    self.scheduler.last_serviced = Some(slot);
                    if single_write {
                        break;
                    }
                    idle = 0;
                }
                Some(false) => break,
                None => idle += 1,
            }
            slot = (slot + 1) % capacity;
        }

        for transport in TransportKind::ALL {
            let flow = self.flows.get_mut(transport);
            if flow.rr_can_send() {
                flow.check_round_robin = false;
            }
        }
    }

    /// `Some(true)` when a frame went out, `Some(false)` to stop the walk,
    /// `None` when the slot had nothing to send
    fn serve_round_robin_slot(&mut self, slot: usize, single_write: bool) -> Option<bool> {
        let lcb = self.links.at_slot(slot)?;
        let id = lcb.id;
        if !self.flows.get(lcb.transport).rr_can_send() {
            return None;
        }
        if lcb.partial_segment_in_flight || !lcb.is_connected() || !lcb.is_round_robin() {
            return None;
        }
        if self.power_hold(id) {
            return None;
        }

        if let Some(buffer) = self.links.get_mut(id).and_then(|l| l.link_queue.pop_front()) {
            self.send_to_lower(id, buffer);
            return Some(true);
        }
        if single_write {
            return Some(false);
        }
        let buffer = self.next_channel_buffer(id)?;
        self.send_to_lower(id, buffer);
        Some(true)
    }

    /// Next frame from `id`'s channels, one channel per call in rotation
    fn next_channel_buffer(&mut self, id: LinkId) -> Option<OutboundBuffer> {
        let (channels, cursor) = {
            let lcb = self.links.get(id)?;
            (lcb.channels.clone(), lcb.channel_cursor)
        };
        let count = channels.len();
        for step in 0..count {
            let index = (cursor + step) % count;
            let cid = channels[index];
            let Some(channel) = self.channels.get_mut(cid) else {
                continue;
            };
            let Some(buffer) = channel.queue.pop_front() else {
                continue;
            };
            let congestion = channel.update_congestion();

            if let Some(lcb) = self.links.get_mut(id) {
                lcb.channel_cursor = (index + 1) % count;
            }
            if let Some(congested) = congestion {
                self.notify_congestion(cid, congested);
            }
            return Some(buffer);
        }
        None
    }

    /// Tell the channel layer that `cid`'s congestion flag flipped. Frames
    /// it hands back are queued but not pumped.
    pub(crate) fn notify_congestion(&mut self, cid: ChannelId, congested: bool) {
        debug!("{} congestion {}", cid, if congested { "on" } else { "off" });
        let frames = self.channel_layer.congestion_changed(cid, congested);

        let Some(channel) = self.channels.get_mut(cid) else {
            if !frames.is_empty() {
                warn!("Dropping {} frames for vanished {}", frames.len(), cid);
            }
            return;
        };
        for mut frame in frames {
            frame.channel = Some(cid);
            channel.queue.push_back(frame);
        }
    }

    /// Charge the window and quota for one burst of `buffer` and hand it to
    /// the transport
    pub(crate) fn send_to_lower(&mut self, id: LinkId, mut buffer: OutboundBuffer) {
        let Some(lcb) = self.links.get_mut(id) else {
            return;
        };
        let Some(handle) = lcb.handle else {
            error!("{} has no handle, dropping frame", id);
            return;
        };
        let transport = lcb.transport;
        let flow = self.flows.get_mut(transport);
        let mtu = flow.mtu;

        let segments = if buffer.remaining() <= usize::from(mtu) {
            1
        } else if lcb.is_round_robin() {
            lcb.partial_segment_in_flight = true;
            1
        } else {
            let mut segments = buffer.segments_needed(mtu);
            if segments > flow.window {
                segments = flow.window;
                lcb.partial_segment_in_flight = true;
            }
            if segments > lcb.spare_quota() {
                segments = lcb.spare_quota();
                lcb.partial_segment_in_flight = true;
            }
            segments
        };
        if segments == 0 {
            lcb.partial_segment_in_flight = false;
            lcb.link_queue.push_front(buffer);
            return;
        }

        flow.consume_window(segments);
        if lcb.is_round_robin() {
            flow.charge_rr(segments);
        }
        lcb.sent_not_acked = lcb.sent_not_acked.saturating_add(segments);
        trace!(
            "{} -> {} segments on {} (window {}, unacked {}, rr {}/{})",
            id,
            segments,
            handle,
            flow.window,
            lcb.sent_not_acked,
            flow.rr_unacked,
            flow.rr_quota
        );

        buffer.stamp(segments, mtu);
        self.transport.send(handle, transport, buffer);
    }
}
