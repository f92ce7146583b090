//! Quota allocator
//!
//! Splits a transport's controller buffers between high-priority links,
//! normal links with a private quota and the shared round-robin pool, and
//! sizes each channel's outbound-queue allowance.

use crate::channel::DataRate;
use crate::link::manager::LinkManager;
use crate::link::timer::TimerKey;
use crate::link::types::{LinkPriority, TransportKind};
use tracing::{debug, info};

/// Result of one allocator run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Private quota of every high-priority link
    pub high_quota: u16,
    /// Base private quota of every normal link (0 = round-robin)
    pub normal_quota: u16,
    /// The first `remainder` normal links get one extra buffer
    pub remainder: u16,
    /// Shared budget for round-robin links
    pub rr_quota: u16,
}

/// Split `total` controller buffers across the active links.
///
/// High-priority links are served first, shrinking their quota until at
/// least one buffer is left for normal links. Normal links share what is
/// left, or fall back to round robin when there are more of them than
/// buffers.
pub fn compute_allocation(
    total: u16,
    high_links: u16,
    normal_links: u16,
    high_priority_quota: u16,
) -> Allocation {
    let reserve = u32::from(normal_links > 0);
    let mut high_quota = high_priority_quota;
    while high_quota > 0
        && u32::from(high_links) * u32::from(high_quota) + reserve > u32::from(total)
    {
        high_quota -= 1;
    }

    if high_quota == 0 {
        // not even one buffer per link: everybody shares
        return Allocation {
            high_quota: 0,
            normal_quota: 0,
            remainder: 0,
            rr_quota: total,
        };
    }

    let high_total = high_links * high_quota;
    let pool = if high_total < total {
        total - high_total
    } else {
        1
    };

    if normal_links == 0 {
        Allocation {
            high_quota,
            normal_quota: 0,
            remainder: 0,
            rr_quota: 0,
        }
    } else if normal_links > pool {
        Allocation {
            high_quota,
            normal_quota: 0,
            remainder: 0,
            rr_quota: pool,
        }
    } else {
        Allocation {
            high_quota,
            normal_quota: pool / normal_links,
            remainder: pool % normal_links,
            rr_quota: 0,
        }
    }
}

impl LinkManager {
    /// Re-run the allocator for `transport` after its active set, a
    /// priority or the controller buffer count changed
    pub(crate) fn adjust_allocation(&mut self, transport: TransportKind) {
        let ids: Vec<_> = self
            .links
            .iter()
            .filter(|lcb| lcb.transport == transport)
            .map(|lcb| lcb.id)
            .collect();
        let high = self
            .links
            .iter()
            .filter(|lcb| lcb.transport == transport && lcb.priority == LinkPriority::High)
            .count() as u16;
        let normal = ids.len() as u16 - high;

        let flow = self.flows.get_mut(transport);
        flow.high_priority_links = high;
        flow.normal_priority_links = normal;

        if ids.is_empty() {
            debug!("No {} links, flow state reset", transport);
            flow.reset();
            return;
        }

        let alloc = compute_allocation(
            flow.total_buffers,
            high,
            normal,
            self.config.high_priority_quota,
        );
        flow.rr_quota = alloc.rr_quota;
        info!(
            "{} allocation: {} high x {}, {} normal x {} (+{}), round robin {}",
            transport,
            high,
            alloc.high_quota,
            normal,
            alloc.normal_quota,
            alloc.remainder,
            alloc.rr_quota
        );

        let flow_control = self.config.timeouts.flow_control();
        let mut remainder = alloc.remainder;
        for id in ids {
            let Some(lcb) = self.links.get_mut(id) else {
                continue;
            };
            let quota = match lcb.priority {
                LinkPriority::High => alloc.high_quota,
                LinkPriority::Normal if alloc.normal_quota > 0 && remainder > 0 => {
                    remainder -= 1;
                    alloc.normal_quota + 1
                }
                LinkPriority::Normal => alloc.normal_quota,
            };

            // keep the shared counter covering exactly the round-robin links
            let flow = self.flows.get_mut(transport);
            if lcb.xmit_quota > 0 && quota == 0 {
                flow.charge_rr(lcb.sent_not_acked);
            } else if lcb.xmit_quota == 0 && quota > 0 {
                flow.release_rr(lcb.sent_not_acked);
            }
            lcb.xmit_quota = quota;
            debug!(
                "{} quota {} ({} unacked)",
                id, lcb.xmit_quota, lcb.sent_not_acked
            );

            if lcb.is_connected() && !lcb.link_queue.is_empty() && lcb.spare_quota() > 0 {
                self.timers.arm(TimerKey::Link(id), flow_control);
            }
        }

        self.adjust_channel_allocation();
    }

    /// Outbound-queue allowance for a channel with these rates
    pub(crate) fn channel_quota(&self, tx_rate: DataRate, rx_rate: DataRate) -> u32 {
        (tx_rate.weight() + rx_rate.weight()) * self.config.channel_buffer_unit
    }

    /// Resize every channel's allowance and report congestion changes
    pub(crate) fn adjust_channel_allocation(&mut self) {
        let unit = self.config.channel_buffer_unit;
        let changed: Vec<_> = self
            .channels
            .iter_mut()
            .filter_map(|(cid, channel)| {
                channel.buffer_quota = (channel.tx_rate.weight() + channel.rx_rate.weight()) * unit;
                channel.update_congestion().map(|congested| (cid, congested))
            })
            .collect();
        for (cid, congested) in changed {
            self.notify_congestion(cid, congested);
        }
    }
}
