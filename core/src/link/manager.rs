//! Link Manager
//!
//! Aggregate owning the link pool, the channel registry, the per-transport
//! flow state, the scheduler cursor and the timer queue. Inbound events are
//! handled in `state_machine`, egress in `flow::scheduler`, acknowledgement
//! accounting in `flow::completion`; this file holds construction, the
//! upper-layer API and the helpers those modules share.

use crate::channel::{
    ChannelEvent, ChannelId, ChannelLayer, ChannelPool, ChannelRecord, ChannelVerdict, DataRate,
};
use crate::config::LinkManagerConfig;
use crate::flow::scheduler::SchedulerState;
use crate::flow::window::{FlowTable, TransportFlow};
use crate::link::platform::{AclTransport, DeviceManager, HciCommands};
use crate::link::pool::{LinkControlBlock, LinkPool, PingCallback, PingCompletion};
use crate::link::timer::{TimerKey, TimerQueue};
use crate::link::types::{
    BdAddr, HciHandle, HciStatus, LinkId, LinkPriority, LinkRole, LinkState, PingResult,
    TransportKind,
};
use crate::LinkError;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Channel id of fixed-channel slot 0
pub const FIRST_FIXED_CID: u16 = 0x0003;

pub struct LinkManager {
    pub(crate) config: LinkManagerConfig,
    pub(crate) links: LinkPool,
    pub(crate) channels: ChannelPool,
    pub(crate) flows: FlowTable,
    pub(crate) scheduler: SchedulerState,
    pub(crate) timers: TimerQueue,
    /// Latched ACL disconnect reason
    pub(crate) acl_disc_reason: HciStatus,
    /// Hold ping outcomes for the caller instead of running them in place
    pub(crate) defer_completions: bool,
    pub(crate) completions: Vec<PingCompletion>,
    pub(crate) hci: Box<dyn HciCommands>,
    pub(crate) device: Box<dyn DeviceManager>,
    pub(crate) channel_layer: Box<dyn ChannelLayer>,
    pub(crate) transport: Box<dyn AclTransport>,
}

impl LinkManager {
    pub fn new(
        config: LinkManagerConfig,
        hci: Box<dyn HciCommands>,
        device: Box<dyn DeviceManager>,
        channel_layer: Box<dyn ChannelLayer>,
        transport: Box<dyn AclTransport>,
    ) -> Result<Self, LinkError> {
        config.validate()?;
        info!(
            "Link manager up: {} links, {} channels, BR/EDR {:?}, LE {:?}",
            config.max_links, config.max_channels, config.classic, config.low_energy
        );
        Ok(Self {
            links: LinkPool::new(config.max_links, config.fixed_channel_slots),
            channels: ChannelPool::new(config.max_channels),
            flows: FlowTable::new(config.classic, config.low_energy),
            scheduler: SchedulerState::default(),
            timers: TimerQueue::new(),
            acl_disc_reason: HciStatus::SUCCESS,
            defer_completions: false,
            completions: Vec::new(),
            config,
            hci,
            device,
            channel_layer,
            transport,
        })
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn config(&self) -> &LinkManagerConfig {
        &self.config
    }

    pub fn link(&self, id: LinkId) -> Option<&LinkControlBlock> {
        self.links.get(id)
    }

    pub fn link_by_addr(
        &self,
        remote: BdAddr,
        transport: TransportKind,
    ) -> Option<&LinkControlBlock> {
        self.links
            .find_by_addr(remote, transport)
            .and_then(|id| self.links.get(id))
    }

    pub fn link_by_handle(&self, handle: HciHandle) -> Option<&LinkControlBlock> {
        self.links
            .find_by_handle(handle)
            .and_then(|id| self.links.get(id))
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkControlBlock> {
        self.links.iter()
    }

    pub fn channel(&self, cid: ChannelId) -> Option<&ChannelRecord> {
        self.channels.get(cid)
    }

    pub fn flow(&self, transport: TransportKind) -> &TransportFlow {
        self.flows.get(transport)
    }

    pub fn is_timer_armed(&self, key: TimerKey) -> bool {
        self.timers.is_armed(key)
    }

    pub fn next_deadline(&self) -> Option<tokio::time::Instant> {
        self.timers.next_deadline()
    }

    pub fn acl_disc_reason(&self) -> HciStatus {
        self.acl_disc_reason
    }

    // ------------------------------------------------------------------
    // Upper-layer API
    // ------------------------------------------------------------------

    /// Bring up (or reuse) the link to `remote`
    pub fn connect(
        &mut self,
        remote: BdAddr,
        transport: TransportKind,
    ) -> Result<LinkId, LinkError> {
        if let Some(id) = self.links.find_by_addr(remote, transport) {
            debug!("Connect to {} reuses {}", remote, id);
            return Ok(id);
        }

        let id = self.allocate_link(remote, transport)?;
        if !self.issue_connect(id) {
            warn!("Connect to {} could not be issued", remote);
            self.release_link(id);
            return Err(LinkError::ConnectFailed(remote));
        }
        Ok(id)
    }

    /// Controller reported its ACL buffer count for `transport`
    pub fn set_controller_buffers(&mut self, transport: TransportKind, buffers: u16) {
        info!("{} controller buffers: {}", transport, buffers);
        self.flows.get_mut(transport).set_total_buffers(buffers);
        self.adjust_allocation(transport);
    }

    /// Attach a channel record to `link`; the channel layer owns its lifetime
    pub fn attach_channel(
        &mut self,
        link: LinkId,
        mut record: ChannelRecord,
    ) -> Result<ChannelId, LinkError> {
        if self.links.get(link).is_none() {
            return Err(LinkError::UnknownLink(link.to_string()));
        }
        record.link = link;
        record.buffer_quota = self.channel_quota(record.tx_rate, record.rx_rate);
        let local_cid = record.local_cid;
        let cid = self
            .channels
            .allocate(record)
            .ok_or(LinkError::ChannelPoolExhausted)?;

        if let Some(lcb) = self.links.get_mut(link) {
            lcb.channels.push(cid);
            // a new channel ends the idle period
            if lcb.is_connected() && lcb.ping.is_none() {
                self.timers.cancel(TimerKey::Link(link));
            }
        }
        debug!("Channel {} (cid 0x{:04x}) attached to {}", cid, local_cid, link);
        Ok(cid)
    }

    /// The channel layer removed `cid`
    pub fn detach_channel(&mut self, cid: ChannelId) -> Result<(), LinkError> {
        let link = self
            .channels
            .get(cid)
            .map(|c| c.link)
            .ok_or(LinkError::UnknownChannel(cid))?;
        self.remove_channel(cid);

        if let Some(lcb) = self.links.get(link) {
            if lcb.is_connected() && !lcb.has_channels() && lcb.ping.is_none() {
                debug!("Last channel left {}, arming idle timer", link);
                let idle = self.config.timeouts.idle();
                self.arm_link_timer(link, idle);
            }
        }
        Ok(())
    }

    /// Mark `cid` as racing a reconnect against `link`'s teardown
    pub fn set_pending_channel(
        &mut self,
        link: LinkId,
        cid: Option<ChannelId>,
    ) -> Result<(), LinkError> {
        let lcb = self
            .links
            .get_mut(link)
            .ok_or_else(|| LinkError::UnknownLink(link.to_string()))?;
        lcb.pending_channel = cid;
        Ok(())
    }

    pub fn bind_fixed_channel(
        &mut self,
        link: LinkId,
        index: usize,
        cid: ChannelId,
    ) -> Result<(), LinkError> {
        if !self.channels.contains(cid) {
            return Err(LinkError::UnknownChannel(cid));
        }
        let lcb = self
            .links
            .get_mut(link)
            .ok_or_else(|| LinkError::UnknownLink(link.to_string()))?;
        let slot = lcb
            .fixed_channels
            .get_mut(index)
            .ok_or(LinkError::UnknownChannel(cid))?;
        *slot = Some(cid);
        Ok(())
    }

    pub fn set_channel_rates(
        &mut self,
        cid: ChannelId,
        tx_rate: DataRate,
        rx_rate: DataRate,
    ) -> Result<(), LinkError> {
        let channel = self
            .channels
            .get_mut(cid)
            .ok_or(LinkError::UnknownChannel(cid))?;
        channel.tx_rate = tx_rate;
        channel.rx_rate = rx_rate;
        self.adjust_channel_allocation();
        Ok(())
    }

    pub fn set_channel_awaiting_security(
        &mut self,
        cid: ChannelId,
        awaiting: bool,
    ) -> Result<(), LinkError> {
        self.channels
            .get_mut(cid)
            .map(|c| c.awaiting_security = awaiting)
            .ok_or(LinkError::UnknownChannel(cid))
    }

    pub fn set_channel_qos_interest(
        &mut self,
        cid: ChannelId,
        interested: bool,
    ) -> Result<(), LinkError> {
        self.channels
            .get_mut(cid)
            .map(|c| c.qos_interest = interested)
            .ok_or(LinkError::UnknownChannel(cid))
    }

    /// Change a link's ACL priority class
    pub fn set_priority(
        &mut self,
        remote: BdAddr,
        transport: TransportKind,
        priority: LinkPriority,
    ) -> Result<(), LinkError> {
        let id = self
            .links
            .find_by_addr(remote, transport)
            .ok_or_else(|| LinkError::UnknownLink(remote.to_string()))?;
        self.apply_priority(id, priority, false);
        Ok(())
    }

    /// Flag the link to `remote` as existing for dedicated bonding
    pub fn set_bonding(&mut self, remote: BdAddr, bonding: bool) -> Result<(), LinkError> {
        let id = self
            .links
            .find_by_addr(remote, TransportKind::Classic)
            .ok_or_else(|| LinkError::UnknownLink(remote.to_string()))?;
        if let Some(lcb) = self.links.get_mut(id) {
            lcb.is_bonding = bonding;
        }
        Ok(())
    }

    /// Echo `remote`; `callback` receives the outcome
    pub fn ping(
        &mut self,
        remote: BdAddr,
        callback: impl FnOnce(PingResult) + Send + 'static,
    ) -> Result<(), LinkError> {
        let callback = PingCallback::new(callback);
        let id = match self.links.find_by_addr(remote, TransportKind::Classic) {
            Some(id) => id,
            None => {
                let id = self.allocate_link(remote, TransportKind::Classic)?;
                if !self.issue_connect(id) {
                    self.release_link(id);
                    return Err(LinkError::ConnectFailed(remote));
                }
                id
            }
        };

        let echo = self.config.timeouts.echo();
        let lcb = self
            .links
            .get_mut(id)
            .ok_or_else(|| LinkError::UnknownLink(id.to_string()))?;
        if lcb.ping.is_some() {
            return Err(LinkError::UnexpectedState {
                state: lcb.state,
                event: "ping",
            });
        }
        match lcb.state {
            LinkState::Disconnecting => return Err(LinkError::Disconnecting(remote)),
            LinkState::Connected => {
                if let Some(handle) = lcb.handle {
                    self.hci.send_echo_request(handle);
                }
                lcb.ping = Some(callback);
                self.arm_link_timer(id, echo);
            }
            // sent once the connection completes
            _ => lcb.ping = Some(callback),
        }
        debug!("Ping to {} outstanding", remote);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    pub(crate) fn allocate_link(
        &mut self,
        remote: BdAddr,
        transport: TransportKind,
    ) -> Result<LinkId, LinkError> {
        let id = self
            .links
            .allocate(remote, transport)
            .ok_or(LinkError::PoolExhausted)?;
        info!("Allocated {} for {} over {}", id, remote, transport);
        self.adjust_allocation(transport);
        Ok(id)
    }

    /// Start a connection attempt, switching another link's role first if
    /// policy asks for it. Returns whether a command went out.
    pub(crate) fn issue_connect(&mut self, id: LinkId) -> bool {
        let Some(lcb) = self.links.get(id) else {
            return false;
        };
        if lcb.transport == TransportKind::Classic && self.config.role_switch_before_connect {
            let candidate = self
                .links
                .iter()
                .filter(|other| other.id != id && other.is_connected())
                .filter(|other| other.transport == TransportKind::Classic)
                .filter(|other| other.role == LinkRole::Peripheral)
                .map(|other| other.remote)
                .find(|remote| self.device.supports_role_switch(*remote));

            if let Some(other) = candidate {
                if self.hci.switch_role(other, LinkRole::Central) {
                    debug!("{} waits for role switch on {}", id, other);
                    if let Some(lcb) = self.links.get_mut(id) {
                        lcb.state = LinkState::ConnectingWaitSwitch;
                    }
                    let connect = self.config.timeouts.connect();
                    self.arm_link_timer(id, connect);
                    return true;
                }
            }
        }
        self.connect_after_switch(id)
    }

    pub(crate) fn connect_after_switch(&mut self, id: LinkId) -> bool {
        let Some(lcb) = self.links.get_mut(id) else {
            return false;
        };
        if !self.hci.create_connection(lcb.remote, lcb.transport) {
            warn!("Create connection to {} refused", lcb.remote);
            return false;
        }
        lcb.state = LinkState::Connecting;
        lcb.handle = None;
        info!("Connecting {} ({})", lcb.remote, id);
        let connect = self.config.timeouts.connect();
        self.arm_link_timer(id, connect);
        true
    }

    /// Tear down an LCB for good
    pub(crate) fn release_link(&mut self, id: LinkId) {
        self.timers.cancel(TimerKey::Link(id));
        self.timers.cancel(TimerKey::InfoResponse(id));
        let Some(mut lcb) = self.links.release(id) else {
            return;
        };
        info!("Released {} ({}), reason {}", id, lcb.remote, lcb.disc_reason);

        let flow = self.flows.get_mut(lcb.transport);
        if lcb.sent_not_acked > 0 {
            flow.restore_window(lcb.sent_not_acked);
            if lcb.is_round_robin() {
                flow.release_rr(lcb.sent_not_acked);
            }
        }
        if lcb.handle.is_some() {
            self.device.acl_removed(lcb.remote, lcb.transport);
        }
        for cid in lcb.channels.drain(..) {
            warn!("Channel {} still attached to released {}, dropping", cid, id);
            self.timers.cancel(TimerKey::ChannelDelay(cid));
            self.channels.release(cid);
        }
        if let Some(ping) = lcb.ping.take() {
            self.complete_ping(ping, PingResult::NoLink);
        }
        self.adjust_allocation(lcb.transport);
    }

    /// Drop `cid` from the registry and from its link
    pub(crate) fn remove_channel(&mut self, cid: ChannelId) {
        self.timers.cancel(TimerKey::ChannelDelay(cid));
        if let Some(record) = self.channels.release(cid) {
            if let Some(lcb) = self.links.get_mut(record.link) {
                lcb.detach(cid);
            }
            debug!("Channel {} (cid 0x{:04x}) detached", cid, record.local_cid);
        }
    }

    /// Send `event` to one channel and honour its verdict
    pub(crate) fn dispatch_one(&mut self, cid: ChannelId, event: ChannelEvent) {
        let Some(local_cid) = self.channels.get(cid).map(|c| c.local_cid) else {
            warn!("Dropping {} for vanished channel {}", event, cid);
            return;
        };
        debug!("{} -> channel {}", event, cid);
        if self.channel_layer.dispatch(cid, local_cid, event) == ChannelVerdict::Detach {
            self.remove_channel(cid);
        }
    }

    /// Send `event` to every channel attached to `id`, except `skip`
    pub(crate) fn dispatch_all(
        &mut self,
        id: LinkId,
        event: ChannelEvent,
        skip: Option<ChannelId>,
    ) {
        let targets: Vec<ChannelId> = match self.links.get(id) {
            Some(lcb) => lcb.channels.clone(),
            None => return,
        };
        for cid in targets.into_iter().filter(|cid| Some(*cid) != skip) {
            self.dispatch_one(cid, event);
        }
    }

    /// Report every fixed channel bound to `id` (except `keep`) as
    /// disconnected and release it
    pub(crate) fn release_fixed_channels(&mut self, id: LinkId, keep: Option<ChannelId>) {
        let Some(lcb) = self.links.get(id) else {
            return;
        };
        let (remote, reason, transport) = (lcb.remote, lcb.disc_reason, lcb.transport);
        let bound: Vec<(usize, ChannelId)> = lcb
            .fixed_channels
            .iter()
            .enumerate()
            .filter_map(|(index, cid)| cid.map(|cid| (index, cid)))
            .filter(|(_, cid)| Some(*cid) != keep)
            .collect();

        for (index, cid) in bound {
            let fixed_cid = FIRST_FIXED_CID + index as u16;
            self.channel_layer.fixed_channel_disconnected(fixed_cid, remote, reason, transport);
            self.remove_channel(cid);
        }
    }

    pub(crate) fn apply_priority(&mut self, id: LinkId, priority: LinkPriority, force: bool) {
        let Some(lcb) = self.links.get_mut(id) else {
            return;
        };
        if lcb.priority == priority && !force {
            return;
        }
        info!("{} priority {:?} -> {:?}", id, lcb.priority, priority);
        lcb.priority = priority;
        let transport = lcb.transport;
        self.adjust_allocation(transport);
    }

    pub(crate) fn arm_link_timer(&mut self, id: LinkId, after: Duration) {
        self.timers.arm(TimerKey::Link(id), after);
    }

    /// Report a ping outcome, or park it when the caller runs completions
    /// after leaving the dispatch context
    pub(crate) fn complete_ping(&mut self, ping: PingCallback, result: PingResult) {
        if self.defer_completions {
            self.completions.push(PingCompletion::new(ping, result));
        } else {
            ping.complete(result);
        }
    }

    /// Parked ping outcomes, oldest first
    pub fn take_completions(&mut self) -> Vec<PingCompletion> {
        std::mem::take(&mut self.completions)
    }
}
