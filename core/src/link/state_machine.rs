//! Link state machine
//!
//! Controller, security-manager and timer events applied to the LCB pool.
//! Handlers return `Err` when an event is rejected or refers to something
//! that no longer exists; the caller logs it and moves on.

use crate::channel::{ChannelEvent, ChannelId};
use crate::link::manager::LinkManager;
use crate::link::platform::{SecDisconnectOutcome, SecurityStatus};
use crate::link::timer::TimerKey;
use crate::link::types::{
    BdAddr, HciHandle, HciStatus, LinkId, LinkPriority, LinkRole, LinkState, PingResult,
    TransportKind,
};
use crate::LinkError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

impl LinkManager {
    /// Remote device pages us (BR/EDR only)
    pub fn on_connection_request(&mut self, remote: BdAddr) -> Result<(), LinkError> {
        let Some(id) = self.links.find_by_addr(remote, TransportKind::Classic) else {
            return self.accept_new_connection(remote);
        };

        let state = self.links.get(id).map(|l| l.state);
        match state {
            // our own page collided with theirs
            Some(LinkState::Connecting) | Some(LinkState::ConnectHolding) => {
                let role = self.inbound_role(remote);
                self.hci.accept_connection(remote, role);
                if let Some(lcb) = self.links.get_mut(id) {
                    lcb.role = role;
                    lcb.state = LinkState::Connecting;
                }
                info!("Accepted colliding connection from {} as {:?}", remote, role);
                Ok(())
            }
            Some(LinkState::Disconnecting) => {
                self.hci.reject_connection(remote, HciStatus::HOST_REJECT_DEVICE);
                Err(LinkError::Disconnecting(remote))
            }
            Some(state) => {
                error!("Connection request from {} in state {}", remote, state);
                self.hci.reject_connection(remote, HciStatus::CONNECTION_EXISTS);
                Err(LinkError::AlreadyConnected(remote))
            }
            None => Err(LinkError::UnknownLink(id.to_string())),
        }
    }

    fn accept_new_connection(&mut self, remote: BdAddr) -> Result<(), LinkError> {
        let id = match self.allocate_link(remote, TransportKind::Classic) {
            Ok(id) => id,
            Err(e) => {
                error!("No LCB for inbound connection from {}: {}", remote, e);
                self.hci.reject_connection(remote, HciStatus::HOST_REJECT_RESOURCES);
                return Err(e);
            }
        };

        let other_links = self.links.iter().any(|lcb| lcb.id != id);
        let role = if other_links {
            LinkRole::Central
        } else {
            self.inbound_role(remote)
        };
        self.hci.accept_connection(remote, role);

        if let Some(lcb) = self.links.get_mut(id) {
            lcb.role = role;
            lcb.state = LinkState::Connecting;
        }
        let connect = self.config.timeouts.connect();
        self.arm_link_timer(id, connect);
        info!("Accepting connection from {} as {:?} ({})", remote, role, id);
        Ok(())
    }

    /// Role to accept with when no other link constrains us
    fn inbound_role(&self, remote: BdAddr) -> LinkRole {
        if self.device.supports_role_switch(remote) {
            self.config.preferred_role
        } else {
            LinkRole::Peripheral
        }
    }

    /// Controller finished a create/accept
    pub fn on_connection_complete(
        &mut self,
        remote: BdAddr,
        transport: TransportKind,
        handle: HciHandle,
        status: HciStatus,
    ) -> Result<(), LinkError> {
        let id = self
            .links
            .find_by_addr(remote, transport)
            .ok_or_else(|| LinkError::UnknownLink(remote.to_string()))?;
        let state = self
            .links
            .get(id)
            .map(|l| l.state)
            .ok_or_else(|| LinkError::UnknownLink(id.to_string()))?;

        if state != LinkState::Connecting {
            error!(
                "Connection complete for {} in state {} (status {})",
                remote, state, status
            );
            if !status.is_success() {
                self.link_down(id, status);
            }
            return Err(LinkError::UnexpectedState {
                state,
                event: "connection complete",
            });
        }

        if status.is_success() {
            self.connection_up(id, handle);
            return Ok(());
        }

        if status == HciStatus::MAX_NUM_OF_CONNECTIONS
            && self.links.any_in_state(LinkState::Disconnecting)
        {
            info!("Controller full, holding connect to {} for a free slot", remote);
            if let Some(lcb) = self.links.get_mut(id) {
                lcb.state = LinkState::ConnectHolding;
                lcb.handle = None;
            }
            return Ok(());
        }

        warn!("Connection to {} failed: {}", remote, status);
        if let Some(lcb) = self.links.get_mut(id) {
            lcb.state = LinkState::Disconnecting;
            lcb.handle = None;
        }
        self.dispatch_all(id, ChannelEvent::LowerConnectConfirmNegative { status }, None);
        if let Some(lcb) = self.links.get_mut(id) {
            lcb.disc_reason = status;
        }

        let has_channels = self.links.get(id).is_some_and(|l| l.has_channels());
        if !has_channels {
            self.release_link(id);
        } else if status == HciStatus::CONNECTION_EXISTS {
            // remote is connecting to us; its request arrives next
            if let Some(lcb) = self.links.get_mut(id) {
                lcb.state = LinkState::Connecting;
            }
        } else if !self.issue_connect(id) {
            warn!("Retry connect to {} could not be issued", remote);
            self.dispatch_all(id, ChannelEvent::LowerDisconnectIndication { reason: None }, None);
            self.release_link(id);
        }
        Ok(())
    }

    fn connection_up(&mut self, id: LinkId, handle: HciHandle) {
        let info_response = self.config.timeouts.info_response();
        let Some(lcb) = self.links.get_mut(id) else {
            return;
        };
        lcb.state = LinkState::Connected;
        lcb.handle = Some(handle);
        lcb.awaiting_info_rsp = true;
        let (remote, role, transport) = (lcb.remote, lcb.role, lcb.transport);
        info!("{} connected to {} on handle {}", id, remote, handle);

        // a successful connection clears the security latch
        self.acl_disc_reason = HciStatus::SUCCESS;
        self.hci.send_info_request(handle);
        self.timers.arm(TimerKey::InfoResponse(id), info_response);
        self.device.acl_created(remote, handle, role, transport);
        self.timers.cancel(TimerKey::Link(id));

        self.dispatch_all(id, ChannelEvent::LowerConnectConfirmed, None);

        let Some(lcb) = self.links.get(id) else {
            return;
        };
        if lcb.ping.is_some() {
            self.hci.send_echo_request(handle);
            let echo = self.config.timeouts.echo();
            self.arm_link_timer(id, echo);
        } else if !lcb.has_channels() {
            let startup = self.config.timeouts.startup();
            self.arm_link_timer(id, startup);
        }

        // frames queued while connecting
        self.check_send_packets(Some(id), false);
    }

    /// Security manager finished a procedure for `cid`
    pub fn on_security_complete(
        &mut self,
        remote: BdAddr,
        transport: TransportKind,
        cid: ChannelId,
        status: SecurityStatus,
    ) -> Result<(), LinkError> {
        let id = self
            .links
            .find_by_addr(remote, transport)
            .ok_or_else(|| LinkError::UnknownLink(remote.to_string()))?;
        if !self.links.get(id).is_some_and(|l| l.channels.contains(&cid)) {
            debug!("Security result for {} not attached to {}", cid, id);
            return Err(LinkError::UnknownChannel(cid));
        }

        match status {
            SecurityStatus::Success | SecurityStatus::SuccessNoSecurity => {
                self.dispatch_one(cid, ChannelEvent::SecurityComplete)
            }
            SecurityStatus::DelayCheck => {
                debug!("Encryption change pending on {}, re-checking later", cid);
                let delay = self.config.timeouts.security_delay_check();
                self.timers.arm(TimerKey::ChannelDelay(cid), delay);
            }
            SecurityStatus::Failed(code) => {
                self.dispatch_one(cid, ChannelEvent::SecurityCompleteNegative { status: code })
            }
        }
        Ok(())
    }

    /// Controller reported the ACL gone
    pub fn on_disconnect_complete(
        &mut self,
        handle: HciHandle,
        reason: HciStatus,
    ) -> Result<(), LinkError> {
        let Some(id) = self.links.find_by_handle(handle) else {
            debug!("Disconnect complete for unknown handle {} (voice link?)", handle);
            self.promote_holding();
            return Err(LinkError::UnknownHandle(handle));
        };
        self.link_down(id, reason);
        Ok(())
    }

    /// The ACL of `id` is gone: tell its channels, then reconnect for the
    /// ones still attached or release the LCB
    fn link_down(&mut self, id: LinkId, reason: HciStatus) {
        if self.acl_disc_reason != HciStatus::HOST_REJECT_SECURITY {
            self.acl_disc_reason = reason;
        }
        let latched = self.acl_disc_reason;
        let (remote, transport, pending) = match self.links.get_mut(id) {
            Some(lcb) => {
                lcb.disc_reason = latched;
                lcb.state = LinkState::Disconnecting;
                (lcb.remote, lcb.transport, lcb.pending_channel)
            }
            None => return,
        };
        info!("{} ({}) disconnected, reason {}", id, remote, reason);

        self.dispatch_all(
            id,
            ChannelEvent::LowerDisconnectIndication {
                reason: Some(reason),
            },
            pending,
        );
        if transport == TransportKind::Classic {
            self.device.drop_voice_links(remote);
        }

        let mut freed = true;
        let retry = self
            .links
            .get(id)
            .is_some_and(|l| l.has_channels() || l.pending_channel.is_some());
        if retry {
            info!("Channels still want {}, reconnecting", remote);
            self.prepare_reconnect(id, pending);
            if self.issue_connect(id) {
                freed = false;
            }
        }
        if let Some(lcb) = self.links.get_mut(id) {
            lcb.pending_channel = None;
        }

        if freed {
            self.release_link(id);
            self.promote_holding();
        }
    }

    /// Reset an LCB that is about to be reused for a fresh connect
    fn prepare_reconnect(&mut self, id: LinkId, pending: Option<ChannelId>) {
        let Some(lcb) = self.links.get_mut(id) else {
            return;
        };
        if lcb.transport == TransportKind::LowEnergy {
            lcb.link_queue.clear();
            let remote = lcb.remote;
            self.device.acl_removed(remote, TransportKind::LowEnergy);
        }

        self.release_fixed_channels(id, pending);

        let Some(lcb) = self.links.get_mut(id) else {
            return;
        };
        let flow = self.flows.get_mut(lcb.transport);
        if lcb.sent_not_acked > 0 {
            flow.restore_window(lcb.sent_not_acked);
            if lcb.is_round_robin() {
                flow.release_rr(lcb.sent_not_acked);
            }
            lcb.sent_not_acked = 0;
        }
        lcb.partial_segment_in_flight = false;
        lcb.handle = None;
        lcb.awaiting_info_rsp = false;
        self.timers.cancel(TimerKey::Link(id));
        self.timers.cancel(TimerKey::InfoResponse(id));
    }

    /// Give the oldest held connect attempt the slot that just opened up
    fn promote_holding(&mut self) {
        if let Some(id) = self.links.find_oldest_in_state(LinkState::ConnectHolding) {
            info!("Retrying held connect on {}", id);
            if !self.issue_connect(id) {
                warn!("Held connect on {} could not be issued", id);
            }
        }
    }

    /// Role change finished on some link
    pub fn on_role_changed(
        &mut self,
        remote: Option<BdAddr>,
        role: LinkRole,
        status: HciStatus,
    ) -> Result<(), LinkError> {
        if let Some(remote) = remote {
            if let Some(id) = self.links.find_by_addr(remote, TransportKind::Classic) {
                let priority = match self.links.get_mut(id) {
                    Some(lcb) => {
                        lcb.role = role;
                        lcb.priority
                    }
                    None => LinkPriority::Normal,
                };
                debug!("{} now {:?} (status {})", remote, role, status);
                if status.is_success() && priority == LinkPriority::High {
                    self.apply_priority(id, priority, true);
                }
            }
        }

        let waiting: Vec<LinkId> = self
            .links
            .iter()
            .filter(|lcb| lcb.state == LinkState::ConnectingWaitSwitch)
            .map(|lcb| lcb.id)
            .collect();
        for id in waiting {
            if !self.connect_after_switch(id) {
                warn!("Connect after role switch failed for {}", id);
                self.dispatch_all(
                    id,
                    ChannelEvent::LowerDisconnectIndication { reason: None },
                    None,
                );
                self.release_link(id);
            }
        }
        Ok(())
    }

    pub fn on_qos_violation(&mut self, handle: HciHandle) -> Result<(), LinkError> {
        let id = self
            .links
            .find_by_handle(handle)
            .ok_or(LinkError::UnknownHandle(handle))?;
        let interested: Vec<ChannelId> = match self.links.get(id) {
            Some(lcb) => lcb
                .channels
                .iter()
                .copied()
                .filter(|cid| self.channels.get(*cid).is_some_and(|c| c.qos_interest))
                .collect(),
            None => Vec::new(),
        };
        warn!("QoS violation on {} ({} channels notified)", handle, interested.len());
        for cid in interested {
            self.dispatch_one(cid, ChannelEvent::QosViolation);
        }
        Ok(())
    }

    /// Remote wants a PIN: give the user longer to answer
    pub fn on_pin_code_request(&mut self, remote: BdAddr) -> Result<(), LinkError> {
        let id = self
            .links
            .find_by_addr(remote, TransportKind::Classic)
            .ok_or_else(|| LinkError::UnknownLink(remote.to_string()))?;
        if self.links.get(id).is_some_and(|l| !l.has_channels()) {
            let extended = self.config.timeouts.connect_extended();
            self.arm_link_timer(id, extended);
        }
        Ok(())
    }

    /// Peer answered our information request
    pub fn on_info_response(&mut self, handle: HciHandle) -> Result<(), LinkError> {
        let id = self
            .links
            .find_by_handle(handle)
            .ok_or(LinkError::UnknownHandle(handle))?;
        self.timers.cancel(TimerKey::InfoResponse(id));
        let Some(lcb) = self.links.get_mut(id) else {
            return Err(LinkError::UnknownHandle(handle));
        };
        lcb.awaiting_info_rsp = false;
        if lcb.state != LinkState::Disconnecting {
            self.dispatch_all(id, ChannelEvent::InfoResponse, None);
        }
        Ok(())
    }

    pub fn on_echo_response(&mut self, handle: HciHandle) -> Result<(), LinkError> {
        let id = self
            .links
            .find_by_handle(handle)
            .ok_or(LinkError::UnknownHandle(handle))?;
        let Some(ping) = self.links.get_mut(id).and_then(|l| l.ping.take()) else {
            debug!("Unsolicited echo response on {}", handle);
            return Ok(());
        };
        self.timers.cancel(TimerKey::Link(id));
        self.complete_ping(ping, PingResult::Ok);

        if self.links.get(id).is_some_and(|l| !l.has_channels()) {
            let idle = self.config.timeouts.idle();
            self.arm_link_timer(id, idle);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Fire every timer due at `now`; returns how many fired
    pub fn poll_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(key) = self.timers.pop_due(now) {
            self.on_timer_expired(key);
            fired += 1;
        }
        fired
    }

    pub fn on_timer_expired(&mut self, key: TimerKey) {
        self.timers.cancel(key);
        match key {
            TimerKey::Link(id) => {
                if self.links.get(id).is_none() {
                    debug!("Ignoring stale link timer for {}", id);
                    return;
                }
                self.link_timeout(id);
            }
            TimerKey::InfoResponse(id) => self.info_timeout(id),
            TimerKey::ChannelDelay(cid) => {
                if self.channels.contains(cid) {
                    self.dispatch_one(cid, ChannelEvent::Timeout);
                } else {
                    debug!("Ignoring stale channel timer for {}", cid);
                }
            }
        }
    }

    fn link_timeout(&mut self, id: LinkId) {
        let Some(state) = self.links.get(id).map(|l| l.state) else {
            return;
        };
        if state != LinkState::Connected {
            warn!("{} timed out in state {}", id, state);
            if let Some(lcb) = self.links.get_mut(id) {
                lcb.pending_channel = None;
            }
            self.dispatch_all(id, ChannelEvent::LowerDisconnectIndication { reason: None }, None);
            self.release_link(id);
            return;
        }

        if let Some(ping) = self.links.get_mut(id).and_then(|l| l.ping.take()) {
            warn!("Echo on {} unanswered", id);
            self.complete_ping(ping, PingResult::NoResponse);
            self.dispatch_all(id, ChannelEvent::LowerDisconnectIndication { reason: None }, None);
        }

        let Some(lcb) = self.links.get(id) else {
            return;
        };
        if lcb.has_channels() {
            // flow-control retry
            self.check_send_packets(Some(id), false);
            return;
        }
        let Some(handle) = lcb.handle else {
            error!("Connected {} without a handle", id);
            return;
        };
        let is_bonding = lcb.is_bonding;

        debug!("{} idle, disconnecting", id);
        match self.device.disconnect_link(handle, HciStatus::PEER_USER) {
            SecDisconnectOutcome::Stored | SecDisconnectOutcome::Busy => {}
            SecDisconnectOutcome::Started => self.enter_disconnecting(id, true),
            SecDisconnectOutcome::AlreadyDone => {
                self.release_fixed_channels(id, None);
                self.enter_disconnecting(id, false);
            }
            SecDisconnectOutcome::Failed => {
                if is_bonding && self.hci.disconnect(handle, HciStatus::PEER_USER) {
                    self.release_fixed_channels(id, None);
                    self.enter_disconnecting(id, true);
                } else {
                    let retry = self.config.timeouts.no_resources_retry();
                    self.arm_link_timer(id, retry);
                }
            }
        }
    }

    fn enter_disconnecting(&mut self, id: LinkId, arm_timer: bool) {
        if let Some(lcb) = self.links.get_mut(id) {
            lcb.state = LinkState::Disconnecting;
        }
        if arm_timer {
            let disconnect = self.config.timeouts.disconnect();
            self.arm_link_timer(id, disconnect);
        }
    }

    fn info_timeout(&mut self, id: LinkId) {
        let Some(lcb) = self.links.get(id) else {
            return;
        };
        if !lcb.awaiting_info_rsp {
            return;
        }
        let securing = lcb
            .channels
            .iter()
            .any(|cid| self.channels.get(*cid).is_some_and(|c| c.awaiting_security));
        if securing {
            debug!("Info response on {} overdue, security still running", id);
            let info_response = self.config.timeouts.info_response();
            self.timers.arm(TimerKey::InfoResponse(id), info_response);
            return;
        }

        let disconnecting = lcb.state == LinkState::Disconnecting;
        if let Some(lcb) = self.links.get_mut(id) {
            lcb.awaiting_info_rsp = false;
        }
        debug!("Info response on {} timed out", id);
        if !disconnecting {
            self.dispatch_all(id, ChannelEvent::InfoResponse, None);
        }
    }
}
