// Shared fakes for the integration tests.
//
// Every collaborator records what the link manager asked of it into one
// shared `Platform` so tests can assert on the full interaction log.

#![allow(dead_code)]

use acl_link_core::{
    AclTransport, BdAddr, ChannelEvent, ChannelId, ChannelLayer, ChannelRecord, ChannelVerdict,
    DeviceManager, HciCommands, HciHandle, HciStatus, LinkId, LinkManager, LinkManagerConfig,
    LinkRole, OutboundBuffer, SecDisconnectOutcome, TransportKind,
};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentBurst {
    pub handle: HciHandle,
    pub transport: TransportKind,
    pub segments: u16,
    pub channel: Option<ChannelId>,
    pub buffer: OutboundBuffer,
}

#[derive(Debug)]
pub struct Platform {
    // knobs
    pub create_ok: bool,
    pub role_switch_supported: bool,
    pub switch_ok: bool,
    pub power_pending: bool,
    pub sec_outcome: SecDisconnectOutcome,
    pub hci_disconnect_ok: bool,
    /// Channels that refuse to detach on a lower-layer failure
    pub sticky_channels: HashSet<ChannelId>,
    /// Frames handed back on the next congestion upcall
    pub congestion_frames: Vec<OutboundBuffer>,

    // log
    pub accepted: Vec<(BdAddr, LinkRole)>,
    pub rejected: Vec<(BdAddr, HciStatus)>,
    pub created: Vec<(BdAddr, TransportKind)>,
    pub hci_disconnects: Vec<(HciHandle, HciStatus)>,
    pub role_switches: Vec<(BdAddr, LinkRole)>,
    pub info_requests: Vec<HciHandle>,
    pub echo_requests: Vec<HciHandle>,
    pub acl_created: Vec<(BdAddr, HciHandle, LinkRole)>,
    pub acl_removed: Vec<(BdAddr, TransportKind)>,
    pub voice_dropped: Vec<BdAddr>,
    pub sec_disconnects: Vec<(HciHandle, HciStatus)>,
    pub sent: Vec<SentBurst>,
    pub channel_events: Vec<(ChannelId, ChannelEvent)>,
    pub fixed_disconnects: Vec<(u16, BdAddr, HciStatus)>,
    pub congestion: Vec<(ChannelId, bool)>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            create_ok: true,
            role_switch_supported: true,
            switch_ok: true,
            power_pending: false,
            sec_outcome: SecDisconnectOutcome::Started,
            hci_disconnect_ok: true,
            sticky_channels: HashSet::new(),
            congestion_frames: Vec::new(),
            accepted: Vec::new(),
            rejected: Vec::new(),
            created: Vec::new(),
            hci_disconnects: Vec::new(),
            role_switches: Vec::new(),
            info_requests: Vec::new(),
            echo_requests: Vec::new(),
            acl_created: Vec::new(),
            acl_removed: Vec::new(),
            voice_dropped: Vec::new(),
            sec_disconnects: Vec::new(),
            sent: Vec::new(),
            channel_events: Vec::new(),
            fixed_disconnects: Vec::new(),
            congestion: Vec::new(),
        }
    }
}

impl Platform {
    pub fn events_for(&self, cid: ChannelId) -> Vec<ChannelEvent> {
        self.channel_events
            .iter()
            .filter(|(c, _)| *c == cid)
            .map(|(_, e)| *e)
            .collect()
    }

    pub fn segments_sent(&self, handle: HciHandle) -> u32 {
        self.sent
            .iter()
            .filter(|b| b.handle == handle)
            .map(|b| u32::from(b.segments))
            .sum()
    }
}

pub type SharedPlatform = Arc<Mutex<Platform>>;

pub struct FakeHci(pub SharedPlatform);
pub struct FakeDevice(pub SharedPlatform);
pub struct FakeChannels(pub SharedPlatform);
pub struct FakeTransport(pub SharedPlatform);

impl HciCommands for FakeHci {
    fn accept_connection(&mut self, remote: BdAddr, role: LinkRole) {
        self.0.lock().accepted.push((remote, role));
    }

    fn reject_connection(&mut self, remote: BdAddr, reason: HciStatus) {
        self.0.lock().rejected.push((remote, reason));
    }

    fn create_connection(&mut self, remote: BdAddr, transport: TransportKind) -> bool {
        let mut p = self.0.lock();
        p.created.push((remote, transport));
        p.create_ok
    }

    fn disconnect(&mut self, handle: HciHandle, reason: HciStatus) -> bool {
        let mut p = self.0.lock();
        p.hci_disconnects.push((handle, reason));
        p.hci_disconnect_ok
    }

    fn switch_role(&mut self, remote: BdAddr, role: LinkRole) -> bool {
        let mut p = self.0.lock();
        p.role_switches.push((remote, role));
        p.switch_ok
    }

    fn send_info_request(&mut self, handle: HciHandle) {
        self.0.lock().info_requests.push(handle);
    }

    fn send_echo_request(&mut self, handle: HciHandle) {
        self.0.lock().echo_requests.push(handle);
    }
}

impl DeviceManager for FakeDevice {
    fn supports_role_switch(&self, _remote: BdAddr) -> bool {
        self.0.lock().role_switch_supported
    }

    fn power_mode_pending(&self, _remote: BdAddr) -> bool {
        self.0.lock().power_pending
    }

    fn acl_created(
        &mut self,
        remote: BdAddr,
        handle: HciHandle,
        role: LinkRole,
        _transport: TransportKind,
    ) {
        self.0.lock().acl_created.push((remote, handle, role));
    }

    fn acl_removed(&mut self, remote: BdAddr, transport: TransportKind) {
        self.0.lock().acl_removed.push((remote, transport));
    }

    fn drop_voice_links(&mut self, remote: BdAddr) {
        self.0.lock().voice_dropped.push(remote);
    }

    fn disconnect_link(&mut self, handle: HciHandle, reason: HciStatus) -> SecDisconnectOutcome {
        let mut p = self.0.lock();
        p.sec_disconnects.push((handle, reason));
        p.sec_outcome
    }
}

impl ChannelLayer for FakeChannels {
    fn dispatch(&mut self, cid: ChannelId, _local_cid: u16, event: ChannelEvent) -> ChannelVerdict {
        let mut p = self.0.lock();
        p.channel_events.push((cid, event));
        let fatal = matches!(
            event,
            ChannelEvent::LowerDisconnectIndication { .. }
                | ChannelEvent::LowerConnectConfirmNegative { .. }
        );
        if fatal && !p.sticky_channels.contains(&cid) {
            ChannelVerdict::Detach
        } else {
            ChannelVerdict::Retain
        }
    }

    fn fixed_channel_disconnected(
        &mut self,
        fixed_cid: u16,
        remote: BdAddr,
        reason: HciStatus,
        _transport: TransportKind,
    ) {
        self.0.lock().fixed_disconnects.push((fixed_cid, remote, reason));
    }

    fn congestion_changed(&mut self, cid: ChannelId, congested: bool) -> Vec<OutboundBuffer> {
        let mut p = self.0.lock();
        p.congestion.push((cid, congested));
        if congested {
            Vec::new()
        } else {
            std::mem::take(&mut p.congestion_frames)
        }
    }
}

impl AclTransport for FakeTransport {
    fn send(&mut self, handle: HciHandle, transport: TransportKind, buffer: OutboundBuffer) {
        self.0.lock().sent.push(SentBurst {
            handle,
            transport,
            segments: buffer.segments(),
            channel: buffer.channel,
            buffer,
        });
    }
}

pub struct Harness {
    pub manager: LinkManager,
    pub platform: SharedPlatform,
}

pub fn addr(last: u8) -> BdAddr {
    BdAddr::new([0x00, 0x1b, 0xdc, 0x0f, 0x10, last])
}

pub fn harness() -> Harness {
    harness_with(LinkManagerConfig::default())
}

pub fn harness_with(config: LinkManagerConfig) -> Harness {
    let platform: SharedPlatform = Arc::new(Mutex::new(Platform::default()));
    let manager = LinkManager::new(
        config,
        Box::new(FakeHci(Arc::clone(&platform))),
        Box::new(FakeDevice(Arc::clone(&platform))),
        Box::new(FakeChannels(Arc::clone(&platform))),
        Box::new(FakeTransport(Arc::clone(&platform))),
    )
    .expect("valid config");
    Harness { manager, platform }
}

impl Harness {
    pub fn platform(&self) -> MutexGuard<'_, Platform> {
        self.platform.lock()
    }

    /// Outbound connect that completes successfully on `handle`
    pub fn connected_link(
        &mut self,
        remote: BdAddr,
        transport: TransportKind,
        handle: u16,
    ) -> LinkId {
        let id = self.manager.connect(remote, transport).expect("connect");
        self.manager
            .on_connection_complete(remote, transport, HciHandle(handle), HciStatus::SUCCESS)
            .expect("connection complete");
        id
    }

    pub fn attach(&mut self, link: LinkId, local_cid: u16) -> ChannelId {
        self.manager
            .attach_channel(link, ChannelRecord::new(local_cid, link))
            .expect("attach channel")
    }

    /// Play the transport: mark the last burst for `handle` emitted and hand
    /// the buffer back
    pub fn return_last_burst(&mut self, handle: u16) {
        let burst = {
            let mut p = self.platform.lock();
            let index = p
                .sent
                .iter()
                .rposition(|b| b.handle == HciHandle(handle))
                .expect("a burst was sent");
            p.sent[index].buffer.clone()
        };
        let mut buffer = burst;
        buffer.mark_transmitted();
        if !buffer.is_complete() {
            self.manager
                .on_segments_transmitted(HciHandle(handle), buffer)
                .expect("segments accepted");
        }
    }
}

pub fn frame(len: usize) -> OutboundBuffer {
    OutboundBuffer::new(vec![0xa5; len])
}
