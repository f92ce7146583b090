//! Link-level identifiers and enums shared by the pool, the state machine
//! and the flow-control scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 48-bit remote device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Physical transport a link runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// BR/EDR baseband
    Classic,
    /// Bluetooth Low Energy
    LowEnergy,
}

impl TransportKind {
    pub const ALL: [TransportKind; 2] = [TransportKind::Classic, TransportKind::LowEnergy];

    /// Index into per-transport tables
    pub fn index(self) -> usize {
        match self {
            TransportKind::Classic => 0,
            TransportKind::LowEnergy => 1,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Classic => write!(f, "BR/EDR"),
            TransportKind::LowEnergy => write!(f, "LE"),
        }
    }
}

/// Controller-assigned connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HciHandle(pub u16);

impl fmt::Display for HciHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// HCI status / reason code as reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HciStatus(pub u8);

impl HciStatus {
    pub const SUCCESS: HciStatus = HciStatus(0x00);
    pub const MAX_NUM_OF_CONNECTIONS: HciStatus = HciStatus(0x09);
    pub const CONNECTION_EXISTS: HciStatus = HciStatus(0x0B);
    pub const HOST_REJECT_RESOURCES: HciStatus = HciStatus(0x0D);
    pub const HOST_REJECT_SECURITY: HciStatus = HciStatus(0x0E);
    pub const HOST_REJECT_DEVICE: HciStatus = HciStatus(0x0F);
    pub const PEER_USER: HciStatus = HciStatus(0x13);
    pub const CONN_CAUSE_LOCAL_HOST: HciStatus = HciStatus(0x16);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for HciStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Link state. An absent LCB is the disconnected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// Create or accept issued, waiting for connection complete
    Connecting,
    /// Waiting for a role switch on another link before connecting
    ConnectingWaitSwitch,
    /// Controller ran out of ACL slots; retried once another link frees one
    ConnectHolding,
    Connected,
    Disconnecting,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::ConnectingWaitSwitch => write!(f, "ConnectingWaitSwitch"),
            LinkState::ConnectHolding => write!(f, "ConnectHolding"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Baseband role of the local device on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkRole {
    Central,
    Peripheral,
}

/// ACL priority class, drives the quota allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LinkPriority {
    #[default]
    Normal,
    High,
}

/// Stable reference to a link pool slot.
///
/// The generation is bumped every time the slot is recycled, so a `LinkId`
/// held across a release (timer payloads, channel back-references) no
/// longer resolves once the slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId {
    pub slot: usize,
    pub generation: u32,
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lcb#{}.{}", self.slot, self.generation)
    }
}

/// Outcome reported to a ping (echo) requester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingResult {
    Ok,
    NoResponse,
    NoLink,
}
