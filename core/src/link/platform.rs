//! Outbound collaborator interfaces
//!
//! The link manager never touches hardware. Commands go to the HCI layer,
//! security/ACL bookkeeping to the device manager, and framed buffers to the
//! ACL transport. Every call is made from the serialized dispatch context.

use crate::flow::buffer::OutboundBuffer;
use crate::link::types::{BdAddr, HciHandle, HciStatus, LinkRole, TransportKind};
use serde::{Deserialize, Serialize};

/// Result of a security procedure, as reported by the security manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityStatus {
    Success,
    /// Success without any security applied
    SuccessNoSecurity,
    /// Encryption change not seen yet; check again after a grace period
    DelayCheck,
    Failed(u8),
}

/// Outcome of asking the security manager to take a link down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecDisconnectOutcome {
    /// Request stored; the security manager disconnects later
    Stored,
    /// Disconnect command issued
    Started,
    /// Nothing left to do here, the security manager releases the link
    AlreadyDone,
    /// A security procedure is running; leave the link up
    Busy,
    /// Request refused (typically no command buffer)
    Failed,
}

/// HCI link-layer commands
#[cfg_attr(test, mockall::automock)]
pub trait HciCommands: Send {
    fn accept_connection(&mut self, remote: BdAddr, role: LinkRole);

    fn reject_connection(&mut self, remote: BdAddr, reason: HciStatus);

    /// Page (or LE-connect to) `remote`; `false` if the command could not be queued
    fn create_connection(&mut self, remote: BdAddr, transport: TransportKind) -> bool;

    /// `false` if the command could not be queued
    fn disconnect(&mut self, handle: HciHandle, reason: HciStatus) -> bool;

    /// Request a role switch on an existing link
    fn switch_role(&mut self, remote: BdAddr, role: LinkRole) -> bool;

    /// Ask the peer for its extended feature mask
    fn send_info_request(&mut self, handle: HciHandle);

    fn send_echo_request(&mut self, handle: HciHandle);
}

/// Device / security manager
#[cfg_attr(test, mockall::automock)]
pub trait DeviceManager: Send {
    fn supports_role_switch(&self, remote: BdAddr) -> bool;

    /// A power-mode change is in progress for `remote`
    fn power_mode_pending(&self, remote: BdAddr) -> bool;

    fn acl_created(
        &mut self,
        remote: BdAddr,
        handle: HciHandle,
        role: LinkRole,
        transport: TransportKind,
    );

    fn acl_removed(&mut self, remote: BdAddr, transport: TransportKind);

    /// Drop any voice links riding on the ACL to `remote`
    fn drop_voice_links(&mut self, remote: BdAddr);

    /// Graceful teardown of an idle link
    fn disconnect_link(&mut self, handle: HciHandle, reason: HciStatus) -> SecDisconnectOutcome;
}

/// Lower transport (HCI ACL data path)
#[cfg_attr(test, mockall::automock)]
pub trait AclTransport: Send {
    /// Emit the segments stamped on `buffer` for `handle`
    fn send(&mut self, handle: HciHandle, transport: TransportKind, buffer: OutboundBuffer);
}
