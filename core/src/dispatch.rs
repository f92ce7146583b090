//! Serialized dispatch context
//!
//! Every controller event, timer expiry and upper-layer call runs against
//! the link manager under one lock, one at a time. [`LinkDispatcher`] owns
//! that lock and a background task that fires timers as they fall due.
//! Ping callbacks run after the lock is released, so they may call back in.

use crate::channel::ChannelId;
use crate::flow::buffer::OutboundBuffer;
use crate::link::manager::LinkManager;
use crate::link::pool::PingCompletion;
use crate::link::platform::SecurityStatus;
use crate::link::types::{BdAddr, HciHandle, HciStatus, LinkRole, TransportKind};
use crate::LinkError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Inbound events from the controller and the security manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkEvent {
    ConnectionRequest {
        remote: BdAddr,
    },
    ConnectionComplete {
        remote: BdAddr,
        transport: TransportKind,
        handle: HciHandle,
        status: HciStatus,
    },
    DisconnectComplete {
        handle: HciHandle,
        reason: HciStatus,
    },
    RoleChanged {
        remote: Option<BdAddr>,
        role: LinkRole,
        status: HciStatus,
    },
    QosViolation {
        handle: HciHandle,
    },
    SecurityComplete {
        remote: BdAddr,
        transport: TransportKind,
        channel: ChannelId,
        status: SecurityStatus,
    },
    CompletedPackets {
        handle: HciHandle,
        count: u16,
    },
    SegmentsTransmitted {
        handle: HciHandle,
        buffer: OutboundBuffer,
    },
    PinCodeRequest {
        remote: BdAddr,
    },
    InfoResponse {
        handle: HciHandle,
    },
    EchoResponse {
        handle: HciHandle,
    },
    ControllerBuffers {
        transport: TransportKind,
        buffers: u16,
    },
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::ConnectionRequest { remote } => write!(f, "ConnectionRequest({})", remote),
            LinkEvent::ConnectionComplete {
                remote, status, ..
            } => write!(f, "ConnectionComplete({}, {})", remote, status),
            LinkEvent::DisconnectComplete { handle, reason } => {
                write!(f, "DisconnectComplete({}, {})", handle, reason)
            }
            LinkEvent::RoleChanged { role, status, .. } => {
                write!(f, "RoleChanged({:?}, {})", role, status)
            }
            LinkEvent::QosViolation { handle } => write!(f, "QosViolation({})", handle),
            LinkEvent::SecurityComplete {
                channel, status, ..
            } => write!(f, "SecurityComplete({}, {:?})", channel, status),
            LinkEvent::CompletedPackets { handle, count } => {
                write!(f, "CompletedPackets({}, {})", handle, count)
            }
            LinkEvent::SegmentsTransmitted { handle, .. } => {
                write!(f, "SegmentsTransmitted({})", handle)
            }
            LinkEvent::PinCodeRequest { remote } => write!(f, "PinCodeRequest({})", remote),
            LinkEvent::InfoResponse { handle } => write!(f, "InfoResponse({})", handle),
            LinkEvent::EchoResponse { handle } => write!(f, "EchoResponse({})", handle),
            LinkEvent::ControllerBuffers { transport, buffers } => {
                write!(f, "ControllerBuffers({}, {})", transport, buffers)
            }
        }
    }
}

impl LinkManager {
    /// Route one inbound event to its handler
    pub fn handle_event(&mut self, event: LinkEvent) -> Result<(), LinkError> {
        match event {
            LinkEvent::ConnectionRequest { remote } => self.on_connection_request(remote),
            LinkEvent::ConnectionComplete {
                remote,
                transport,
                handle,
                status,
            } => self.on_connection_complete(remote, transport, handle, status),
            LinkEvent::DisconnectComplete { handle, reason } => {
                self.on_disconnect_complete(handle, reason)
            }
            LinkEvent::RoleChanged {
                remote,
                role,
                status,
            } => self.on_role_changed(remote, role, status),
            LinkEvent::QosViolation { handle } => self.on_qos_violation(handle),
            LinkEvent::SecurityComplete {
                remote,
                transport,
                channel,
                status,
            } => self.on_security_complete(remote, transport, channel, status),
            LinkEvent::CompletedPackets { handle, count } => {
                self.on_completed_packets(handle, count)
            }
            LinkEvent::SegmentsTransmitted { handle, buffer } => {
                self.on_segments_transmitted(handle, buffer)
            }
            LinkEvent::PinCodeRequest { remote } => self.on_pin_code_request(remote),
            LinkEvent::InfoResponse { handle } => self.on_info_response(handle),
            LinkEvent::EchoResponse { handle } => self.on_echo_response(handle),
            LinkEvent::ControllerBuffers { transport, buffers } => {
                self.set_controller_buffers(transport, buffers);
                Ok(())
            }
        }
    }
}

/// Shared handle to a link manager plus its timer wake-up
#[derive(Clone)]
pub struct LinkDispatcher {
    manager: Arc<Mutex<LinkManager>>,
    timer_wake: Arc<Notify>,
}

impl LinkDispatcher {
    pub fn new(mut manager: LinkManager) -> Self {
        manager.defer_completions = true;
        Self {
            manager: Arc::new(Mutex::new(manager)),
            timer_wake: Arc::new(Notify::new()),
        }
    }

    /// Handle `event`; rejected events are logged and returned
    pub fn dispatch(&self, event: LinkEvent) -> Result<(), LinkError> {
        debug!("Dispatching {}", event);
        let result = self.with_manager(|m| m.handle_event(event));
        if let Err(e) = &result {
            warn!("Event rejected: {}", e);
        }
        result
    }

    /// Run `f` against the manager inside the dispatch context
    pub fn with_manager<R>(&self, f: impl FnOnce(&mut LinkManager) -> R) -> R {
        let (result, completions) = {
            let mut manager = self.manager.lock();
            let result = f(&mut *manager);
            (result, manager.take_completions())
        };
        self.timer_wake.notify_one();
        run_completions(completions);
        result
    }

    /// Fire every timer due now
    pub fn fire_due_timers(&self) -> usize {
        self.with_manager(|m| m.poll_timers(Instant::now()))
    }

    /// Fire timers as they fall due. Runs until the task is dropped.
    pub async fn run_timers(self) {
        loop {
            let next = self.manager.lock().next_deadline();
            match next {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {
                            let fired = self.fire_due_timers();
                            debug!("{} timers fired", fired);
                        }
                        _ = self.timer_wake.notified() => {}
                    }
                }
                None => self.timer_wake.notified().await,
            }
        }
    }
}

fn run_completions(completions: Vec<PingCompletion>) {
    for completion in completions {
        debug!("Ping finished: {:?}", completion.result());
        completion.run();
    }
}
