// ACL Link Core: link manager and HCI transmit flow control
//
// Owns every physical link's connect/disconnect state machine, splits the
// controller's outstanding-buffer budget across links and channels, and
// drives ACL egress (with MTU segmentation) to the lower transport.

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod flow;
pub mod link;

use thiserror::Error;

pub use channel::{
    ChannelEvent, ChannelId, ChannelLayer, ChannelPool, ChannelRecord, ChannelVerdict, DataRate,
};
pub use config::{ConfigError, LinkManagerConfig, LinkTimeouts, TransportDescriptor};
pub use dispatch::{LinkDispatcher, LinkEvent};
pub use flow::{OutboundBuffer, TransportFlow};
pub use link::{
    AclTransport, BdAddr, DeviceManager, HciCommands, HciHandle, HciStatus, LinkControlBlock,
    LinkId, LinkManager, LinkPriority, LinkRole, LinkState, PingResult, SecDisconnectOutcome,
    SecurityStatus, TimerKey, TransportKind,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Link pool exhausted")]
    PoolExhausted,

    #[error("Channel pool exhausted")]
    ChannelPoolExhausted,

    #[error("Unknown link: {0}")]
    UnknownLink(String),

    #[error("Unknown handle: {0}")]
    UnknownHandle(HciHandle),

    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("Link already connected: {0}")]
    AlreadyConnected(BdAddr),

    #[error("Link is disconnecting: {0}")]
    Disconnecting(BdAddr),

    #[error("Event {event} not expected in state {state}")]
    UnexpectedState {
        state: LinkState,
        event: &'static str,
    },

    #[error("Link not connected: {0}")]
    NotConnected(BdAddr),

    #[error("Connect attempt could not be issued: {0}")]
    ConnectFailed(BdAddr),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Install a `tracing` subscriber honouring `RUST_LOG` (idempotent)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
