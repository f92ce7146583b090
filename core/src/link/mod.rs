//! Physical link management: the LCB pool, the connect/disconnect state
//! machine, timers and the platform seams it drives.

pub mod manager;
pub mod platform;
pub mod pool;
pub mod state_machine;
pub mod timer;
pub mod types;

pub use manager::{LinkManager, FIRST_FIXED_CID};
pub use platform::{AclTransport, DeviceManager, HciCommands, SecDisconnectOutcome, SecurityStatus};
pub use pool::{LinkControlBlock, LinkPool, PingCallback, PingCompletion};
pub use timer::{TimerKey, TimerQueue};
pub use types::{
    BdAddr, HciHandle, HciStatus, LinkId, LinkPriority, LinkRole, LinkState, PingResult,
    TransportKind,
};
