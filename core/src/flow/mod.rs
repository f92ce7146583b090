//! HCI transmit flow control: controller window bookkeeping, the quota
//! allocator, the egress scheduler and completion accounting.

pub mod buffer;
pub mod completion;
pub mod quota;
pub mod scheduler;
pub mod window;

pub use buffer::OutboundBuffer;
pub use quota::{compute_allocation, Allocation};
pub use scheduler::SchedulerState;
pub use window::{FlowTable, TransportFlow};
