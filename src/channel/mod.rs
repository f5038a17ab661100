//! The agent channel protocol: one persistent duplex connection per agent,
//! initiated outbound from the agent. Text frames carry tagged JSON control
//! messages, binary frames carry VNC bytes with a fixed 16-byte header.

pub mod frame;
pub mod messages;
pub mod socket;

pub use frame::{Direction, FrameError, VncFrame, session_key};
pub use messages::{ChannelMessage, ResultStatus};
