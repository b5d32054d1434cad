pub mod connection;
pub mod frames;

pub use connection::{dispatch, run_outbound, should_deliver, Connection, ConnectionState, FrameSink};
pub use frames::{Command, InboundFrame, InboundKind, OutboundFrame, OutboundKind};
