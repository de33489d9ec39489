//! Per-flow terminators: stateful endpoints that turn a stream of packets
//! for one flow into data events for a handler, and handler writes back into
//! packets. Grounded on `original_source/lib/net/TcpTerminator.{hpp,cpp}` and
//! `UdpTerminator.{hpp,cpp}`.

pub mod tcp;
pub mod udp;

pub use tcp::{Disposition, TcpTerminator, TcpTerminatorHandler};
pub use udp::{UdpTerminator, UdpTerminatorHandler};
