#![forbid(unsafe_code)]

pub mod addr;
pub mod checksum;
pub mod config;
pub mod dns;
pub mod error;
pub mod flow;
pub mod iface;
pub mod packet;
pub mod term;

pub use config::{DnsConfig, TcpTerminatorConfig, TermConfig, UdpTerminatorConfig};
pub use dns::{DnsOwner, DnsResolver, IfaceConfig, LookupResult, SrvRecord};
pub use error::{Result, TermError};
pub use flow::{Eviction, ExpiryMode, FlowDescriptor, FlowMap};
pub use iface::{EventLoop, LoopEndCallback, OwnerTask, PacketSink, PacketSource, TimerCallback, TimerHandle, TimerManager};
pub use packet::{Packet, Proto};
pub use term::{Disposition, TcpTerminator, TcpTerminatorHandler, UdpTerminator, UdpTerminatorHandler};
