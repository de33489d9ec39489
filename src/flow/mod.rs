//! Flow tracking: descriptor + bucketed map, grounded on `FlowDesc.hpp` and
//! `IpFlowMap.hpp`.

pub mod desc;
pub mod map;

pub use desc::FlowDescriptor;
pub use map::{Eviction, ExpiryMode, FlowMap};
