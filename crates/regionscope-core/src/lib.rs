//! regionscope-core: shared types, address matching, frame layouts and config.
//! All other regionscope crates depend on this one.

pub mod cidr;
pub mod config;
pub mod frame;
pub mod regions;
pub mod types;

pub use cidr::Cidr;
pub use types::{
    is_non_routable, normalize_ip, ClassifiedTarget, Direction, FlowKey, FlowSnapshot, FlowStats,
    Protocol, Role, SocketRecord, TcpState,
};
