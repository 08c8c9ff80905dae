pub mod capture;
pub mod classifier;
pub mod flows;
pub mod ip_ranges;
pub mod latency;
pub mod monitor;
pub mod providers;
pub mod sockets;
pub mod tracker;

pub use capture::{CaptureError, CaptureState, CaptureStats, FlowCapture};
pub use classifier::{rank_lobby, Classifier, ClassifierSettings};
pub use flows::FlowTable;
pub use ip_ranges::{IpRangeRegistry, RangeSource, RegistryError, RegistryStatus};
pub use latency::{
    LatencyBoard, LatencyReading, ProbeError, ProbeHost, RegionLatency, RegionSweep, Severity,
};
pub use monitor::{Discovery, MonitorSession, MonitorSettings, Snapshot, TargetStatus};
pub use sockets::{find_process_ids, SocketEnumerator, SocketSource, SourceError};
pub use tracker::{PinChange, PinnedTarget, TargetTracker};
