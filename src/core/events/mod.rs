//! # Events
//!
//! Process/socket events observed by the kernel instrumentation. A
//! `CaptureEvent` is an owned value: whoever polls it consumes it and it is
//! released when dropped, at the end of the loop iteration processing it.

use std::{fmt, net::IpAddr, time::Duration};

use thiserror::Error;

pub(crate) mod bpf;
pub(crate) mod preprocess;

pub(crate) const IPPROTO_TCP: u8 = 6;
pub(crate) const IPPROTO_UDP: u8 = 17;

#[derive(Debug, Error)]
pub(crate) enum EventSourceError {
    #[error("Unable to load eBPF object {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("eBPF object has no '{0}' ring buffer map")]
    MissingMap(String),
    #[error("Unable to attach eBPF program {name}: {reason}")]
    Attach { name: String, reason: String },
    #[error("Unexpected error while polling ({0})")]
    Poll(String),
    #[error("Wrong event size ({0} bytes)")]
    Malformed(usize),
}

/// Source of kernel-observed events.
pub(crate) trait EventSource {
    /// Wait at most `timeout` for an event and return at most one.
    fn poll(&mut self, timeout: Duration) -> Result<Option<CaptureEvent>, EventSourceError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Sent,
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Sent => write!(f, "Sent"),
            Direction::Received => write!(f, "Rcvd"),
        }
    }
}

/// Identity of a task.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct TaskInfo {
    pub(crate) pid: u32,
    pub(crate) tid: u32,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    /// Short command name as seen by the kernel.
    pub(crate) comm: String,
    /// Full executable path, when it could be resolved.
    pub(crate) exe: Option<String>,
}

impl TaskInfo {
    /// Best available name for the task.
    pub(crate) fn path(&self) -> &str {
        self.exe.as_deref().unwrap_or(&self.comm)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct KubeInfo {
    /// Workload (container) name.
    pub(crate) name: String,
    pub(crate) pod: String,
    pub(crate) namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ContainerInfo {
    pub(crate) id: String,
    pub(crate) name: Option<String>,
    pub(crate) kube: Option<KubeInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CaptureEvent {
    /// Kernel monotonic timestamp, in nanoseconds.
    pub(crate) ktime: u64,
    /// Name of the interface the traffic went through.
    pub(crate) ifname: String,
    pub(crate) direction: Direction,
    pub(crate) proto: u8,
    pub(crate) saddr: IpAddr,
    pub(crate) daddr: IpAddr,
    pub(crate) sport: u16,
    pub(crate) dport: u16,
    pub(crate) latency_usec: u32,
    pub(crate) retransmissions: u16,
    pub(crate) process: TaskInfo,
    pub(crate) parent: TaskInfo,
    pub(crate) container: Option<ContainerInfo>,
}

impl CaptureEvent {
    pub(crate) fn ip_version(&self) -> u8 {
        match self.saddr {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    pub(crate) fn proto_name(&self) -> String {
        match self.proto {
            IPPROTO_TCP => "TCP".to_string(),
            IPPROTO_UDP => "UDP".to_string(),
            x => format!("proto {x}"),
        }
    }
}
