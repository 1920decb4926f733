//! # Bpf event source
//!
//! Loads the kernel instrumentation object, attaches its programs and reads the
//! raw records it pushes in its `events` ring buffer.

use std::{
    cell::RefCell,
    collections::VecDeque,
    mem,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::Path,
    rc::Rc,
    time::Duration,
};

use log::debug;

use super::{
    preprocess::Preprocessor, CaptureEvent, Direction, EventSource, EventSourceError, TaskInfo,
};

/// Name of the ring buffer map the instrumentation object reports events in.
pub(crate) const EVENTS_MAP: &str = "events";

/// Task identity, as reported by the kernel.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub(crate) struct RawTask {
    pub(crate) pid: u32,
    pub(crate) tid: u32,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) comm: [u8; 16],
}

/// Raw event, as reported by the kernel. Please keep in sync with the
/// instrumentation object definition.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub(crate) struct RawEvent {
    pub(crate) ktime: u64,
    pub(crate) ifname: [u8; 16],
    pub(crate) proc: RawTask,
    pub(crate) father: RawTask,
    pub(crate) ip_version: u8,
    pub(crate) sent_packet: u8,
    pub(crate) proto: u8,
    pub(crate) _pad: u8,
    pub(crate) latency_usec: u32,
    pub(crate) saddr: [u8; 16],
    pub(crate) daddr: [u8; 16],
    pub(crate) sport: u16,
    pub(crate) dport: u16,
    pub(crate) retransmissions: u16,
    pub(crate) _pad2: u16,
}

unsafe impl plain::Plain for RawEvent {}

/// Convert a NUL-terminated (or full) buffer to a String.
pub(crate) fn c_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn ip_addr(version: u8, raw: &[u8; 16]) -> IpAddr {
    match version {
        6 => IpAddr::V6(Ipv6Addr::from(*raw)),
        _ => IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])),
    }
}

impl From<&RawTask> for TaskInfo {
    fn from(raw: &RawTask) -> Self {
        TaskInfo {
            pid: raw.pid,
            tid: raw.tid,
            uid: raw.uid,
            gid: raw.gid,
            comm: c_str(&raw.comm),
            exe: None,
        }
    }
}

impl RawEvent {
    pub(crate) fn parse(data: &[u8]) -> Result<Self, EventSourceError> {
        if data.len() != mem::size_of::<RawEvent>() {
            return Err(EventSourceError::Malformed(data.len()));
        }

        let mut raw = RawEvent::default();
        plain::copy_from_bytes(&mut raw, data)
            .map_err(|_| EventSourceError::Malformed(data.len()))?;
        Ok(raw)
    }

    /// Build an event out of the raw kernel data only; process paths and
    /// container identity are filled in by the preprocessor.
    pub(crate) fn to_event(&self) -> CaptureEvent {
        CaptureEvent {
            ktime: self.ktime,
            ifname: c_str(&self.ifname),
            direction: match self.sent_packet {
                0 => Direction::Received,
                _ => Direction::Sent,
            },
            proto: self.proto,
            saddr: ip_addr(self.ip_version, &self.saddr),
            daddr: ip_addr(self.ip_version, &self.daddr),
            sport: self.sport,
            dport: self.dport,
            latency_usec: self.latency_usec,
            retransmissions: self.retransmissions,
            process: TaskInfo::from(&self.proc),
            parent: TaskInfo::from(&self.father),
            container: None,
        }
    }
}

pub(crate) struct BpfEventSource {
    // Dropped first, before the maps it reads from go away.
    ring: libbpf_rs::RingBuffer<'static>,
    queue: Rc<RefCell<VecDeque<Vec<u8>>>>,
    preprocessor: Preprocessor,
    _links: Vec<libbpf_rs::Link>,
    _object: libbpf_rs::Object,
}

impl BpfEventSource {
    pub(crate) fn open(path: &Path, preprocessor: Preprocessor) -> Result<Self, EventSourceError> {
        let load_err = |e: libbpf_rs::Error| EventSourceError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        debug!("Loading eBPF object {}", path.display());
        let mut object = libbpf_rs::ObjectBuilder::default()
            .open_file(path)
            .map_err(load_err)?
            .load()
            .map_err(load_err)?;

        let mut links = Vec::new();
        for prog in object.progs_iter_mut() {
            let name = prog.name().to_string();
            debug!("Attaching program {name}");
            links.push(prog.attach().map_err(|e| EventSourceError::Attach {
                name,
                reason: e.to_string(),
            })?);
        }

        let map = object
            .map(EVENTS_MAP)
            .ok_or_else(|| EventSourceError::MissingMap(EVENTS_MAP.to_string()))?;

        let queue = Rc::new(RefCell::new(VecDeque::new()));
        let pending = Rc::clone(&queue);
        let process_event = move |data: &[u8]| -> i32 {
            pending.borrow_mut().push_back(data.to_vec());
            0
        };

        let mut rb = libbpf_rs::RingBufferBuilder::new();
        rb.add(map, process_event).map_err(load_err)?;
        let ring = rb.build().map_err(load_err)?;

        Ok(Self {
            ring,
            queue,
            preprocessor,
            _links: links,
            _object: object,
        })
    }
}

impl EventSource for BpfEventSource {
    fn poll(&mut self, timeout: Duration) -> Result<Option<CaptureEvent>, EventSourceError> {
        if self.queue.borrow().is_empty() {
            if let Err(e) = self.ring.poll(timeout) {
                match e.kind() {
                    libbpf_rs::ErrorKind::Interrupted => (),
                    _ => return Err(EventSourceError::Poll(e.to_string())),
                }
            }
        }

        let data = match self.queue.borrow_mut().pop_front() {
            Some(data) => data,
            None => return Ok(None),
        };

        let mut event = RawEvent::parse(&data)?.to_event();
        self.preprocessor.process(&mut event);
        Ok(Some(event))
    }
}
