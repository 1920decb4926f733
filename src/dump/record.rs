//! # Record
//!
//! Synthetic records carrying one event each. The payload is the 4-byte
//! big-endian pseudo-protocol tag followed by a fixed-size snapshot of the
//! event, all numbers in network byte order and strings NUL-padded:
//!
//! | Field                                   | Size       |
//! |-----------------------------------------|------------|
//! | ktime                                   | 8          |
//! | ifname                                  | 16         |
//! | ip version, direction, protocol, pad    | 4          |
//! | source address, destination address     | 16 + 16    |
//! | source port, destination port           | 2 + 2      |
//! | latency (us)                            | 4          |
//! | retransmissions, pad                    | 2 + 2      |
//! | process, parent (pid, tid, uid, gid,    | 160 + 160  |
//! |   comm[16], exe[128])                   |            |
//! | container id, container name, workload, | 5 x 64     |
//! |   pod, namespace                        |            |

use std::{
    io::{self, Write},
    net::IpAddr,
    time::{Duration, SystemTime},
};

use byteorder::{BigEndian, WriteBytesExt};

use crate::core::events::{CaptureEvent, Direction, TaskInfo};

/// Pseudo-protocol tag identifying eBPF event records.
pub(crate) const SOCKET_LIBEBPF: u32 = 2019;
pub(crate) const TAG_LEN: usize = 4;

const NAME_LEN: usize = 16;
const PATH_LEN: usize = 128;
const ID_LEN: usize = 64;
const ADDR_LEN: usize = 16;
const TASK_LEN: usize = 4 * 4 + NAME_LEN + PATH_LEN;

pub(crate) const SNAPSHOT_LEN: usize =
    8 + NAME_LEN + 4 + 2 * ADDR_LEN + 4 + 4 + 4 + 2 * TASK_LEN + 5 * ID_LEN;
pub(crate) const RECORD_LEN: usize = TAG_LEN + SNAPSHOT_LEN;

/// One record of the sink.
#[derive(Debug)]
pub(crate) struct Record {
    /// Time since the epoch.
    pub(crate) timestamp: Duration,
    pub(crate) payload: Vec<u8>,
}

impl Record {
    /// Build the record of an event, timestamped now.
    pub(crate) fn from_event(event: &CaptureEvent) -> io::Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Ok(Self {
            timestamp,
            payload: encode(event)?,
        })
    }

    pub(crate) fn len(&self) -> u32 {
        self.payload.len() as u32
    }
}

fn put_str<W: Write>(w: &mut W, s: &str, len: usize) -> io::Result<()> {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    w.write_all(&bytes[..n])?;
    w.write_all(&vec![0; len - n])
}

fn put_addr<W: Write>(w: &mut W, addr: &IpAddr) -> io::Result<()> {
    match addr {
        IpAddr::V4(v4) => {
            w.write_all(&v4.octets())?;
            w.write_all(&[0; ADDR_LEN - 4])
        }
        IpAddr::V6(v6) => w.write_all(&v6.octets()),
    }
}

fn put_task<W: Write>(w: &mut W, task: &TaskInfo) -> io::Result<()> {
    w.write_u32::<BigEndian>(task.pid)?;
    w.write_u32::<BigEndian>(task.tid)?;
    w.write_u32::<BigEndian>(task.uid)?;
    w.write_u32::<BigEndian>(task.gid)?;
    put_str(w, &task.comm, NAME_LEN)?;
    put_str(w, task.exe.as_deref().unwrap_or(""), PATH_LEN)
}

/// Tag + snapshot of an event.
pub(crate) fn encode(event: &CaptureEvent) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(RECORD_LEN);
    buf.write_u32::<BigEndian>(SOCKET_LIBEBPF)?;

    buf.write_u64::<BigEndian>(event.ktime)?;
    put_str(&mut buf, &event.ifname, NAME_LEN)?;
    buf.write_u8(event.ip_version())?;
    buf.write_u8(match event.direction {
        Direction::Sent => 1,
        Direction::Received => 0,
    })?;
    buf.write_u8(event.proto)?;
    buf.write_u8(0)?;
    put_addr(&mut buf, &event.saddr)?;
    put_addr(&mut buf, &event.daddr)?;
    buf.write_u16::<BigEndian>(event.sport)?;
    buf.write_u16::<BigEndian>(event.dport)?;
    buf.write_u32::<BigEndian>(event.latency_usec)?;
    buf.write_u16::<BigEndian>(event.retransmissions)?;
    buf.write_u16::<BigEndian>(0)?;
    put_task(&mut buf, &event.process)?;
    put_task(&mut buf, &event.parent)?;

    let container = event.container.as_ref();
    let kube = container.and_then(|c| c.kube.as_ref());
    put_str(&mut buf, container.map(|c| c.id.as_str()).unwrap_or(""), ID_LEN)?;
    put_str(
        &mut buf,
        container.and_then(|c| c.name.as_deref()).unwrap_or(""),
        ID_LEN,
    )?;
    put_str(&mut buf, kube.map(|k| k.name.as_str()).unwrap_or(""), ID_LEN)?;
    put_str(&mut buf, kube.map(|k| k.pod.as_str()).unwrap_or(""), ID_LEN)?;
    put_str(&mut buf, kube.map(|k| k.namespace.as_str()).unwrap_or(""), ID_LEN)?;

    debug_assert_eq!(buf.len(), RECORD_LEN);
    Ok(buf)
}
