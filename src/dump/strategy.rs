//! # Strategies
//!
//! The two ways of running a capture. The mode is chosen once at startup and
//! never changes.
//!
//! - Correlation: a host interface is selected. Live frames are read to keep
//!   the device active, and events seen on that interface are reported on the
//!   diagnostic stream. Nothing but the header goes to the sink.
//! - Synthetic: no host interface. Every event becomes a record of the sink.

use std::{fmt::Write as _, io::Write, thread, time::Duration};

use anyhow::Result;
use log::{debug, error, info};
use pcap_file::DataLink;

use super::{
    record::Record,
    sink::PcapSink,
};
use crate::{
    core::events::{CaptureEvent, EventSource, EventSourceError},
    interfaces::EBPF_INTERFACE,
};

/// Event poll bound when live frames are read in between.
pub(crate) const CORRELATION_POLL: Duration = Duration::from_millis(1);
/// Event poll bound when events are the only input.
pub(crate) const SYNTHETIC_POLL: Duration = Duration::from_millis(10);

const SNAPLEN: i32 = 1500;

pub(crate) trait CaptureStrategy {
    /// Run one iteration of the capture loop.
    fn step(&mut self, events: &mut dyn EventSource) -> Result<()>;
    /// Called once, when the loop ends.
    fn finish(&mut self) -> Result<()>;
}

/// Mode selected from the interface option.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ModeKind {
    Correlation(String),
    Synthetic,
}

impl ModeKind {
    /// The event source interface names no host device: selecting it, with the
    /// same prefix match as the link type query, is the same as selecting
    /// nothing.
    pub(crate) fn select(interface: Option<&str>) -> Self {
        match interface {
            Some(ifname) if !EBPF_INTERFACE.is_selected_by(ifname) => {
                ModeKind::Correlation(ifname.to_string())
            }
            _ => ModeKind::Synthetic,
        }
    }
}

/// Link-layer type of the synthetic records.
pub(crate) const SYNTHETIC_DATALINK: DataLink = DataLink::NULL;

/// Map a live device link-layer type to the one declared in the sink header.
pub(crate) fn device_datalink(linktype: pcap::Linktype) -> DataLink {
    DataLink::from(linktype.0 as u32)
}

/// Source of live link-layer frames.
pub(crate) trait FrameSource {
    /// Read at most one frame without blocking; returns whether one was read.
    fn next_frame(&mut self) -> Result<bool>;
    /// Link-layer type of the frames.
    fn datalink(&self) -> DataLink;
}

pub(crate) struct LiveFrames {
    capture: pcap::Capture<pcap::Active>,
}

impl LiveFrames {
    pub(crate) fn open(ifname: &str) -> Result<Self> {
        let capture = pcap::Capture::from_device(ifname)?
            .promisc(true)
            .snaplen(SNAPLEN)
            .timeout(1)
            .open()?
            .setnonblock()?;
        Ok(Self { capture })
    }
}

impl FrameSource for LiveFrames {
    fn next_frame(&mut self) -> Result<bool> {
        match self.capture.next_packet() {
            Ok(_) => Ok(true),
            Err(pcap::Error::TimeoutExpired) | Err(pcap::Error::NoMorePackets) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn datalink(&self) -> DataLink {
        device_datalink(self.capture.get_datalink())
    }
}

/// One line description of an event, for correlation with live traffic.
pub(crate) fn summary(event: &CaptureEvent) -> String {
    let (p, f) = (&event.process, &event.parent);
    let mut line = format!(
        "[{}][{}][IPv{}/{}][pid/tid: {}/{} [{}], uid/gid: {}/{}][father pid/tid: {}/{} [{}], uid/gid: {}/{}]",
        event.ifname,
        event.direction,
        event.ip_version(),
        event.proto_name(),
        p.pid,
        p.tid,
        p.path(),
        p.uid,
        p.gid,
        f.pid,
        f.tid,
        f.path(),
        f.uid,
        f.gid,
    );

    if let Some(container) = &event.container {
        let _ = write!(line, "[containerID: {}]", container.id);
        if let Some(name) = &container.name {
            let _ = write!(line, "[docker_name: {name}]");
        }
        if let Some(kube) = &container.kube {
            let _ = write!(
                line,
                "[kube_name: {}][kube_pod: {}][kube_ns: {}]",
                kube.name, kube.pod, kube.namespace
            );
        }
    }

    line
}

/// A failed poll returns at once: wait as long as the poll would have so a
/// persistent failure does not spin.
fn poll_failed(e: EventSourceError, bound: Duration) {
    error!("{e}");
    thread::sleep(bound);
}

pub(crate) struct Correlation<W: Write> {
    frames: Box<dyn FrameSource>,
    sink: PcapSink<W>,
    interface: String,
    frames_seen: u64,
}

impl<W: Write> Correlation<W> {
    pub(crate) fn new(frames: Box<dyn FrameSource>, sink: PcapSink<W>, interface: String) -> Self {
        Self {
            frames,
            sink,
            interface,
            frames_seen: 0,
        }
    }

    fn process(&self, event: CaptureEvent) {
        match event.ifname == self.interface {
            true => info!("{}", summary(&event)),
            false => info!("Skipping event for interface {}", event.ifname),
        }
    }

    #[cfg(test)]
    pub(crate) fn into_sink(self) -> PcapSink<W> {
        self.sink
    }
}

impl<W: Write> CaptureStrategy for Correlation<W> {
    fn step(&mut self, events: &mut dyn EventSource) -> Result<()> {
        // Frames are only read to keep the device active.
        if self.frames.next_frame()? {
            self.frames_seen += 1;
        }

        match events.poll(CORRELATION_POLL) {
            Ok(Some(event)) => self.process(event),
            Ok(None) => (),
            Err(e) => poll_failed(e, CORRELATION_POLL),
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        debug!(
            "Correlation on {} done, {} frames seen",
            self.interface, self.frames_seen
        );
        self.sink.flush()
    }
}

pub(crate) struct Synthetic<W: Write> {
    sink: PcapSink<W>,
    written: u64,
}

impl<W: Write> Synthetic<W> {
    pub(crate) fn new(sink: PcapSink<W>) -> Self {
        Self { sink, written: 0 }
    }

    fn process(&mut self, event: CaptureEvent) -> Result<()> {
        let record = Record::from_event(&event)?;
        self.sink.write_record(&record)?;
        self.written += 1;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn into_sink(self) -> PcapSink<W> {
        self.sink
    }
}

impl<W: Write> CaptureStrategy for Synthetic<W> {
    fn step(&mut self, events: &mut dyn EventSource) -> Result<()> {
        match events.poll(SYNTHETIC_POLL) {
            Ok(Some(event)) => {
                // Best effort: a lost record does not stop the capture.
                if let Err(e) = self.process(event) {
                    error!("Error while writing packet: {e}");
                }
            }
            Ok(None) => (),
            Err(e) => poll_failed(e, SYNTHETIC_POLL),
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        debug!("Synthetic capture done, {} records written", self.written);
        self.sink.flush()
    }
}

pub(crate) enum CaptureMode<W: Write> {
    Correlation(Correlation<W>),
    Synthetic(Synthetic<W>),
}

impl<W: Write> CaptureStrategy for CaptureMode<W> {
    fn step(&mut self, events: &mut dyn EventSource) -> Result<()> {
        match self {
            CaptureMode::Correlation(c) => c.step(events),
            CaptureMode::Synthetic(s) => s.step(events),
        }
    }

    fn finish(&mut self) -> Result<()> {
        match self {
            CaptureMode::Correlation(c) => c.finish(),
            CaptureMode::Synthetic(s) => s.finish(),
        }
    }
}
