//! # Dump
//!
//! Runs the capture: polls kernel events and, depending on the selected
//! interface, writes them as synthetic records to the sink or correlates them
//! with the traffic of a live interface. The loop only ends on a termination
//! signal.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info};

use crate::{
    cli::SessionConfig,
    core::{
        events::{
            bpf::BpfEventSource,
            preprocess::{PodDirectory, Preprocessor},
            EventSource,
        },
        inspect::collection_prerequisites,
        kube::Kubectl,
        signals::Running,
    },
};

pub(crate) mod record;
pub(crate) mod sink;
pub(crate) mod strategy;

use sink::PcapSink;
use strategy::{
    CaptureMode, CaptureStrategy, Correlation, FrameSource, LiveFrames, ModeKind, Synthetic,
    SYNTHETIC_DATALINK,
};

/// Set up the event source, the sink and the live interface, then capture
/// until a termination signal is received.
pub(crate) fn capture(config: &SessionConfig) -> Result<()> {
    debug!(
        "Capturing [ifname: {}][fifo: {}]",
        config.interface.as_deref().unwrap_or("<NULL>"),
        config
            .fifo
            .as_ref()
            .map(|f| f.display().to_string())
            .unwrap_or_else(|| "<NULL>".to_string())
    );
    let fifo = config
        .fifo
        .as_deref()
        .ok_or_else(|| anyhow!("No --fifo given, nowhere to write the capture"))?;

    // Check if we can.
    collection_prerequisites()?;

    let pods = Kubectl::detect()
        .found("orchestration tool")
        .map(|kubectl| PodDirectory::new(Box::new(kubectl)));
    let mut source = BpfEventSource::open(&config.ebpf_object, Preprocessor::new(pods))
        .context("Unable to initialize the eBPF event source")?;

    // The live device is opened first, the sink header declares its type.
    let mut mode = match ModeKind::select(config.interface.as_deref()) {
        ModeKind::Correlation(ifname) => {
            let frames = LiveFrames::open(&ifname)
                .with_context(|| format!("Unable to open interface {ifname}"))?;
            let sink = PcapSink::create(fifo, frames.datalink())?;
            CaptureMode::Correlation(Correlation::new(Box::new(frames), sink, ifname))
        }
        ModeKind::Synthetic => {
            CaptureMode::Synthetic(Synthetic::new(PcapSink::create(fifo, SYNTHETIC_DATALINK)?))
        }
    };

    let mut run = Running::new();
    run.register_term_signals()
        .context("Unable to install SIGINT/SIGTERM/SIGQUIT signal handlers")?;

    if let Some(name) = config.display_name() {
        info!("Capture '{name}' started");
    }
    capture_loop(&mut mode, &mut source, &run)
}

/// Step the strategy until `run` is terminated. A failing step ends the loop;
/// the strategy is finished in all cases.
pub(crate) fn capture_loop(
    mode: &mut dyn CaptureStrategy,
    source: &mut dyn EventSource,
    run: &Running,
) -> Result<()> {
    let mut res = Ok(());
    while run.running() {
        if let Err(e) = mode.step(source) {
            error!("Capture stopped: {e}");
            res = Err(e);
            break;
        }
    }

    debug!("Exiting...");
    mode.finish()?;
    res
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc, time::Duration};

    use pcap_file::{pcap::PcapReader, DataLink};

    use super::*;
    use crate::{
        core::events::{testing::*, CaptureEvent, EventSourceError},
        dump::strategy::testing::FakeFrames,
    };

    /// Terminates the run once the replayed events are exhausted, the way an
    /// interrupt would.
    struct InterruptAfter {
        inner: ReplaySource,
        run: Running,
    }

    impl EventSource for InterruptAfter {
        fn poll(&mut self, timeout: Duration) -> Result<Option<CaptureEvent>, EventSourceError> {
            let event = self.inner.poll(timeout)?;
            if event.is_none() {
                self.run.terminate();
            }
            Ok(event)
        }
    }

    #[test]
    fn synthetic_until_interrupted() {
        let run = Running::new();
        let mut source = InterruptAfter {
            inner: ReplaySource::new((0..7).map(|_| event("eth0")).collect()),
            run: run.clone(),
        };
        let sink = PcapSink::new(Vec::new(), DataLink::NULL).unwrap();
        let mut mode = CaptureMode::Synthetic(Synthetic::new(sink));

        capture_loop(&mut mode, &mut source, &run).unwrap();
        assert!(!run.running());

        let bytes = match mode {
            CaptureMode::Synthetic(s) => s.into_sink().into_inner(),
            CaptureMode::Correlation(_) => panic!("wrong mode"),
        };
        let mut reader = PcapReader::new(&bytes[..]).unwrap();
        let mut count = 0;
        while let Some(packet) = reader.next_packet() {
            packet.unwrap();
            count += 1;
        }
        assert_eq!(count, 7);
    }

    #[test]
    fn correlation_until_interrupted() {
        let run = Running::new();
        let mut source = InterruptAfter {
            inner: ReplaySource::new(vec![event("veth7"), event("eth0")]),
            run: run.clone(),
        };
        let reads = Rc::new(Cell::new(0));
        let frames = FakeFrames {
            reads: Rc::clone(&reads),
        };
        let sink = PcapSink::new(Vec::new(), frames.datalink()).unwrap();
        let mut mode =
            CaptureMode::Correlation(Correlation::new(Box::new(frames), sink, "veth7".to_string()));

        capture_loop(&mut mode, &mut source, &run).unwrap();
        assert!(!run.running());
        assert_eq!(source.inner.polls, 3);
        assert_eq!(reads.get(), 3);

        let bytes = match mode {
            CaptureMode::Correlation(c) => c.into_sink().into_inner(),
            CaptureMode::Synthetic(_) => panic!("wrong mode"),
        };
        let mut reader = PcapReader::new(&bytes[..]).unwrap();
        assert_eq!(reader.header().datalink, DataLink::ETHERNET);
        assert!(reader.next_packet().is_none());
    }

    #[test]
    fn terminated_before_start() {
        let mut run = Running::new();
        run.terminate();
        let mut source = ReplaySource::new(vec![event("eth0")]);
        let sink = PcapSink::new(Vec::new(), DataLink::NULL).unwrap();
        let mut mode = CaptureMode::Synthetic(Synthetic::new(sink));

        capture_loop(&mut mode, &mut source, &run).unwrap();
        assert_eq!(source.polls, 0);
    }

    struct BrokenStep;

    impl CaptureStrategy for BrokenStep {
        fn step(&mut self, _: &mut dyn EventSource) -> Result<()> {
            Err(anyhow!("device went down"))
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failing_step_ends_loop() {
        let run = Running::new();
        let mut source = ReplaySource::default();
        assert!(capture_loop(&mut BrokenStep, &mut source, &run).is_err());
        assert!(run.running());
    }

    #[test]
    fn capture_needs_a_fifo() {
        let config = SessionConfig::default();
        assert!(capture(&config).is_err());
    }
}
