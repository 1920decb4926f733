//! # Sink
//!
//! Capture file written to the named pipe read by the frontend.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};
use log::debug;
use pcap_file::{
    pcap::{PcapHeader, PcapPacket, PcapWriter},
    DataLink,
};

use super::record::{Record, RECORD_LEN};

pub(crate) struct PcapSink<W: Write> {
    writer: PcapWriter<W>,
}

impl PcapSink<BufWriter<File>> {
    /// Open (or create) the sink at `path` and write the capture header.
    pub(crate) fn create(path: &Path, datalink: DataLink) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Unable to create file {}", path.display()))?;
        debug!("Opened sink {} ({:?})", path.display(), datalink);

        Self::new(BufWriter::new(file), datalink)
            .with_context(|| format!("Unable to write file {} header", path.display()))
    }
}

impl<W: Write> PcapSink<W> {
    pub(crate) fn new(writer: W, datalink: DataLink) -> Result<Self> {
        let header = PcapHeader {
            datalink,
            snaplen: RECORD_LEN as u32,
            ..Default::default()
        };

        let mut sink = Self {
            writer: PcapWriter::with_header(writer, header)?,
        };
        // The consumer waits for the header before anything else.
        sink.flush()?;
        Ok(sink)
    }

    /// Write a single record and push it to the consumer right away.
    pub(crate) fn write_record(&mut self, record: &Record) -> Result<()> {
        let packet = PcapPacket::new(record.timestamp, record.len(), &record.payload);
        self.writer.write_packet(&packet)?;
        self.flush()
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.writer.get_mut().flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> W {
        self.writer.into_writer()
    }
}
