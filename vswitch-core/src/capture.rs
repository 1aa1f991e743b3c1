//! Packet capture of a graph walk, written as a classic pcap file.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use pcap_file::pcap::{PcapPacket, PcapWriter};

use crate::packet::Mbuf;
use crate::Result;

pub struct Capture {
    path: PathBuf,
    writer: PcapWriter<File>,
    left: usize,
}

impl Capture {
    /// Truncate `path` and capture at most `limit` packets into it.
    pub fn create(path: &Path, limit: usize) -> Result<Self> {
        let writer = PcapWriter::new(File::create(path)?)?;
        log::info!("capturing {} packets to {}", limit, path.display());

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            left: limit,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_full(&self) -> bool {
        self.left == 0
    }

    /// Record packets until the limit is reached. Returns how many were
    /// written.
    pub fn record(&mut self, objs: &[Mbuf]) -> Result<usize> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let n = objs.len().min(self.left);
        for mbuf in &objs[..n] {
            let data = mbuf.data();
            self.writer
                .write_packet(&PcapPacket::new(ts, data.len() as u32, data))?;
        }
        self.left -= n;

        Ok(n)
    }
}
