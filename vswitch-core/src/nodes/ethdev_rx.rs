use std::sync::Arc;

use super::BURST_SIZE;
use crate::device::EthDevice;
use crate::graph::Streams;
use crate::node::{expect_data, Node, NodeInit};
use crate::packet::Mbuf;
use crate::Result;

/// Polls one RX queue of a link. Its only edge is set at assembly.
pub struct EthDevRx {
    dev: Option<Arc<dyn EthDevice>>,
    port: u16,
    queue: u16,
    pkts: Vec<Mbuf>,
}

impl EthDevRx {
    pub fn new() -> Self {
        Self {
            dev: None,
            port: 0,
            queue: 0,
            pkts: Vec::with_capacity(BURST_SIZE),
        }
    }
}

impl Node for EthDevRx {
    fn init(&mut self, ctx: &mut NodeInit<'_>) -> Result<()> {
        let data = expect_data!(ctx, EthRx);
        self.dev = Some(data.dev);
        self.port = data.port;
        self.queue = data.queue;
        Ok(())
    }

    fn process(&mut self, out: &mut Streams<'_>, _objs: Vec<Mbuf>) -> usize {
        let Some(dev) = &self.dev else {
            return 0;
        };

        let n = dev.rx_burst(self.port, self.queue, &mut self.pkts, BURST_SIZE);
        if n > 0 {
            out.enqueue_burst(0, self.pkts.drain(..));
        }
        n
    }
}
