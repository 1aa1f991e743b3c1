use std::sync::Arc;

use crate::device::EthDevice;
use crate::graph::Streams;
use crate::node::{expect_data, Node, NodeInit};
use crate::packet::Mbuf;
use crate::Result;

/// Transmits on one TX queue of a link; what the ring refuses is dropped.
pub struct EthDevTx {
    dev: Option<Arc<dyn EthDevice>>,
    port: u16,
    queue: u16,
}

impl EthDevTx {
    pub fn new() -> Self {
        Self {
            dev: None,
            port: 0,
            queue: 0,
        }
    }
}

impl Node for EthDevTx {
    fn init(&mut self, ctx: &mut NodeInit<'_>) -> Result<()> {
        let data = expect_data!(ctx, EthTx);
        self.dev = Some(data.dev);
        self.port = data.port;
        self.queue = data.queue;
        Ok(())
    }

    fn process(&mut self, out: &mut Streams<'_>, mut objs: Vec<Mbuf>) -> usize {
        let n = objs.len();

        if let Some(dev) = &self.dev {
            let sent = dev.tx_burst(self.port, self.queue, &mut objs);
            if sent < n {
                log::trace!("port {} queue {}: {} not sent", self.port, self.queue, n - sent);
            }
        }
        out.enqueue_burst(0, objs);

        n
    }
}
