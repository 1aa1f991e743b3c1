use std::sync::Arc;

use super::BURST_SIZE;
use crate::eventdev::{Event, EventDevice};
use crate::graph::Streams;
use crate::node::{expect_data, Edge, Node, NodeInit};
use crate::packet::Mbuf;
use crate::Result;

/// Polls one event port and hands every dequeued packet to a single edge.
pub struct EventDevRx {
    dev: Option<Arc<dyn EventDevice>>,
    dev_id: u8,
    port: u8,
    next: Edge,
    events: Vec<Event>,
}

impl EventDevRx {
    pub fn new() -> Self {
        Self {
            dev: None,
            dev_id: 0,
            port: 0,
            next: 0,
            events: Vec::with_capacity(BURST_SIZE),
        }
    }
}

impl Node for EventDevRx {
    fn init(&mut self, ctx: &mut NodeInit<'_>) -> Result<()> {
        let data = expect_data!(ctx, EventRx);

        log::debug!(
            "{}: dev {} port {} mempool {} next {}",
            ctx.name,
            data.dev_id,
            data.port,
            data.pool,
            data.next
        );

        self.dev = Some(data.dev);
        self.dev_id = data.dev_id;
        self.port = data.port;
        self.next = data.next;

        Ok(())
    }

    fn process(&mut self, out: &mut Streams<'_>, _objs: Vec<Mbuf>) -> usize {
        let Some(dev) = &self.dev else {
            return 0;
        };

        let n = dev.dequeue_burst(self.dev_id, self.port, &mut self.events, BURST_SIZE);
        if n == 0 {
            return 0;
        }

        out.enqueue_burst(self.next, self.events.drain(..).map(Event::into_mbuf));
        n
    }
}
